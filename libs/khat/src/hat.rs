// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod tables;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::ops::Range;
use core::sync::atomic::Ordering;

pub(crate) use tables::{Leaf, update_entry};

use crate::arch::{self, Arch, COMPAT32_TOP_LEVEL, TOP_LEVEL};
use crate::context::{Context, ContextFlags, ContextId, ContextState};
use crate::cpu_set::{CpuSet, MAX_CPUS};
use crate::flush::Flush;
use crate::frame_alloc::FrameAllocator;
use crate::node::{Backing, Node, NodeArena, NodeHandle};
use crate::page::{Mapping, Page, PageDirectory};
use crate::percpu::CpuState;
use crate::pte::Pte;
use crate::registry::Registry;
use crate::walk::Walk;
use crate::{
    AddressRangeExt, Error, HatConfig, MemoryAttributes, PAGE_SIZE, PhysicalAddress,
    VirtualAddress,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoadFlags: u8 {
        /// Pin the translation. Pinned entries are counted per node and block reclaim.
        const LOCK = 1 << 0;
        /// Don't record the translation in the page's mapping list. Required for frames without
        /// a page descriptor, such as device memory.
        const NO_REVERSE_MAP = 1 << 1;
        /// Allow replacing the frame of an already valid entry. Only valid together with
        /// `NO_REVERSE_MAP`.
        const REMAP = 1 << 2;
        /// The range is expected to be shared with other contexts later on. Its tables are never
        /// reclaimed.
        const SHARE_HINT = 1 << 3;
        /// Don't copy referenced/modified status back into the page descriptor.
        const NO_RESYNC = 1 << 4;
    }
}

/// What [`Hat::sync`] does with the hardware status bits after copying them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Keep,
    /// Clear the bits so the next sync only reports new accesses.
    Clear,
}

/// Diagnostic snapshot of a page-table node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub owner: ContextId,
    pub level: u8,
    pub base: VirtualAddress,
    pub valid: u32,
    pub busy: u32,
    pub locked: u32,
    /// The node borrows another context's table.
    pub shared: bool,
    /// Number of contexts borrowing this node's table.
    pub share_count: u32,
}

/// One translation of a physical page, as recorded in its mapping list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    pub context: ContextId,
    pub virt: VirtualAddress,
    pub level: u8,
}

/// Work accumulated while a context is locked and carried out by [`Hat::finish`].
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub(crate) flush: Flush,
    /// Table frames that may only be returned once no CPU can cache them anymore.
    pub(crate) freed: Vec<PhysicalAddress>,
    /// Flush every CPU, because tables were shared with or taken from other contexts.
    pub(crate) everywhere: bool,
}

enum Installed {
    Done,
    /// The slot links a next-level table; retry one level down.
    TableInTheWay,
}

/// The hardware address translation layer.
pub struct Hat<A, F, P> {
    pub(crate) arch: A,
    pub(crate) frames: F,
    pub(crate) pages: P,
    pub(crate) config: HatConfig,
    pub(crate) arena: NodeArena,
    pub(crate) registry: Registry,
    pub(crate) kernel: Arc<Context>,
    pub(crate) cpus: Box<[CpuState]>,
    pub(crate) online: CpuSet,
}

impl<A, F, P> Hat<A, F, P>
where
    A: Arch,
    F: FrameAllocator,
    P: PageDirectory,
{
    /// Sets up the translation layer and the kernel context.
    ///
    /// The top-level entries named by [`HatConfig::kernel_top_entries`] are populated right away
    /// so the kernel half of every root stays the same for the lifetime of the system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the kernel root table could not be allocated.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid or the kernel tables could not be preallocated.
    pub fn new(arch: A, frames: F, pages: P, config: HatConfig) -> Result<Self, Error> {
        config.assert_valid();

        let registry = Registry::new();
        registry.init();

        let root = frames.allocate_frame()?;
        // Safety: we just allocated the frame
        unsafe { arch.zero_frame(root) };

        let arena = NodeArena::new();
        let id = registry.allocate_id();
        let root_node = arena.insert(Node::new(
            id,
            TOP_LEVEL,
            VirtualAddress::MIN,
            None,
            Backing::Owned(root),
        ));
        let kernel = Arc::new(Context::new(id, ContextFlags::KERNEL, root_node, Some(root)));

        let hat = Self {
            arch,
            frames,
            pages,
            config,
            arena,
            registry,
            kernel,
            cpus: (0..MAX_CPUS).map(|_| CpuState::new()).collect(),
            online: CpuSet::new(),
        };
        hat.preallocate_kernel();

        log::debug!("kernel context {:?} with root {root}", hat.kernel.id());
        Ok(hat)
    }

    fn preallocate_kernel(&self) {
        let ctx = &self.kernel;
        let mut st = ctx.lock();
        let mut pending = Pending::default();

        for index in self.config.kernel_top_entries.clone() {
            let virt =
                VirtualAddress::new(index * arch::level(TOP_LEVEL).page_size()).canonicalize();
            let handle = self
                .create_node(ctx, &mut st, virt, TOP_LEVEL - 1, None, false, &mut pending)
                .unwrap_or_else(|err| panic!("failed to preallocate kernel entry {index}: {err}"));
            // never reaped
            self.hold(handle);
        }

        self.finish(ctx, &mut st, &mut pending);
    }

    /// Carries out the shootdown and the deferred frees collected in `pending`.
    pub(crate) fn finish(&self, ctx: &Context, st: &mut ContextState, pending: &mut Pending) {
        let refresh = mem::take(&mut st.top_changed);

        if pending.everywhere {
            self.shootdown_everywhere(ctx, refresh);
        } else if refresh || !pending.flush.is_empty() {
            self.shootdown(ctx, &pending.flush, refresh);
        }
        pending.flush = Flush::new();
        pending.everywhere = false;

        for frame in pending.freed.drain(..) {
            // Safety: the table is unlinked and the shootdown above evicted it from every cache
            unsafe { self.frames.deallocate_frame(frame) };
        }
    }

    pub(crate) fn context(&self, id: ContextId) -> Option<Arc<Context>> {
        if id == self.kernel.id() {
            Some(Arc::clone(&self.kernel))
        } else {
            self.registry.get(id)
        }
    }

    // ===== context lifecycle =====

    /// Creates the context of a new address space.
    ///
    /// # Panics
    ///
    /// Panics if a 32-bit context is requested but [`HatConfig::compat32`] is disabled.
    pub fn create_context(&self, compat32: bool) -> Arc<Context> {
        assert!(
            !compat32 || self.config.compat32,
            "32-bit compatibility contexts are disabled"
        );

        let (flags, top) = if compat32 {
            (
                ContextFlags::SHADOW_COPY | ContextFlags::COMPAT32,
                COMPAT32_TOP_LEVEL,
            )
        } else {
            (ContextFlags::SHADOW_COPY, TOP_LEVEL)
        };

        let id = self.registry.allocate_id();
        let root = self.arena.insert(Node::new(
            id,
            top,
            VirtualAddress::MIN,
            None,
            Backing::Copied,
        ));
        let ctx = Arc::new(Context::new(id, flags, root, None));
        self.registry.register(Arc::clone(&ctx));

        log::debug!("created {id:?} ({flags:?})");
        ctx
    }

    /// Tears down an address space: waits out any in-flight reclaim, then removes every
    /// translation and releases every table.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` is not a process context or still runs on some CPU.
    pub fn destroy_context(&self, ctx: Arc<Context>) {
        assert!(ctx.is_user(), "{:?} can not be destroyed", ctx.id());

        ctx.freeze();
        assert!(
            ctx.cpus().is_empty(),
            "destroying {:?} while it runs on {:?}",
            ctx.id(),
            ctx.cpus()
        );
        self.registry.unregister(ctx.id());

        let mut st = ctx.lock();
        let mut pending = Pending::default();
        self.purge(&ctx, &mut st, &mut pending);
        self.finish(&ctx, &mut st, &mut pending);

        log::debug!("destroyed {:?}", ctx.id());
    }

    /// Removes every translation and node of `ctx`, its root included.
    pub(crate) fn purge(&self, ctx: &Context, st: &mut ContextState, pending: &mut Pending) {
        let handles: Vec<NodeHandle> = st.nodes.values().copied().collect();
        for handle in handles {
            let Some(node) = self.arena.try_get(handle) else {
                continue;
            };
            if node.is_borrowed() {
                self.unshare(ctx, st, handle, pending);
            } else if node.shares > 0 && node.parent.is_some() {
                self.orphan(ctx, st, handle, &node, pending);
            }
        }

        let mut cursor = VirtualAddress::MIN;
        while let Some(leaf) = self.next_leaf(ctx, st, cursor, VirtualAddress::MAX) {
            pending.flush.invalidate(leaf.range());
            self.remove_leaf(ctx, st, &leaf, pending);

            let Some(next) = leaf.virt.checked_add(arch::level(leaf.level).page_size()) else {
                break;
            };
            cursor = next;
        }

        assert!(
            st.nodes.is_empty(),
            "{:?} still holds {} nodes after purge",
            ctx.id(),
            st.nodes.len()
        );
        self.arena.remove(st.root);
    }

    /// Detaches a node other contexts still borrow from its dying owner. The table stays intact
    /// for the borrowers and is released by the last of them.
    fn orphan(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        handle: NodeHandle,
        node: &Node,
        pending: &mut Pending,
    ) {
        let Some(parent) = self.unlink(ctx, st, node, pending) else {
            return;
        };
        ctx.sub_mapped(node.level, node.valid as usize);
        self.arena.update(handle, |node| {
            node.zombie = true;
            node.parent = None;
        });
        pending.everywhere = true;

        log::debug!("{:?}: orphaned shared {handle:?} at {}", ctx.id(), node.base);
        self.maybe_reap(ctx, st, parent, pending);
    }

    // ===== loading =====

    /// Maps `len` bytes starting at `virt` to the physical range starting at `phys`.
    ///
    /// Every translation is installed at the largest page size that alignment and remaining
    /// length allow, falling back one level wherever a smaller table is already in place.
    /// Reloading a frame that is already mapped at an address updates its protection in place.
    ///
    /// Translations installed before a failure stay in place.
    ///
    /// # Errors
    ///
    /// - [`Error::LargePageCollision`] if part of the range lies inside an existing larger page.
    /// - [`Error::OutOfMemory`] if a page table could not be allocated.
    ///
    /// # Panics
    ///
    /// Panics if the range is unaligned or outside `ctx`, if a valid entry would silently change
    /// its frame without [`LoadFlags::REMAP`], or if the kernel context runs out of page-table
    /// memory.
    pub fn load(
        &self,
        ctx: &Context,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        len: usize,
        attributes: MemoryAttributes,
        flags: LoadFlags,
    ) -> Result<(), Error> {
        let mut st = ctx.lock();
        let mut pending = Pending::default();
        let result = self.load_locked(ctx, &mut st, virt, phys, len, attributes, flags, &mut pending);
        self.finish(ctx, &mut st, &mut pending);
        result
    }

    /// Maps consecutive pages starting at `virt` to `frames`, which need not be contiguous.
    /// Physically contiguous runs are loaded in one go and may end up as large pages.
    ///
    /// # Errors
    ///
    /// See [`Hat::load`].
    ///
    /// # Panics
    ///
    /// See [`Hat::load`].
    pub fn load_frames(
        &self,
        ctx: &Context,
        virt: VirtualAddress,
        frames: &[PhysicalAddress],
        attributes: MemoryAttributes,
        flags: LoadFlags,
    ) -> Result<(), Error> {
        let mut st = ctx.lock();
        let mut pending = Pending::default();

        let mut result = Ok(());
        let mut start = 0;
        while start < frames.len() {
            let mut end = start + 1;
            while end < frames.len() && frames[end] == frames[end - 1].add(PAGE_SIZE) {
                end += 1;
            }

            result = self.load_locked(
                ctx,
                &mut st,
                virt.add(start * PAGE_SIZE),
                frames[start],
                (end - start) * PAGE_SIZE,
                attributes,
                flags,
                &mut pending,
            );
            if result.is_err() {
                break;
            }
            start = end;
        }

        self.finish(ctx, &mut st, &mut pending);
        result
    }

    pub(crate) fn load_locked(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        len: usize,
        attributes: MemoryAttributes,
        flags: LoadFlags,
        pending: &mut Pending,
    ) -> Result<(), Error> {
        assert!(
            virt.is_aligned_to(PAGE_SIZE) && phys.is_aligned_to(PAGE_SIZE) && len % PAGE_SIZE == 0,
            "unaligned load of {len:#x} bytes at {virt} -> {phys}"
        );
        assert!(
            !flags.contains(LoadFlags::REMAP) || flags.contains(LoadFlags::NO_REVERSE_MAP),
            "REMAP requires NO_REVERSE_MAP"
        );
        if len == 0 {
            return Ok(());
        }
        let bounds = self.address_bounds(ctx);
        assert!(
            bounds.contains(&virt) && bounds.contains(&virt.add(len - 1)),
            "{:?} can not translate {len:#x} bytes at {virt}",
            ctx.id()
        );

        let mut offset = 0;
        while offset < len {
            let virt = virt.add(offset);
            let phys = phys.add(offset);

            let mut level = self.largest_level(ctx, virt, phys, len - offset);
            loop {
                match self.install(ctx, st, virt, phys, level, attributes, flags, pending)? {
                    Installed::Done => break,
                    Installed::TableInTheWay => {
                        debug_assert!(level > 0);
                        level -= 1;
                    }
                }
            }

            offset += arch::level(level).page_size();
        }

        Ok(())
    }

    fn largest_level(
        &self,
        ctx: &Context,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        remaining: usize,
    ) -> u8 {
        let max = self.config.max_page_level.min(ctx.top_level() - 1);
        (1..=max)
            .rev()
            .find(|&level| {
                let size = arch::level(level).page_size();
                virt.is_aligned_to(size) && phys.is_aligned_to(size) && remaining >= size
            })
            .unwrap_or(0)
    }

    fn install(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        level: u8,
        attributes: MemoryAttributes,
        flags: LoadFlags,
        pending: &mut Pending,
    ) -> Result<Installed, Error> {
        let share_hint = flags.contains(LoadFlags::SHARE_HINT);
        let handle = self.create_node(ctx, st, virt, level, None, share_hint, pending)?;

        self.hold(handle);
        let node = self.arena.update(handle, |node| {
            node.share_hint |= share_hint;
            *node
        });
        let installed = self.install_in(ctx, handle, &node, virt, phys, attributes, flags, pending);
        self.release(ctx, st, handle, pending);

        Ok(installed)
    }

    fn install_in(
        &self,
        ctx: &Context,
        handle: NodeHandle,
        node: &Node,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attributes: MemoryAttributes,
        flags: LoadFlags,
        pending: &mut Pending,
    ) -> Installed {
        if node.is_borrowed() {
            log::error!("{:?}: write through borrowed table", ctx.id());
            panic!(
                "{:?}: loading {virt} through {handle:?}, which is borrowed from another context",
                ctx.id()
            );
        }

        let level = node.level;
        let index = arch::level(level).index_of(virt);
        let slot = self.entry(ctx, node, index);
        let lock = flags.contains(LoadFlags::LOCK);
        let new = Pte::leaf(phys, level, attributes)
            .with(Pte::GLOBAL, ctx.is_kernel())
            .with(Pte::LOCKED, lock)
            .with(Pte::NO_REVERSE_MAP, flags.contains(LoadFlags::NO_REVERSE_MAP))
            .with(Pte::NO_RESYNC, flags.contains(LoadFlags::NO_RESYNC));
        let range = virt..virt.saturating_add(arch::level(level).page_size());

        let current = Pte::from_bits(slot.load(Ordering::Acquire));
        if current.is_vacant() {
            if !flags.contains(LoadFlags::NO_REVERSE_MAP) {
                self.page_of(phys)
                    .mappings()
                    .insert(Mapping::new(ctx.id(), handle, index));
            }
            slot.store(new.bits(), Ordering::Release);
            self.arena.update(handle, |node| {
                node.valid += 1;
                if lock {
                    node.locked += 1;
                }
            });
            ctx.add_mapped(level, 1);
            if node.shares > 0 {
                self.credit_borrowers(handle, level, true);
            }

            log::trace!("{:?}: {virt} -> {phys} at level {level}", ctx.id());
            return Installed::Done;
        }

        if current.is_table(level) {
            return Installed::TableInTheWay;
        }

        if current.address() == phys {
            let (old, updated) = update_entry(slot, |pte| {
                pte.with_attributes(attributes)
                    .with(Pte::LOCKED, pte.get(Pte::LOCKED) || lock)
            });
            if lock && !old.get(Pte::LOCKED) {
                self.arena.update(handle, |node| node.locked += 1);
            }
            if old.without_status() != updated.without_status() {
                pending.flush.invalidate(range);
            }
            return Installed::Done;
        }

        if !flags.contains(LoadFlags::REMAP) {
            log::error!(
                "{:?}: entry {index} of {handle:?} already maps {}, refusing to map {phys}",
                ctx.id(),
                current.address()
            );
            panic!(
                "{:?}: changing entry {index} of {handle:?} from {current:?} to {new:?} without REMAP",
                ctx.id()
            );
        }

        let old = Pte::from_bits(slot.swap(new.bits(), Ordering::AcqRel));
        if !old.get(Pte::NO_RESYNC) {
            self.record_status(old, level);
        }
        if !old.get(Pte::NO_REVERSE_MAP) {
            self.page_of(old.address()).mappings().remove(handle, index);
        }
        let was_locked = old.get(Pte::LOCKED);
        if was_locked != lock {
            self.arena.update(handle, |node| {
                if lock {
                    node.locked += 1;
                } else {
                    node.locked -= 1;
                }
            });
        }
        pending.flush.invalidate(range);

        log::trace!(
            "{:?}: remapped {virt} from {} to {phys}",
            ctx.id(),
            old.address()
        );
        Installed::Done
    }

    // ===== unloading =====

    /// Removes every translation in `[virt, virt + len)`.
    ///
    /// Removal is batched: contiguous runs are invalidated together and the shootdown is issued
    /// once per batch. `callback` is invoked with every removed run after the invalidation
    /// covering it completed. Unloading a range without translations does nothing.
    ///
    /// # Panics
    ///
    /// Panics if the range is unaligned or cuts a large page in two.
    pub fn unload(
        &self,
        ctx: &Context,
        virt: VirtualAddress,
        len: usize,
        callback: Option<&mut dyn FnMut(Range<VirtualAddress>)>,
    ) {
        assert!(
            virt.is_aligned_to(PAGE_SIZE) && len % PAGE_SIZE == 0,
            "unaligned unload of {len:#x} bytes at {virt}"
        );
        let end = virt.checked_add(len).unwrap_or(VirtualAddress::MAX);

        let mut st = ctx.lock();
        let mut pending = Pending::default();
        let mut runs = Vec::new();

        if len == PAGE_SIZE {
            if let Some(leaf) = self.next_leaf(ctx, &st, virt, end)
                && !leaf.node.is_borrowed()
            {
                self.assert_within(ctx, &(virt..end), &leaf);
                pending.flush.invalidate(leaf.range());
                self.remove_leaf(ctx, &mut st, &leaf, &mut pending);
                runs.push(leaf.range());
            }
        } else {
            self.unload_locked(ctx, &mut st, virt, end, &mut pending, &mut runs);
        }

        self.finish(ctx, &mut st, &mut pending);
        drop(st);

        if let Some(callback) = callback {
            for run in runs {
                callback(run);
            }
        }
    }

    pub(crate) fn unload_locked(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        virt: VirtualAddress,
        end: VirtualAddress,
        pending: &mut Pending,
        runs: &mut Vec<Range<VirtualAddress>>,
    ) {
        let mut cursor = virt;
        while let Some(leaf) = self.next_leaf(ctx, st, cursor, end) {
            if leaf.node.is_borrowed() {
                // detached through `Hat::detach` only
                match leaf.node.base.checked_add(arch::level(0).span()) {
                    Some(next) => cursor = next,
                    None => break,
                }
                continue;
            }

            self.assert_within(ctx, &(virt..end), &leaf);
            let range = leaf.range();
            if !pending.flush.try_invalidate(range.clone()) {
                self.finish(ctx, st, pending);
                pending.flush.invalidate(range.clone());
            }
            self.remove_leaf(ctx, st, &leaf, pending);

            match runs.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => runs.push(range.clone()),
            }
            cursor = range.end;
        }
    }

    fn assert_within(&self, ctx: &Context, range: &Range<VirtualAddress>, leaf: &Leaf) {
        assert!(
            range.covers(&leaf.range()),
            "{:?}: {range:?} covers part of the level {} page at {}",
            ctx.id(),
            leaf.level,
            leaf.virt
        );
    }

    pub(crate) fn remove_leaf(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        leaf: &Leaf,
        pending: &mut Pending,
    ) {
        let slot = self.entry(ctx, &leaf.node, leaf.index);
        let pte = Pte::from_bits(slot.swap(Pte::VACANT.bits(), Ordering::AcqRel));
        debug_assert!(!pte.is_vacant());

        self.retire_leaf(ctx, leaf.handle, &leaf.node, leaf.index, pte);
        self.maybe_reap(ctx, st, leaf.handle, pending);

        log::trace!("{:?}: unloaded {:?}", ctx.id(), leaf.range());
    }

    // ===== queries and in-place updates =====

    /// Translates `virt` through the software tables of `ctx`.
    ///
    /// Returns the physical address, the protection and the level of the leaf.
    pub fn lookup(
        &self,
        ctx: &Context,
        virt: VirtualAddress,
    ) -> Option<(PhysicalAddress, MemoryAttributes, u8)> {
        let st = ctx.lock();
        let leaf = self.next_leaf(
            ctx,
            &st,
            virt.align_down(PAGE_SIZE),
            virt.saturating_add(1),
        )?;
        let offset = virt.offset_from_unsigned(leaf.virt);
        Some((leaf.pte.address().add(offset), leaf.pte.attributes(), leaf.level))
    }

    /// Changes the protection of every translation in `[virt, virt + len)`, keeping frames and
    /// hardware status.
    ///
    /// # Panics
    ///
    /// Panics if the range cuts a large page in two.
    pub fn protect(
        &self,
        ctx: &Context,
        virt: VirtualAddress,
        len: usize,
        attributes: MemoryAttributes,
    ) {
        self.update_range(ctx, virt, len, |hat, ctx, leaf, pending| {
            let slot = hat.entry(ctx, &leaf.node, leaf.index);
            let (old, new) = update_entry(slot, |pte| pte.with_attributes(attributes));
            if old.without_status() != new.without_status() {
                pending.flush.invalidate(leaf.range());
            }
        });
    }

    /// Copies the referenced/modified bits of every translation in `[virt, virt + len)` into the
    /// page descriptors.
    ///
    /// # Panics
    ///
    /// Panics if the range cuts a large page in two.
    pub fn sync(&self, ctx: &Context, virt: VirtualAddress, len: usize, mode: SyncMode) {
        self.update_range(ctx, virt, len, |hat, ctx, leaf, pending| {
            hat.sync_leaf(ctx, leaf, mode, pending);
        });
    }

    fn update_range(
        &self,
        ctx: &Context,
        virt: VirtualAddress,
        len: usize,
        mut f: impl FnMut(&Self, &Context, &Leaf, &mut Pending),
    ) {
        let end = virt.checked_add(len).unwrap_or(VirtualAddress::MAX);
        let mut st = ctx.lock();
        let mut pending = Pending::default();

        let mut cursor = virt;
        while let Some(leaf) = self.next_leaf(ctx, &st, cursor, end) {
            cursor = leaf.range().end;
            if leaf.node.is_borrowed() {
                continue;
            }

            self.assert_within(ctx, &(virt..end), &leaf);
            f(self, ctx, &leaf, &mut pending);
        }

        self.finish(ctx, &mut st, &mut pending);
    }

    fn sync_leaf(&self, ctx: &Context, leaf: &Leaf, mode: SyncMode, pending: &mut Pending) {
        if leaf.pte.get(Pte::NO_RESYNC) {
            return;
        }

        match mode {
            SyncMode::Keep => self.record_status(leaf.pte, leaf.level),
            SyncMode::Clear => {
                let slot = self.entry(ctx, &leaf.node, leaf.index);
                let (old, _) = update_entry(slot, Pte::without_status);
                self.record_status(old, leaf.level);
                if old != old.without_status() {
                    pending.flush.invalidate(leaf.range());
                }
            }
        }
    }

    /// Returns an iterator over the leaf translations in `[virt, virt + len)`.
    pub fn walk<'a>(&'a self, ctx: &'a Context, virt: VirtualAddress, len: usize) -> Walk<'a, A, F, P> {
        Walk::new(self, ctx, virt, virt.checked_add(len).unwrap_or(VirtualAddress::MAX))
    }

    /// Describes the node of `ctx` at `level` that translates `virt`.
    pub fn node_info(&self, ctx: &Context, virt: VirtualAddress, level: u8) -> Option<NodeInfo> {
        let st = ctx.lock();
        let handle = if level == ctx.top_level() {
            st.root
        } else {
            *st.nodes
                .get(&(level, arch::level(level).table_base(virt)))?
        };
        let node = self.arena.get(handle);

        Some(NodeInfo {
            owner: node.owner,
            level: node.level,
            base: node.base,
            valid: node.valid,
            busy: node.busy,
            locked: node.locked,
            shared: node.is_borrowed(),
            share_count: node.shares,
        })
    }

    // ===== page-centric operations =====

    /// Returns every translation of `page` recorded in its mapping list.
    ///
    /// Large pages are recorded on their first constituent page only.
    pub fn page_mappings(&self, page: &Page) -> Vec<PageMapping> {
        let mappings: Vec<Mapping> = page.mappings().iter().copied().collect();
        mappings
            .into_iter()
            .filter_map(|mapping| {
                let node = self.arena.try_get(mapping.node)?;
                Some(PageMapping {
                    context: mapping.context,
                    virt: node
                        .base
                        .add(mapping.index() * arch::level(node.level).page_size()),
                    level: node.level,
                })
            })
            .collect()
    }

    /// Removes every translation of `page`.
    pub fn page_unload(&self, page: &Page) {
        self.for_each_mapping(page, |ctx, st, leaf, pending| {
            pending.flush.invalidate(leaf.range());
            self.remove_leaf(ctx, st, leaf, pending);
        });
    }

    /// Revokes write access from every translation of `page`.
    pub fn page_write_protect(&self, page: &Page) {
        self.for_each_mapping(page, |ctx, _, leaf, pending| {
            let slot = self.entry(ctx, &leaf.node, leaf.index);
            let (old, _) = update_entry(slot, |pte| pte.with(Pte::WRITABLE, false));
            if old.get(Pte::WRITABLE) {
                pending.flush.invalidate(leaf.range());
            }
        });
    }

    /// Copies the referenced/modified bits of every translation of `page` into its descriptor.
    pub fn page_sync(&self, page: &Page, mode: SyncMode) {
        self.for_each_mapping(page, |ctx, _, leaf, pending| {
            self.sync_leaf(ctx, leaf, mode, pending);
        });
    }

    fn for_each_mapping(
        &self,
        page: &Page,
        mut f: impl FnMut(&Context, &mut ContextState, &Leaf, &mut Pending),
    ) {
        // The context lock ranks above the mapping list lock, so work off a snapshot and
        // recheck every entry once the owning context is locked.
        let snapshot: Vec<Mapping> = page.mappings().iter().copied().collect();

        for mapping in snapshot {
            let Some(ctx) = self.context(mapping.context) else {
                continue;
            };
            let mut st = ctx.lock();
            if !page.mappings().contains(mapping.node, mapping.index()) {
                continue;
            }
            let Some(node) = self.arena.try_get(mapping.node) else {
                continue;
            };

            let index = mapping.index();
            let pte = Pte::from_bits(self.entry(&ctx, &node, index).load(Ordering::Acquire));
            debug_assert!(pte.is_leaf(node.level));
            let leaf = Leaf {
                handle: mapping.node,
                node,
                index,
                level: node.level,
                virt: node.base.add(index * arch::level(node.level).page_size()),
                pte,
            };

            let mut pending = Pending::default();
            f(&ctx, &mut st, &leaf, &mut pending);
            self.finish(&ctx, &mut st, &mut pending);
        }
    }

    // ===== teardown & accessors =====

    /// Releases every table, shadow root and context, returning the frame allocator.
    ///
    /// Page descriptors may keep mapping list entries of the kernel context; the caller is
    /// expected to discard them together with the page directory.
    ///
    /// # Safety
    ///
    /// No CPU may have any root of this translation layer loaded or run through its trampolines
    /// afterwards.
    pub unsafe fn teardown(self) -> F {
        for cpu in self.online.iter() {
            self.online.remove(cpu);
            self.release_cpu_state(&self.cpus[cpu.get()]);
        }

        for ctx in self.registry.teardown() {
            ctx.freeze();
            let mut st = ctx.lock();
            let mut pending = Pending::default();
            self.purge(&ctx, &mut st, &mut pending);
            self.finish(&ctx, &mut st, &mut pending);
        }

        // The kernel tables and the tables of orphaned shared nodes.
        for node in self.arena.drain() {
            if let Backing::Owned(frame) = node.backing {
                // Safety: ensured by caller
                unsafe { self.frames.deallocate_frame(frame) };
            }
        }

        log::debug!("translation layer torn down");
        self.frames
    }

    pub fn kernel_context(&self) -> &Arc<Context> {
        &self.kernel
    }

    pub(crate) fn kernel_root(&self) -> PhysicalAddress {
        self.kernel
            .root_frame()
            .unwrap_or_else(|| unreachable!("the kernel context has a root frame"))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &HatConfig {
        &self.config
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn frames(&self) -> &F {
        &self.frames
    }

    pub fn pages(&self) -> &P {
        &self.pages
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;

    use super::*;
    use crate::test_utils::{
        DATA_BASE, EmulateArch, Machine, Setup, TestFrameAllocator, TestPages, test_config,
    };
    use crate::{CpuId, MIB, PageStatus, ReclaimState};

    const USER: VirtualAddress = VirtualAddress::new(0x40_0000);
    const KERNEL_DATA: VirtualAddress = VirtualAddress::new(0xffff_ffff_8000_0000);

    fn load_user(setup: &Setup, ctx: &Context, virt: VirtualAddress, frame: usize, pages: usize) {
        setup
            .hat()
            .load(
                ctx,
                virt,
                setup.frame(frame),
                pages * PAGE_SIZE,
                MemoryAttributes::user_data(),
                LoadFlags::empty(),
            )
            .unwrap();
    }

    #[test_log::test]
    fn load_walk_unload() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);

        load_user(&setup, &ctx, USER, 0, 1);

        let entries: Vec<_> = hat.walk(&ctx, USER, PAGE_SIZE).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].virt, USER);
        assert_eq!(entries[0].level, 0);
        assert_eq!(entries[0].pte.address(), setup.frame(0));
        assert_eq!(entries[0].pte.attributes(), MemoryAttributes::user_data());
        assert!(!entries[0].shared);
        assert_eq!(ctx.mapped_pages(0), 1);
        assert_eq!(setup.page(0).mapping_count(), 1);

        hat.unload(&ctx, USER, PAGE_SIZE, None);
        assert_eq!(hat.walk(&ctx, USER, PAGE_SIZE).count(), 0);
        assert_eq!(ctx.mapped_pages(0), 0);
        assert_eq!(ctx.resident_nodes(), 0);
        assert_eq!(setup.page(0).mapping_count(), 0);
    }

    #[test_log::test]
    fn contiguous_run_becomes_large_page() {
        let setup = Setup::new(1);
        setup.bring_online(1);
        let hat = setup.hat();
        let machine = setup.machine();
        let cpu = CpuId::new(0);
        let ctx = hat.create_context(false);
        let virt = VirtualAddress::new(0x4000_0000);

        let frames: Vec<_> = (0..512).map(|n| setup.frame(n)).collect();
        hat.load_frames(
            &ctx,
            virt,
            &frames,
            MemoryAttributes::user_data(),
            LoadFlags::empty(),
        )
        .unwrap();

        let entries: Vec<_> = hat.walk(&ctx, virt, 2 * MIB).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, 1);
        assert_eq!(ctx.mapped_pages(1), 1);
        assert_eq!(ctx.mapped_pages(0), 0);
        assert!(hat.node_info(&ctx, virt, 0).is_none());
        assert_eq!(hat.node_info(&ctx, virt, 1).unwrap().valid, 1);

        // recorded once, on the first constituent page
        assert_eq!(
            hat.page_mappings(setup.page(0)),
            [PageMapping {
                context: ctx.id(),
                virt,
                level: 1,
            }]
        );
        assert_eq!(setup.page(5).mapping_count(), 0);

        // status reaches every constituent page
        machine.run_on(cpu, || hat.switch_to(&ctx));
        let fifth = virt.add(5 * PAGE_SIZE);
        assert_eq!(machine.access(cpu, fifth, true), Some(setup.frame(5)));
        machine.run_on(cpu, || hat.sync(&ctx, virt, 2 * MIB, SyncMode::Clear));
        assert!(setup.page(0).is_modified());
        assert!(setup.page(511).is_modified());
        assert!(!machine.tlb_contains(cpu, fifth));
        assert!(hat.walk(&ctx, virt, 2 * MIB).all(|entry| !entry.pte.get(Pte::DIRTY)));
    }

    #[test_log::test]
    fn idle_cpu_defers_invalidation() {
        let setup = Setup::new(2);
        setup.bring_online(2);
        let hat = setup.hat();
        let machine = setup.machine();
        let (a, b) = (CpuId::new(0), CpuId::new(1));

        let ctx = hat.create_context(false);
        load_user(&setup, &ctx, USER, 0, 1);
        machine.run_on(a, || hat.switch_to(&ctx));
        machine.run_on(b, || hat.switch_to(&ctx));
        assert_eq!(machine.access(b, USER, false), Some(setup.frame(0)));

        machine.run_on(b, || hat.enter_idle());
        assert!(hat.is_idle(b));

        let ipis = machine.ipi_count();
        machine.run_on(a, || hat.unload(&ctx, USER, PAGE_SIZE, None));
        assert_eq!(machine.ipi_count(), ipis);
        // nothing has run on B yet
        assert!(machine.tlb_contains(b, USER));

        machine.run_on(b, || hat.leave_idle());
        assert!(!hat.is_idle(b));
        assert!(!machine.tlb_contains(b, USER));
        assert_eq!(machine.access(b, USER, false), None);
    }

    #[test_log::test]
    fn unload_reaches_running_cpus() {
        let setup = Setup::new(2);
        setup.bring_online(2);
        let hat = setup.hat();
        let machine = setup.machine();
        let (a, b) = (CpuId::new(0), CpuId::new(1));

        let ctx = hat.create_context(false);
        load_user(&setup, &ctx, USER, 0, 4);
        machine.run_on(b, || hat.switch_to(&ctx));
        assert!(machine.access(b, USER.add(PAGE_SIZE), true).is_some());

        let ipis = machine.ipi_count();
        let mut runs = Vec::new();
        machine.run_on(a, || {
            hat.unload(
                &ctx,
                USER,
                4 * PAGE_SIZE,
                Some(&mut |run: Range<VirtualAddress>| {
                    // the callback only runs once B has forgotten the translation
                    assert!(!machine.tlb_contains(b, run.start.add(PAGE_SIZE)));
                    runs.push(run);
                }),
            );
        });

        assert_eq!(machine.ipi_count(), ipis + 1);
        assert_eq!(
            runs,
            [Range::<VirtualAddress>::from_start_len(USER, 4 * PAGE_SIZE)]
        );
        assert_eq!(machine.access(b, USER.add(PAGE_SIZE), false), None);
        assert!(setup.page(1).is_modified());
    }

    #[test_log::test]
    fn unload_without_mappings_is_noop() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);
        load_user(&setup, &ctx, USER, 0, 1);
        let frames = hat.frames().allocated_frames();

        let mut called = false;
        hat.unload(
            &ctx,
            VirtualAddress::new(0x8000_0000),
            16 * PAGE_SIZE,
            Some(&mut |_| called = true),
        );
        hat.unload(&ctx, USER.add(PAGE_SIZE), PAGE_SIZE, None);

        assert!(!called);
        assert_eq!(ctx.mapped_pages(0), 1);
        assert_eq!(hat.frames().allocated_frames(), frames);
    }

    #[test_log::test]
    #[should_panic = "without REMAP"]
    fn remap_without_flag() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);

        load_user(&setup, &ctx, USER, 0, 1);
        load_user(&setup, &ctx, USER, 1, 1);
    }

    #[test_log::test]
    fn remap_device_memory() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);
        let mmio = PhysicalAddress::new(0xfee0_0000);

        hat.load(
            &ctx,
            USER,
            mmio,
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::NO_REVERSE_MAP | LoadFlags::LOCK,
        )
        .unwrap();
        hat.load(
            &ctx,
            USER,
            mmio.add(PAGE_SIZE),
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::NO_REVERSE_MAP | LoadFlags::REMAP,
        )
        .unwrap();

        assert_eq!(
            hat.lookup(&ctx, USER.add(0x10)).map(|(phys, _, _)| phys),
            Some(mmio.add(PAGE_SIZE).add(0x10))
        );
        let info = hat.node_info(&ctx, USER, 0).unwrap();
        assert_eq!(info.valid, 1);
        assert_eq!(info.locked, 0);
        assert_eq!(ctx.mapped_pages(0), 1);
    }

    #[test_log::test]
    fn reload_updates_protection() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);

        load_user(&setup, &ctx, USER, 0, 1);
        hat.load(
            &ctx,
            USER,
            setup.frame(0),
            PAGE_SIZE,
            MemoryAttributes::user_text(),
            LoadFlags::LOCK,
        )
        .unwrap();

        let (_, attributes, _) = hat.lookup(&ctx, USER).unwrap();
        assert_eq!(attributes, MemoryAttributes::user_text());
        assert_eq!(hat.node_info(&ctx, USER, 0).unwrap().locked, 1);
        assert_eq!(ctx.mapped_pages(0), 1);
        assert_eq!(setup.page(0).mapping_count(), 1);
    }

    #[test_log::test]
    fn small_page_inside_large_page() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);
        let virt = VirtualAddress::new(0x4000_0000);
        load_user(&setup, &ctx, virt, 0, 512);

        let inner = virt.add(PAGE_SIZE);
        let err = hat.load(
            &ctx,
            inner,
            setup.frame(600),
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::empty(),
        );
        assert_eq!(
            err,
            Err(Error::LargePageCollision {
                virt: inner,
                level: 1
            })
        );
        assert_eq!(setup.page(600).mapping_count(), 0);
        assert_eq!(ctx.mapped_pages(0), 0);
    }

    #[test_log::test]
    #[should_panic = "covers part of the level 1 page"]
    fn unload_splitting_large_page() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);
        let virt = VirtualAddress::new(0x4000_0000);
        load_user(&setup, &ctx, virt, 0, 512);

        hat.unload(&ctx, virt, 2 * PAGE_SIZE, None);
    }

    #[test_log::test]
    fn smaller_table_in_the_way() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);
        let virt = VirtualAddress::new(0x4000_0000);

        load_user(&setup, &ctx, virt.add(PAGE_SIZE), 1, 1);
        load_user(&setup, &ctx, virt, 0, 512);

        assert_eq!(ctx.mapped_pages(1), 0);
        assert_eq!(ctx.mapped_pages(0), 512);
        assert_eq!(setup.page(1).mapping_count(), 1);
    }

    #[test_log::test]
    fn protect_keeps_frames() {
        let setup = Setup::new(1);
        setup.bring_online(1);
        let hat = setup.hat();
        let machine = setup.machine();
        let cpu = CpuId::new(0);
        let ctx = hat.create_context(false);

        load_user(&setup, &ctx, USER, 0, 2);
        machine.run_on(cpu, || hat.switch_to(&ctx));
        assert!(machine.access(cpu, USER, true).is_some());

        let read_only = MemoryAttributes::user_data().with(MemoryAttributes::WRITE, false);
        machine.run_on(cpu, || hat.protect(&ctx, USER, 2 * PAGE_SIZE, read_only));

        for entry in hat.walk(&ctx, USER, 2 * PAGE_SIZE) {
            assert_eq!(entry.pte.attributes(), read_only);
        }
        // hardware status survives
        assert!(hat.walk(&ctx, USER, PAGE_SIZE).all(|entry| entry.pte.get(Pte::DIRTY)));
        assert_eq!(machine.access(cpu, USER, true), None);
        assert_eq!(machine.access(cpu, USER, false), Some(setup.frame(0)));
        assert_eq!(setup.page(0).mapping_count(), 1);
    }

    #[test_log::test]
    fn page_centric_operations() {
        let setup = Setup::new(1);
        setup.bring_online(1);
        let hat = setup.hat();
        let machine = setup.machine();
        let cpu = CpuId::new(0);
        let page = setup.page(0);

        let one = hat.create_context(false);
        let two = hat.create_context(false);
        let other = VirtualAddress::new(0x7000_0000);
        load_user(&setup, &one, USER, 0, 1);
        load_user(&setup, &one, other, 0, 1);
        load_user(&setup, &two, USER, 0, 1);

        let mappings = hat.page_mappings(page);
        assert_eq!(mappings.len(), 3);
        for (context, virt) in [(one.id(), USER), (one.id(), other), (two.id(), USER)] {
            assert!(mappings.contains(&PageMapping {
                context,
                virt,
                level: 0
            }));
        }

        machine.run_on(cpu, || hat.switch_to(&one));
        assert!(machine.access(cpu, USER, true).is_some());
        machine.run_on(cpu, || hat.page_sync(page, SyncMode::Clear));
        assert!(page.is_referenced());
        assert!(page.is_modified());
        assert!(hat.walk(&one, USER, PAGE_SIZE).all(|entry| !entry.pte.get(Pte::DIRTY)));

        page.clear_status(PageStatus::REFERENCED | PageStatus::MODIFIED);
        machine.run_on(cpu, || hat.page_sync(page, SyncMode::Keep));
        assert!(!page.is_modified());

        machine.run_on(cpu, || hat.page_write_protect(page));
        for (ctx, virt) in [(&one, USER), (&one, other), (&two, USER)] {
            let (_, attributes, _) = hat.lookup(ctx, virt).unwrap();
            assert!(!attributes.allows_write());
        }
        assert_eq!(machine.access(cpu, USER, true), None);

        machine.run_on(cpu, || hat.page_unload(page));
        assert_eq!(page.mapping_count(), 0);
        assert!(hat.lookup(&one, other).is_none());
        assert!(hat.lookup(&two, USER).is_none());
        assert_eq!(one.mapped_pages(0), 0);
        assert_eq!(two.resident_nodes(), 0);
    }

    #[test_log::test]
    fn kernel_translations_are_global() {
        let setup = Setup::new(2);
        setup.bring_online(2);
        let hat = setup.hat();
        let machine = setup.machine();
        let (a, b) = (CpuId::new(0), CpuId::new(1));

        hat.load(
            hat.kernel_context(),
            KERNEL_DATA,
            setup.frame(7),
            PAGE_SIZE,
            MemoryAttributes::kernel_data(),
            LoadFlags::empty(),
        )
        .unwrap();

        let one = hat.create_context(false);
        let two = hat.create_context(false);
        machine.run_on(b, || hat.switch_to(&one));
        assert_eq!(machine.access(b, KERNEL_DATA, false), Some(setup.frame(7)));
        machine.run_on(b, || hat.switch_to(&two));
        assert!(machine.tlb_contains(b, KERNEL_DATA));

        let ipis = machine.ipi_count();
        machine.run_on(a, || hat.unload(hat.kernel_context(), KERNEL_DATA, PAGE_SIZE, None));
        assert_eq!(machine.ipi_count(), ipis + 1);
        assert!(!machine.tlb_contains(b, KERNEL_DATA));
        // preallocated kernel tables stay
        assert!(hat.kernel_context().resident_nodes() >= 1);
    }

    #[test_log::test]
    fn last_page_of_address_space() {
        let setup = Setup::new(2);
        setup.bring_online(2);
        let hat = setup.hat();
        let machine = setup.machine();
        let (a, b) = (CpuId::new(0), CpuId::new(1));
        let last = VirtualAddress::new(0xffff_ffff_ffff_f000);

        hat.load(
            hat.kernel_context(),
            last,
            setup.frame(3),
            PAGE_SIZE,
            MemoryAttributes::kernel_data(),
            LoadFlags::empty(),
        )
        .unwrap();
        assert_eq!(
            hat.lookup(hat.kernel_context(), VirtualAddress::MAX)
                .map(|(phys, _, level)| (phys, level)),
            Some((setup.frame(3).add(PAGE_SIZE - 1), 0))
        );

        let user = hat.create_context(false);
        machine.run_on(b, || hat.switch_to(&user));
        assert_eq!(machine.access(b, last, true), Some(setup.frame(3)));

        let mut runs = Vec::new();
        machine.run_on(a, || {
            hat.unload(
                hat.kernel_context(),
                last,
                PAGE_SIZE,
                Some(&mut |run| runs.push(run)),
            );
        });
        assert_eq!(runs, [last..VirtualAddress::MAX]);
        assert!(!machine.tlb_contains(b, last));
        assert_eq!(machine.access(b, last, false), None);
        assert!(hat.lookup(hat.kernel_context(), last).is_none());
    }

    #[test_log::test]
    #[should_panic = "can not translate"]
    fn kernel_load_outside_preallocated_entries() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        hat.load(
            hat.kernel_context(),
            VirtualAddress::new(0xffff_8000_0000_0000),
            setup.frame(0),
            PAGE_SIZE,
            MemoryAttributes::kernel_data(),
            LoadFlags::empty(),
        )
        .unwrap();
    }

    #[test_log::test]
    fn steal_from_other_context() {
        let config = HatConfig {
            isolation: false,
            compat32: false,
            ..test_config()
        };
        let setup = Setup::with_config(1, config);
        let hat = setup.hat();

        let victim = hat.create_context(false);
        load_user(&setup, &victim, USER, 0, 1);
        hat.frames()
            .set_limit(Some(hat.frames().allocated_frames()));

        let requester = hat.create_context(false);
        hat.load(
            &requester,
            USER,
            setup.frame(1),
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::LOCK,
        )
        .unwrap();

        assert_eq!(victim.resident_nodes(), 0);
        assert_eq!(victim.mapped_pages(0), 0);
        assert!(hat.lookup(&victim, USER).is_none());
        assert_eq!(victim.reclaim_state(), ReclaimState::Idle);
        assert_eq!(setup.page(0).mapping_count(), 0);
        assert_eq!(
            hat.lookup(&requester, USER).map(|(phys, _, _)| phys),
            Some(setup.frame(1))
        );

        // pinned tables can't be taken
        let starved = hat.create_context(false);
        let err = hat.load(
            &starved,
            USER,
            setup.frame(2),
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::empty(),
        );
        assert_eq!(err, Err(Error::OutOfMemory));
        assert_eq!(starved.resident_nodes(), 0);
        assert!(hat.lookup(&requester, USER).is_some());
    }

    #[test_log::test]
    #[should_panic = "kernel context out of page-table memory"]
    fn kernel_out_of_memory() {
        let _ = Hat::new(
            EmulateArch::new(Machine::new(1)),
            TestFrameAllocator::new().with_limit(1),
            TestPages::new(DATA_BASE, 16),
            test_config(),
        );
    }

    #[test_log::test]
    fn destroy_releases_everything() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let frames = hat.frames().allocated_frames();

        let ctx = hat.create_context(false);
        load_user(&setup, &ctx, USER, 0, 3);
        load_user(&setup, &ctx, VirtualAddress::new(0x4000_0000), 512, 512);
        load_user(&setup, &ctx, VirtualAddress::new(0x7fff_ffff_f000), 3, 1);
        assert!(hat.frames().allocated_frames() > frames);

        let id = ctx.id();
        hat.destroy_context(ctx);
        assert!(hat.registry().get(id).is_none());
        assert_eq!(hat.frames().allocated_frames(), frames);
        assert_eq!(setup.page(0).mapping_count(), 0);
        assert_eq!(setup.page(512).mapping_count(), 0);
    }

    #[test_log::test]
    #[should_panic = "while it runs on"]
    fn destroy_running_context() {
        let setup = Setup::new(1);
        setup.bring_online(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);
        setup
            .machine()
            .run_on(CpuId::new(0), || hat.switch_to(&ctx));

        hat.destroy_context(ctx);
    }

    #[test_log::test]
    fn teardown_returns_every_frame() {
        let setup = Setup::new(2);
        setup.bring_online(2);
        let hat = setup.hat();

        hat.load(
            hat.kernel_context(),
            KERNEL_DATA,
            setup.frame(1000),
            2 * MIB,
            MemoryAttributes::kernel_data(),
            LoadFlags::NO_REVERSE_MAP,
        )
        .unwrap();
        let one = hat.create_context(false);
        let two = hat.create_context(true);
        load_user(&setup, &one, USER, 0, 4);
        load_user(&setup, &two, VirtualAddress::new(0xc000_0000), 8, 4);
        setup
            .machine()
            .run_on(CpuId::new(1), || hat.switch_to(&one));

        // Safety: the emulated CPUs never execute anything
        let frames = unsafe { setup.into_hat().teardown() };
        assert_eq!(frames.allocated_frames(), 0);
    }

    const CHUNKS: usize = 4;
    const BASE: VirtualAddress = VirtualAddress::new(0x4000_0000);

    #[derive(Debug, Clone, Arbitrary)]
    enum Op {
        Load {
            #[proptest(strategy = "0..4usize")]
            chunk: usize,
            #[proptest(strategy = "0..512usize")]
            first: usize,
            #[proptest(strategy = "1..=512usize")]
            pages: usize,
            #[proptest(strategy = "crate::test_utils::proptest::user_attributes()")]
            attributes: MemoryAttributes,
        },
        LoadChunk {
            #[proptest(strategy = "0..4usize")]
            chunk: usize,
        },
        Unload {
            #[proptest(strategy = "0..4usize")]
            chunk: usize,
            #[proptest(strategy = "0..512usize")]
            first: usize,
            #[proptest(strategy = "1..=512usize")]
            pages: usize,
        },
    }

    /// The page index range an operation touches, clipped to its chunk.
    fn pages_of(chunk: usize, first: usize, pages: usize) -> Range<usize> {
        let start = chunk * 512 + first;
        start..start + pages.min(512 - first)
    }

    fn check_counters(setup: &Setup, ctx: &Context, model: &[bool]) -> Result<(), TestCaseError> {
        let hat = setup.hat();

        let mut counts = [0usize; 3];
        for entry in hat.walk(ctx, BASE, CHUNKS * 2 * MIB) {
            counts[entry.level as usize] += 1;
            prop_assert_eq!(
                entry.pte.address(),
                DATA_BASE.add(entry.virt.offset_from_unsigned(BASE))
            );
            let page = hat.pages().page(entry.pte.address()).unwrap();
            prop_assert_eq!(page.mapping_count(), 1);
        }
        for (level, count) in counts.iter().enumerate() {
            prop_assert_eq!(ctx.mapped_pages(u8::try_from(level).unwrap()), *count);
        }

        for (index, mapped) in model.iter().enumerate() {
            let virt = BASE.add(index * PAGE_SIZE);
            prop_assert_eq!(hat.lookup(ctx, virt).is_some(), *mapped, "page {}", index);
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn counters_match_tables(ops in proptest::collection::vec(any::<Op>(), 1..24)) {
            let setup = Setup::new(1);
            let hat = setup.hat();
            let frames = hat.frames().allocated_frames();
            let ctx = hat.create_context(false);
            let mut model = vec![false; CHUNKS * 512];

            for op in ops {
                match op {
                    Op::Load { chunk, first, pages, attributes } => {
                        let pages = pages_of(chunk, first, pages);
                        let result = hat.load(
                            &ctx,
                            BASE.add(pages.start * PAGE_SIZE),
                            setup.frame(pages.start),
                            pages.len() * PAGE_SIZE,
                            attributes,
                            LoadFlags::empty(),
                        );
                        match result {
                            Ok(()) => model[pages].fill(true),
                            Err(Error::LargePageCollision { level, .. }) => prop_assert_eq!(level, 1),
                            Err(err) => return Err(TestCaseError::fail(format!("{err}"))),
                        }
                    }
                    Op::LoadChunk { chunk } => {
                        let pages = pages_of(chunk, 0, 512);
                        load_user(&setup, &ctx, BASE.add(pages.start * PAGE_SIZE), pages.start, 512);
                        model[pages].fill(true);
                    }
                    Op::Unload { chunk, first, pages } => {
                        let chunk_base = BASE.add(chunk * 2 * MIB);
                        let large = matches!(hat.lookup(&ctx, chunk_base), Some((_, _, 1)));
                        let pages = if large {
                            pages_of(chunk, 0, 512)
                        } else {
                            pages_of(chunk, first, pages)
                        };
                        hat.unload(&ctx, BASE.add(pages.start * PAGE_SIZE), pages.len() * PAGE_SIZE, None);
                        model[pages].fill(false);
                    }
                }

                check_counters(&setup, &ctx, &model)?;
            }

            hat.destroy_context(ctx);
            prop_assert_eq!(hat.frames().allocated_frames(), frames);
        }
    }
}
