// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Node management: locating, creating, reaping and stealing page-table nodes.

use core::ops::{Range, RangeInclusive};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{self, Arch, COMPAT32_TOP_ENTRIES, COMPAT32_TOP_LEVEL, ENTRIES_PER_TABLE, TOP_LEVEL};
use crate::context::{Context, ContextState};
use crate::frame_alloc::FrameAllocator;
use crate::hat::{Hat, Pending};
use crate::node::{Backing, Node, NodeHandle};
use crate::page::{Page, PageDirectory, PageStatus};
use crate::pte::Pte;
use crate::{Error, PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// A leaf entry found by [`Hat::next_leaf`], together with a snapshot of the node holding it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Leaf {
    pub(crate) handle: NodeHandle,
    pub(crate) node: Node,
    pub(crate) index: usize,
    pub(crate) level: u8,
    /// The first address translated by the entry.
    pub(crate) virt: VirtualAddress,
    pub(crate) pte: Pte,
}

impl Leaf {
    pub(crate) fn range(&self) -> Range<VirtualAddress> {
        self.virt..self.virt.saturating_add(arch::level(self.level).page_size())
    }
}

/// Atomically replaces the entry in `slot` with `f(entry)`, retrying when the hardware updates
/// the referenced/modified bits in between. Returns the old and the new entry.
pub(crate) fn update_entry(slot: &AtomicU64, mut f: impl FnMut(Pte) -> Pte) -> (Pte, Pte) {
    let mut current = slot.load(Ordering::Acquire);
    loop {
        let old = Pte::from_bits(current);
        let new = f(old);
        match slot.compare_exchange_weak(current, new.bits(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return (old, new),
            Err(actual) => current = actual,
        }
    }
}

impl<A, F, P> Hat<A, F, P>
where
    A: Arch,
    F: FrameAllocator,
    P: PageDirectory,
{
    /// Returns the slot holding entry `index` of `node`.
    pub(crate) fn entry<'a>(&'a self, ctx: &'a Context, node: &Node, index: usize) -> &'a AtomicU64 {
        match node.backing {
            Backing::Copied => ctx.copied_entry(index),
            Backing::Owned(frame) | Backing::Borrowed { frame, .. } => {
                // Safety: nodes reachable from a locked context keep their frames alive
                unsafe { self.arch.table_entry(frame, index) }
            }
        }
    }

    /// The addresses `ctx` may translate.
    pub(crate) fn address_bounds(&self, ctx: &Context) -> RangeInclusive<VirtualAddress> {
        let top = arch::level(TOP_LEVEL);

        if ctx.is_kernel() {
            let entries = &self.config.kernel_top_entries;
            let start = VirtualAddress::new(entries.start * top.page_size()).canonicalize();
            let last = VirtualAddress::new(entries.end * top.page_size() - 1).canonicalize();
            start..=last
        } else if ctx.is_per_cpu() {
            self.config.kernel_base..=VirtualAddress::MAX
        } else if ctx.is_compat32() {
            let len = COMPAT32_TOP_ENTRIES * arch::level(COMPAT32_TOP_LEVEL).page_size();
            VirtualAddress::MIN..=VirtualAddress::new(len - 1)
        } else {
            let len = ctx.copied_entries().len() * top.page_size();
            VirtualAddress::MIN..=VirtualAddress::new(len - 1)
        }
    }

    /// Locates the node at level `at` translating `virt`, creating it and any missing ancestors.
    ///
    /// With `shared_from` set, a newly created node borrows the frame of that node instead of
    /// allocating one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LargePageCollision`] if an ancestor entry is a leaf and
    /// [`Error::OutOfMemory`] if no frame could be allocated or stolen.
    pub(crate) fn create_node(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        virt: VirtualAddress,
        at: u8,
        shared_from: Option<NodeHandle>,
        share_hint: bool,
        pending: &mut Pending,
    ) -> Result<NodeHandle, Error> {
        let top = ctx.top_level();
        if at == top {
            return Ok(st.root);
        }
        debug_assert!(at < top);

        let base = arch::level(at).table_base(virt);
        if let Some(&handle) = st.nodes.get(&(at, base)) {
            return Ok(handle);
        }

        let parent = self.create_node(ctx, st, virt, at + 1, None, false, pending)?;
        let parent_node = self.arena.get(parent);
        let index = arch::level(at + 1).index_of(virt);
        let slot = self.entry(ctx, &parent_node, index);

        let current = Pte::from_bits(slot.load(Ordering::Acquire));
        if current.is_leaf(at + 1) {
            return Err(Error::LargePageCollision {
                virt,
                level: at + 1,
            });
        }
        if !current.is_vacant() {
            log::error!(
                "{:?}: entry {index} of {parent:?} links a table no node tracks",
                ctx.id()
            );
            panic!(
                "{:?}: untracked table entry {index} of {parent:?}, expected vacant, found {current:?}",
                ctx.id()
            );
        }

        let (backing, valid) = match shared_from {
            Some(source) => {
                let (frame, valid) = self.arena.update(source, |node| {
                    node.shares += 1;
                    (node.backing.frame(), node.valid)
                });
                let Some(frame) = frame else {
                    panic!("{source:?} has no frame that could be shared");
                };
                (Backing::Borrowed { source, frame }, valid)
            }
            None => match self.allocate_table(ctx) {
                Ok(frame) => (Backing::Owned(frame), 0),
                Err(err) => {
                    // don't leave freshly created, empty ancestors behind
                    self.maybe_reap(ctx, st, parent, pending);
                    return Err(err);
                }
            },
        };

        let mut node = Node::new(ctx.id(), at, base, Some(parent), backing);
        node.share_hint = share_hint;
        node.valid = valid;
        let handle = self.arena.insert(node);
        st.nodes.insert((at, base), handle);
        if let Some(source) = shared_from {
            self.arena.lend(source, handle);
        }

        self.arena.update(parent, |parent| {
            parent.busy += 1;
            parent.valid += 1;
        });
        if let Some(frame) = backing.frame() {
            slot.store(Pte::table(frame, ctx.is_user()).bits(), Ordering::Release);
        }
        if matches!(parent_node.backing, Backing::Copied) {
            st.top_changed = true;
        }

        log::trace!(
            "{:?}: created level {at} node {handle:?} at {base} ({backing:?})",
            ctx.id()
        );
        Ok(handle)
    }

    /// Marks `handle` as in use, preventing it from being reaped or stolen.
    pub(crate) fn hold(&self, handle: NodeHandle) {
        self.arena.update(handle, |node| node.busy += 1);
    }

    pub(crate) fn release(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        handle: NodeHandle,
        pending: &mut Pending,
    ) {
        self.arena.update(handle, |node| {
            debug_assert!(node.busy > 0);
            node.busy -= 1;
        });
        self.maybe_reap(ctx, st, handle, pending);
    }

    /// Removes `handle` from its parent, returning the parent.
    ///
    /// The node itself stays in the arena; the caller decides what happens to it.
    pub(crate) fn unlink(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        node: &Node,
        pending: &mut Pending,
    ) -> Option<NodeHandle> {
        let parent = node.parent?;
        st.nodes.remove(&(node.level, node.base));

        let parent_node = self.arena.get(parent);
        let index = arch::level(parent_node.level).index_of(node.base);
        self.entry(ctx, &parent_node, index)
            .store(Pte::VACANT.bits(), Ordering::Release);
        self.arena.update(parent, |parent| {
            parent.valid -= 1;
            parent.busy -= 1;
        });
        if matches!(parent_node.backing, Backing::Copied) {
            st.top_changed = true;
        }

        // Invalidating any address below the table drops the paging-structure cache entries
        // referencing it.
        pending
            .flush
            .invalidate(node.base..node.base.saturating_add(PAGE_SIZE));

        Some(parent)
    }

    /// Releases `handle` and every ancestor that is neither busy nor has valid entries.
    pub(crate) fn maybe_reap(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        mut handle: NodeHandle,
        pending: &mut Pending,
    ) {
        while handle != st.root {
            let node = self.arena.get(handle);
            if node.busy > 0 || node.valid > 0 {
                return;
            }

            let Some(parent) = self.unlink(ctx, st, &node, pending) else {
                return;
            };

            match node.backing {
                Backing::Owned(frame) => {
                    let lent = self.arena.update(handle, |node| {
                        node.zombie = node.shares > 0;
                        node.parent = None;
                        node.zombie
                    });
                    if lent {
                        log::trace!("{handle:?} is still borrowed, deferring its release");
                    } else {
                        self.arena.remove(handle);
                        pending.freed.push(frame);
                    }
                }
                Backing::Borrowed { source, .. } => {
                    self.arena.unlend(source, handle);
                    self.arena.remove(handle);
                    self.release_share(source, pending);
                }
                Backing::Copied => unreachable!("copied nodes are always roots"),
            }

            log::trace!(
                "{:?}: reaped level {} node {handle:?} at {}",
                ctx.id(),
                node.level,
                node.base
            );
            handle = parent;
        }
    }

    /// Drops one borrow of `source`, releasing it if its owner let go of it already.
    pub(crate) fn release_share(&self, source: NodeHandle, pending: &mut Pending) {
        let (node, last) = self.arena.update(source, |node| {
            node.shares -= 1;
            (*node, node.shares == 0 && node.zombie)
        });
        if !last {
            return;
        }

        let Backing::Owned(frame) = node.backing else {
            unreachable!("only owned nodes can be lent");
        };

        // The owner is gone, so nothing counts these entries anymore. Only the reverse index and
        // the page status need settling.
        for index in 0..ENTRIES_PER_TABLE {
            // Safety: the zombie node still owns its frame
            let slot = unsafe { self.arch.table_entry(frame, index) };
            let pte = Pte::from_bits(slot.swap(Pte::VACANT.bits(), Ordering::AcqRel));
            if pte.is_vacant() {
                continue;
            }

            if !pte.get(Pte::NO_RESYNC) {
                self.record_status(pte, node.level);
            }
            if !pte.get(Pte::NO_REVERSE_MAP) {
                self.page_of(pte.address()).mappings().remove(source, index);
            }
        }

        self.arena.remove(source);
        pending.freed.push(frame);
        pending.everywhere = true;
        log::trace!("released zombie {source:?}");
    }

    /// Allocates and zeroes a frame for a new page table, stealing one if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if neither allocation nor stealing succeeded.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` is the kernel context and no frame could be found.
    pub(crate) fn allocate_table(&self, ctx: &Context) -> Result<PhysicalAddress, Error> {
        if let Ok(frame) = self.frames.allocate_frame() {
            // Safety: we just allocated the frame
            unsafe { self.arch.zero_frame(frame) };
            return Ok(frame);
        }

        log::warn!(
            "page-table allocation for {:?} failed, trying to steal one",
            ctx.id()
        );
        if let Some(frame) = self.steal(ctx) {
            return Ok(frame);
        }

        if ctx.is_kernel() {
            log::error!("kernel context out of page-table memory");
            panic!("kernel context out of page-table memory");
        }
        Err(Error::OutOfMemory)
    }

    fn steal(&self, requester: &Context) -> Option<PhysicalAddress> {
        for victim in self.registry.reclaim_candidates(Some(requester.id())) {
            if !victim.try_lend() {
                continue;
            }

            // Never wait on a victim while holding our own lock.
            let frame = victim
                .state
                .try_lock()
                .and_then(|mut st| self.reclaim_from(&victim, &mut st));
            victim.finish_lending();

            if frame.is_some() {
                return frame;
            }
        }

        None
    }

    fn reclaim_from(&self, victim: &Context, st: &mut ContextState) -> Option<PhysicalAddress> {
        let handle = st
            .nodes
            .values()
            .copied()
            .find(|&handle| self.arena.get(handle).is_reclaimable())?;
        let node = self.arena.get(handle);
        let Backing::Owned(frame) = node.backing else {
            unreachable!("reclaimable nodes own their frame");
        };

        for index in 0..ENTRIES_PER_TABLE {
            let pte = Pte::from_bits(
                self.entry(victim, &node, index)
                    .swap(Pte::VACANT.bits(), Ordering::AcqRel),
            );
            if !pte.is_vacant() {
                self.retire_leaf(victim, handle, &node, index, pte);
            }
        }

        let mut pending = Pending::default();
        self.maybe_reap(victim, st, handle, &mut pending);
        pending.freed.retain(|&freed| freed != frame);
        // We don't know which CPUs walked through the table, so everybody has to forget it.
        pending.everywhere = true;
        self.finish(victim, st, &mut pending);

        // Safety: the frame is unlinked and no CPU caches translations through it anymore
        unsafe { self.arch.zero_frame(frame) };

        log::debug!(
            "stole level {} table at {} from {:?}",
            node.level,
            node.base,
            victim.id()
        );
        Some(frame)
    }

    /// Finds the first leaf translating an address in `[from, end)`.
    ///
    /// A large leaf covering `from` is returned even though it starts below it.
    pub(crate) fn next_leaf(
        &self,
        ctx: &Context,
        st: &ContextState,
        from: VirtualAddress,
        end: VirtualAddress,
    ) -> Option<Leaf> {
        let bounds = self.address_bounds(ctx);
        let mut virt = from.canonicalize().max(*bounds.start());

        'search: loop {
            if virt >= end || virt > *bounds.end() {
                return None;
            }

            let mut handle = st.root;
            let mut node = self.arena.get(handle);
            loop {
                let geometry = arch::level(node.level);
                let index = geometry.index_of(virt);
                let pte = Pte::from_bits(self.entry(ctx, &node, index).load(Ordering::Acquire));

                if pte.is_vacant() {
                    let size = geometry.page_size();
                    virt = virt.align_down(size).checked_add(size)?.canonicalize();
                    continue 'search;
                }

                if pte.is_leaf(node.level) {
                    return Some(Leaf {
                        handle,
                        node,
                        index,
                        level: node.level,
                        virt: virt.align_down(geometry.page_size()),
                        pte,
                    });
                }

                let child_level = node.level - 1;
                let key = (child_level, arch::level(child_level).table_base(virt));
                let Some(&child) = st.nodes.get(&key) else {
                    log::error!("{:?}: no node for entry {index} of {handle:?}", ctx.id());
                    panic!(
                        "{:?}: entry {index} of {handle:?} links {pte:?} but no level {child_level} node is tracked",
                        ctx.id()
                    );
                };
                handle = child;
                node = self.arena.get(child);
            }
        }
    }

    /// Clears the bookkeeping of a leaf that was just removed from its table.
    pub(crate) fn retire_leaf(
        &self,
        ctx: &Context,
        handle: NodeHandle,
        node: &Node,
        index: usize,
        pte: Pte,
    ) {
        debug_assert!(pte.is_leaf(node.level));

        if !pte.get(Pte::NO_RESYNC) {
            self.record_status(pte, node.level);
        }
        if !pte.get(Pte::NO_REVERSE_MAP)
            && !self.page_of(pte.address()).mappings().remove(handle, index)
        {
            log::error!("{:?}: mapping list out of sync", ctx.id());
            panic!(
                "{:?}: no mapping list entry for entry {index} of {handle:?} ({pte:?})",
                ctx.id()
            );
        }

        let locked = pte.get(Pte::LOCKED);
        self.arena.update(handle, |node| {
            node.valid -= 1;
            if locked {
                node.locked -= 1;
            }
        });
        ctx.sub_mapped(node.level, 1);
        if node.shares > 0 {
            self.credit_borrowers(handle, node.level, false);
        }
    }

    /// Applies a change of the valid entries of the lent table `source` to its borrowers, which
    /// translate through the very same entries.
    pub(crate) fn credit_borrowers(&self, source: NodeHandle, level: u8, added: bool) {
        for (borrower, owner) in self.arena.borrowers(source) {
            // contexts being destroyed are unregistered and settle their counters when purged
            let Some(ctx) = self.registry.get(owner) else {
                continue;
            };

            self.arena.update_borrower(source, borrower, |node| {
                if added {
                    node.valid += 1;
                    ctx.add_mapped(level, 1);
                } else {
                    node.valid -= 1;
                    ctx.sub_mapped(level, 1);
                }
            });
        }
    }

    /// Copies the referenced/modified bits of `pte` into the descriptors of every page it maps.
    pub(crate) fn record_status(&self, pte: Pte, level: u8) {
        let mut status = PageStatus::empty();
        status.set(PageStatus::REFERENCED, pte.get(Pte::ACCESSED));
        status.set(PageStatus::MODIFIED, pte.get(Pte::DIRTY));
        if status.is_empty() {
            return;
        }

        let base = pte.address();
        for offset in (0..arch::level(level).page_size()).step_by(PAGE_SIZE) {
            if let Some(page) = self.pages.page(base.add(offset)) {
                page.record_status(status);
            }
        }
    }

    /// # Panics
    ///
    /// Panics if `frame` has no descriptor. Frames without one must be mapped with
    /// [`LoadFlags::NO_REVERSE_MAP`](crate::LoadFlags::NO_REVERSE_MAP).
    pub(crate) fn page_of(&self, frame: PhysicalAddress) -> &Page {
        self.pages
            .page(frame)
            .unwrap_or_else(|| panic!("no page descriptor for frame {frame}"))
    }
}
