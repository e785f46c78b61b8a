// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-CPU shadow roots and kernel page-table isolation.
//!
//! User contexts have no top-level table of their own. Each CPU owns an always-resident
//! *shadow root* whose kernel half is populated once at bring-up and whose user half is
//! overwritten with the entries of whatever context the CPU runs. With isolation enabled the CPU
//! additionally owns a *reduced-privilege root*: a table that maps only the fixed kernel entry
//! surface handed to [`Hat::cpu_online`] plus the user half of the running context. The entry
//! trampolines switch between the two roots through the CPU's [`TrampolineFrame`]s.

use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arch::{Arch, TOP_LEVEL, USER_TOP_ENTRIES};
use crate::context::{Context, ContextFlags, ContextId};
use crate::cpu_set::{CpuId, CpuSet};
use crate::frame_alloc::FrameAllocator;
use crate::hat::{Hat, LoadFlags, Pending};
use crate::node::{Backing, Node};
use crate::page::PageDirectory;
use crate::pte::Pte;
use crate::shootdown::IdleState;
use crate::{Error, MemoryAttributes, Mutex, PhysicalAddress, VirtualAddress};

/// A translation that must stay reachable while a CPU runs on its reduced-privilege root:
/// entry trampolines, descriptor tables and interrupt stacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMapping {
    pub virt: VirtualAddress,
    pub phys: PhysicalAddress,
    pub len: usize,
    pub attributes: MemoryAttributes,
}

/// The roots an entry trampoline switches between.
///
/// The trampoline loads `kernel_root` when entering the kernel and `user_root` when returning to
/// user mode. Both are rewritten on every context switch.
#[repr(C)]
pub struct TrampolineFrame {
    kernel_root: AtomicUsize,
    user_root: AtomicUsize,
}

impl fmt::Debug for TrampolineFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolineFrame")
            .field("kernel_root", &self.kernel_root())
            .field("user_root", &self.user_root())
            .finish()
    }
}

impl TrampolineFrame {
    const fn new() -> Self {
        Self {
            kernel_root: AtomicUsize::new(0),
            user_root: AtomicUsize::new(0),
        }
    }

    pub fn kernel_root(&self) -> Option<PhysicalAddress> {
        load_frame(&self.kernel_root)
    }

    pub fn user_root(&self) -> Option<PhysicalAddress> {
        load_frame(&self.user_root)
    }

    fn set(&self, kernel_root: PhysicalAddress, user_root: PhysicalAddress) {
        self.kernel_root.store(kernel_root.get(), Ordering::Release);
        self.user_root.store(user_root.get(), Ordering::Release);
    }

    fn clear(&self) {
        self.kernel_root.store(0, Ordering::Release);
        self.user_root.store(0, Ordering::Release);
    }
}

fn load_frame(slot: &AtomicUsize) -> Option<PhysicalAddress> {
    match slot.load(Ordering::Acquire) {
        0 => None,
        raw => Some(PhysicalAddress::new(raw)),
    }
}

/// Everything the translation layer keeps per CPU.
pub(crate) struct CpuState {
    pub(crate) idle: IdleState,
    current_id: AtomicU32,
    current: Mutex<Option<Arc<Context>>>,
    root: AtomicUsize,
    reduced_root: AtomicUsize,
    compat: AtomicUsize,
    per_cpu: Mutex<Option<Arc<Context>>>,
    trampolines: [TrampolineFrame; 2],
}

impl CpuState {
    pub(crate) fn new() -> Self {
        Self {
            idle: IdleState::new(),
            current_id: AtomicU32::new(ContextId::NONE),
            current: Mutex::new(None),
            root: AtomicUsize::new(0),
            reduced_root: AtomicUsize::new(0),
            compat: AtomicUsize::new(0),
            per_cpu: Mutex::new(None),
            trampolines: [const { TrampolineFrame::new() }; 2],
        }
    }

    /// Whether this CPU currently runs `id`.
    pub(crate) fn runs(&self, id: ContextId) -> bool {
        self.current_id.load(Ordering::Acquire) == id.get()
    }

    pub(crate) fn current(&self) -> Option<Arc<Context>> {
        self.current.lock().clone()
    }

    fn root(&self) -> Option<PhysicalAddress> {
        load_frame(&self.root)
    }

    fn reduced_root(&self) -> Option<PhysicalAddress> {
        load_frame(&self.reduced_root)
    }

    fn compat(&self) -> Option<PhysicalAddress> {
        load_frame(&self.compat)
    }

    /// Copies the top-level entries of `ctx` into this CPU's shadow and reduced-privilege roots.
    ///
    /// Must run on the CPU owning the state, or while that CPU is offline.
    pub(crate) fn refresh<A: Arch>(&self, arch: &A, ctx: &Context) {
        let Some(root) = self.root() else {
            return;
        };
        let tables = [Some(root), self.reduced_root()].into_iter().flatten();

        if ctx.is_compat32() {
            let Some(compat) = self.compat() else {
                log::error!("no compatibility page for {:?}", ctx.id());
                panic!("running 32-bit {:?} on a CPU without compatibility page", ctx.id());
            };

            for (index, entry) in ctx.copied_entries().iter().enumerate() {
                // Safety: the compatibility page is owned by this CPU
                unsafe { arch.table_entry(compat, index) }
                    .store(entry.load(Ordering::Acquire), Ordering::Release);
            }

            let link = Pte::table(compat, true).bits();
            for table in tables {
                for index in 0..USER_TOP_ENTRIES {
                    let value = if index == 0 { link } else { 0 };
                    // Safety: the roots are owned by this CPU
                    unsafe { arch.table_entry(table, index) }.store(value, Ordering::Release);
                }
            }
        } else {
            for table in tables {
                for (index, entry) in ctx.copied_entries().iter().enumerate() {
                    // Safety: the roots are owned by this CPU
                    unsafe { arch.table_entry(table, index) }
                        .store(entry.load(Ordering::Acquire), Ordering::Release);
                }
            }
        }

        log::trace!("refreshed shadow roots with {:?}", ctx.id());
    }
}

impl<A, F, P> Hat<A, F, P>
where
    A: Arch,
    F: FrameAllocator,
    P: PageDirectory,
{
    /// Brings `cpu` under management of the translation layer.
    ///
    /// Allocates the CPU's shadow root (plus the 32-bit compatibility page if enabled) and, with
    /// isolation enabled, builds its reduced-privilege root from `statics`. The CPU starts out
    /// running the kernel context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the per-CPU tables could not be allocated. Nothing is
    /// left behind in that case.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is already online.
    pub fn cpu_online(&self, cpu: CpuId, statics: &[StaticMapping]) -> Result<(), Error> {
        assert!(
            !self.online.contains(cpu),
            "{cpu:?} brought online twice"
        );
        let state = &self.cpus[cpu.get()];

        if let Err(err) = self.build_cpu_state(state, statics) {
            log::warn!("failed to bring {cpu:?} online: {err}");
            self.release_cpu_state(state);
            return Err(err);
        }

        let kernel_root = self.kernel_root();
        *state.current.lock() = Some(Arc::clone(&self.kernel));
        state
            .current_id
            .store(self.kernel.id().get(), Ordering::Release);
        for frame in &state.trampolines {
            frame.set(kernel_root, kernel_root);
        }

        self.online.insert(cpu);
        log::debug!("{cpu:?} online");
        Ok(())
    }

    fn build_cpu_state(&self, state: &CpuState, statics: &[StaticMapping]) -> Result<(), Error> {
        let root = self.allocate_cpu_frame()?;
        state.root.store(root.get(), Ordering::Release);

        // The kernel half never changes after preallocation, so one copy is enough.
        let kernel_root = self.kernel_root();
        for index in self.config.kernel_top_entries.clone() {
            // Safety: both frames are live top-level tables
            unsafe {
                let entry = self.arch.table_entry(kernel_root, index).load(Ordering::Acquire);
                self.arch
                    .table_entry(root, index)
                    .store(entry, Ordering::Release);
            }
        }

        if self.config.compat32 {
            let compat = self.allocate_cpu_frame()?;
            state.compat.store(compat.get(), Ordering::Release);
        }

        if self.config.isolation {
            let reduced = self.allocate_cpu_frame()?;
            state.reduced_root.store(reduced.get(), Ordering::Release);

            let id = self.registry.allocate_id();
            let root_node = self.arena.insert(Node::new(
                id,
                TOP_LEVEL,
                VirtualAddress::MIN,
                None,
                Backing::Owned(reduced),
            ));
            let ctx = Arc::new(Context::new(
                id,
                ContextFlags::PER_CPU,
                root_node,
                Some(reduced),
            ));
            *state.per_cpu.lock() = Some(Arc::clone(&ctx));

            for mapping in statics {
                self.load(
                    &ctx,
                    mapping.virt,
                    mapping.phys,
                    mapping.len,
                    mapping.attributes,
                    LoadFlags::LOCK | LoadFlags::NO_REVERSE_MAP,
                )?;
            }
        }

        Ok(())
    }

    fn allocate_cpu_frame(&self) -> Result<PhysicalAddress, Error> {
        let frame = self.frames.allocate_frame()?;
        // Safety: we just allocated the frame
        unsafe { self.arch.zero_frame(frame) };
        Ok(frame)
    }

    pub(crate) fn release_cpu_state(&self, state: &CpuState) {
        let per_cpu = state.per_cpu.lock().take();
        if let Some(ctx) = per_cpu {
            let mut st = ctx.lock();
            let mut pending = Pending::default();
            self.purge(&ctx, &mut st, &mut pending);
            self.finish(&ctx, &mut st, &mut pending);
        }

        for slot in [&state.root, &state.compat, &state.reduced_root] {
            let raw = slot.swap(0, Ordering::AcqRel);
            if raw != 0 {
                // Safety: the CPU is offline, nothing references its roots anymore
                unsafe {
                    self.frames
                        .deallocate_frame(PhysicalAddress::new(raw));
                }
            }
        }

        *state.current.lock() = None;
        state.current_id.store(ContextId::NONE, Ordering::Release);
        for frame in &state.trampolines {
            frame.clear();
        }
    }

    /// Releases the shadow set and reduced-privilege context of `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CpuOffline`] if `cpu` is not online.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` still runs a context other than the kernel context.
    ///
    /// # Safety
    ///
    /// `cpu` must have stopped executing: it must not have any of its roots loaded and must never
    /// take an interrupt through its trampolines again.
    pub unsafe fn cpu_offline(&self, cpu: CpuId) -> Result<(), Error> {
        if !self.online.contains(cpu) {
            return Err(Error::CpuOffline(cpu));
        }
        let state = &self.cpus[cpu.get()];

        if let Some(ctx) = state.current()
            && !ctx.is_kernel()
        {
            log::error!("{cpu:?} still runs {ctx:?}");
            panic!("taking {cpu:?} offline while it runs {:?}", ctx.id());
        }

        self.online.remove(cpu);
        self.release_cpu_state(state);

        log::debug!("{cpu:?} offline");
        Ok(())
    }

    /// Makes `ctx` the context running on the current CPU.
    ///
    /// Called by the scheduler on every dispatch, never while holding any lock of this crate.
    ///
    /// # Panics
    ///
    /// Panics if the current CPU is not online or `ctx` is a per-CPU context.
    pub fn switch_to(&self, ctx: &Arc<Context>) {
        let cpu = self.arch.current_cpu();
        assert!(
            self.online.contains(cpu),
            "switching contexts on offline {cpu:?}"
        );
        assert!(!ctx.is_per_cpu(), "per-CPU contexts can not be switched to");

        let state = &self.cpus[cpu.get()];
        let prev = state.current.lock().replace(Arc::clone(ctx));
        let changed = prev.as_ref().is_none_or(|prev| prev.id() != ctx.id());

        if changed
            && let Some(prev) = &prev
            && !prev.is_kernel()
        {
            prev.cpus.remove(cpu);
        }
        // Join the set before copying the top-level entries: a concurrent edit either sees us in
        // the set or its new entry is picked up by the refresh below.
        if !ctx.is_kernel() {
            ctx.cpus.insert(cpu);
        }
        state.current_id.store(ctx.id().get(), Ordering::Release);

        let root = if ctx.uses_shadow_copy() {
            state.refresh(&self.arch, ctx);
            state.root()
        } else {
            ctx.root_frame()
        };
        let Some(root) = root else {
            panic!("no root table for {:?} on {cpu:?}", ctx.id());
        };

        // Safety: every root carries the kernel half, the running code stays mapped
        unsafe {
            self.arch.set_active_table(root);
        }
        if changed {
            // Kernel accesses to the previous context's buffers may still be cached.
            self.arch.fence_all();
        }

        let user_root = match state.reduced_root() {
            Some(reduced) if ctx.is_user() => reduced,
            _ => root,
        };
        self.arch.without_interrupts(|| {
            for frame in &state.trampolines {
                frame.set(root, user_root);
            }
        });

        log::trace!("{cpu:?} switched to {:?}", ctx.id());
    }

    pub fn online_cpus(&self) -> &CpuSet {
        &self.online
    }

    /// The context `cpu` currently runs.
    pub fn current_context(&self, cpu: CpuId) -> Option<Arc<Context>> {
        self.cpus[cpu.get()].current()
    }

    pub fn trampolines(&self, cpu: CpuId) -> &[TrampolineFrame; 2] {
        &self.cpus[cpu.get()].trampolines
    }

    pub fn shadow_root(&self, cpu: CpuId) -> Option<PhysicalAddress> {
        self.cpus[cpu.get()].root()
    }

    pub fn reduced_root(&self, cpu: CpuId) -> Option<PhysicalAddress> {
        self.cpus[cpu.get()].reduced_root()
    }

    /// The context holding the reduced-privilege view of `cpu`.
    pub fn per_cpu_context(&self, cpu: CpuId) -> Option<Arc<Context>> {
        self.cpus[cpu.get()].per_cpu.lock().clone()
    }

    /// The top-level index range of the user half of a shadow root.
    pub fn user_top_entries(&self) -> Range<usize> {
        0..USER_TOP_ENTRIES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Setup, kernel_text};
    use crate::{AddressRangeExt, MemoryAttributes, PAGE_SIZE};

    const TRAMPOLINE: VirtualAddress = VirtualAddress::new(0xffff_ffff_ff00_0000);

    fn statics() -> [StaticMapping; 1] {
        [StaticMapping {
            virt: TRAMPOLINE,
            phys: PhysicalAddress::new(0x8000_0000),
            len: 2 * PAGE_SIZE,
            attributes: kernel_text(),
        }]
    }

    #[test_log::test]
    fn online_builds_reduced_root() {
        let setup = Setup::new(2);
        let hat = setup.hat();
        let cpu = CpuId::new(1);
        hat.cpu_online(cpu, &statics()).unwrap();

        let per_cpu = hat.per_cpu_context(cpu).unwrap();
        assert!(per_cpu.is_per_cpu());
        assert_eq!(per_cpu.mapped_pages(0), 2);
        assert_eq!(
            hat.lookup(&per_cpu, TRAMPOLINE.add(PAGE_SIZE)).map(|(phys, _, _)| phys),
            Some(PhysicalAddress::new(0x8000_1000))
        );

        let kernel_root = hat.kernel_context().root_frame();
        for frame in hat.trampolines(cpu) {
            assert_eq!(frame.kernel_root(), kernel_root);
            assert_eq!(frame.user_root(), kernel_root);
        }
    }

    #[test_log::test]
    fn trampolines_follow_switches() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let cpu = CpuId::new(0);
        hat.cpu_online(cpu, &statics()).unwrap();

        let ctx = hat.create_context(false);
        setup.machine().run_on(cpu, || hat.switch_to(&ctx));

        let shadow = hat.shadow_root(cpu);
        let reduced = hat.reduced_root(cpu);
        assert!(ctx.cpus().contains(cpu));
        assert_eq!(setup.machine().active_table(cpu), shadow);
        assert!(setup.machine().interrupts_enabled(cpu));
        for frame in hat.trampolines(cpu) {
            assert_eq!(frame.kernel_root(), shadow);
            assert_eq!(frame.user_root(), reduced);
        }

        let kernel = Arc::clone(hat.kernel_context());
        setup.machine().run_on(cpu, || hat.switch_to(&kernel));
        assert!(ctx.cpus().is_empty());
        for frame in hat.trampolines(cpu) {
            assert_eq!(frame.user_root(), kernel.root_frame());
        }
    }

    #[test_log::test]
    fn isolation_hides_kernel() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let machine = setup.machine();
        let cpu = CpuId::new(0);
        hat.cpu_online(cpu, &statics()).unwrap();

        let kernel_data = VirtualAddress::new(0xffff_ffff_8000_0000);
        hat.load(
            hat.kernel_context(),
            kernel_data,
            PhysicalAddress::new(0x9000_0000),
            PAGE_SIZE,
            MemoryAttributes::kernel_data(),
            LoadFlags::NO_REVERSE_MAP,
        )
        .unwrap();

        let ctx = hat.create_context(false);
        let user = VirtualAddress::new(0x40_0000);
        hat.load(
            &ctx,
            user,
            setup.frame(0),
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::empty(),
        )
        .unwrap();
        machine.run_on(cpu, || hat.switch_to(&ctx));

        // Full-privilege view: everything.
        let shadow = hat.shadow_root(cpu).unwrap();
        assert!(machine.translate_in(shadow, kernel_data).is_some());
        assert!(machine.translate_in(shadow, user).is_some());
        assert!(machine.translate_in(shadow, TRAMPOLINE).is_none());

        // Reduced view: the static surface and the user half only.
        let reduced = hat.trampolines(cpu)[0].user_root().unwrap();
        assert_eq!(Some(reduced), hat.reduced_root(cpu));
        assert!(machine.translate_in(reduced, kernel_data).is_none());
        assert!(machine.translate_in(reduced, user).is_some());
        assert!(machine.translate_in(reduced, TRAMPOLINE).is_some());
    }

    #[test_log::test]
    fn compat32_uses_intermediate_page() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let machine = setup.machine();
        let cpu = CpuId::new(0);
        hat.cpu_online(cpu, &[]).unwrap();

        let ctx = hat.create_context(true);
        let virt = VirtualAddress::new(0x8000_0000);
        hat.load(
            &ctx,
            virt,
            setup.frame(3),
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::empty(),
        )
        .unwrap();
        machine.run_on(cpu, || hat.switch_to(&ctx));

        let shadow = hat.shadow_root(cpu).unwrap();
        assert_eq!(machine.translate_in(shadow, virt), Some(setup.frame(3)));

        // Loading into a fresh gigabyte after the switch must reach the running CPU too.
        let high = VirtualAddress::new(0xc000_0000);
        machine.run_on(cpu, || {
            hat.load(
                &ctx,
                high,
                setup.frame(4),
                PAGE_SIZE,
                MemoryAttributes::user_data(),
                LoadFlags::empty(),
            )
            .unwrap();
        });
        assert_eq!(machine.translate_in(shadow, high), Some(setup.frame(4)));
    }

    #[test_log::test]
    fn offline_releases_frames() {
        let setup = Setup::new(2);
        let hat = setup.hat();
        let before = hat.frames().allocated_frames();

        let cpu = CpuId::new(1);
        hat.cpu_online(cpu, &statics()).unwrap();
        assert!(hat.frames().allocated_frames() > before);

        // Safety: the emulated CPU never executes anything
        unsafe { hat.cpu_offline(cpu).unwrap() };
        assert_eq!(hat.frames().allocated_frames(), before);
        assert!(hat.per_cpu_context(cpu).is_none());
        assert!(hat.trampolines(cpu)[0].kernel_root().is_none());

        // Safety: see above
        let err = unsafe { hat.cpu_offline(cpu) };
        assert_eq!(err, Err(Error::CpuOffline(cpu)));
    }

    #[test_log::test]
    #[should_panic = "while it runs"]
    fn offline_while_running_user() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let cpu = CpuId::new(0);
        hat.cpu_online(cpu, &[]).unwrap();

        let ctx = hat.create_context(false);
        setup.machine().run_on(cpu, || hat.switch_to(&ctx));

        // Safety: the emulated CPU never executes anything
        let _ = unsafe { hat.cpu_offline(cpu) };
    }

    #[test_log::test]
    fn failed_online_leaves_nothing_behind() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let before = hat.frames().allocated_frames();
        hat.frames().set_limit(Some(before + 2));

        let statics = [StaticMapping {
            virt: TRAMPOLINE,
            phys: PhysicalAddress::new(0x8000_0000),
            len: PAGE_SIZE,
            attributes: kernel_text(),
        }];
        let cpu = CpuId::new(0);
        assert_eq!(hat.cpu_online(cpu, &statics), Err(Error::OutOfMemory));
        assert!(!hat.online_cpus().contains(cpu));
        assert_eq!(hat.frames().allocated_frames(), before);

        let range = Range::<VirtualAddress>::from_start_len(TRAMPOLINE, PAGE_SIZE);
        assert!(range.is_page_aligned());
    }
}
