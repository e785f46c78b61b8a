// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU64, AtomicUsize, Ordering};

use hashbrown::HashMap;

use crate::arch::{COMPAT32_TOP_ENTRIES, COMPAT32_TOP_LEVEL, TOP_LEVEL, USER_TOP_ENTRIES};
use crate::backoff::Backoff;
use crate::cpu_set::CpuSet;
use crate::node::NodeHandle;
use crate::{Mutex, MutexGuard, PhysicalAddress, VirtualAddress};

/// The number of levels that can hold leaf entries.
pub(crate) const LEAF_LEVELS: usize = 3;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u32);

impl ContextId {
    pub(crate) const NONE: u32 = u32::MAX;

    pub(crate) const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u16 {
        /// The top-level table is not backed by a frame; CPUs run on a per-CPU copy.
        const SHADOW_COPY = 1 << 0;
        /// 32-bit compatibility context, only the low 4 GiB are translated.
        const COMPAT32 = 1 << 1;
        /// The kernel context.
        const KERNEL = 1 << 2;
        /// A CPU's reduced-privilege context.
        const PER_CPU = 1 << 3;
        /// Destruction has started.
        const BEING_FREED = 1 << 4;
        /// Some nodes of this context are borrowed from, or lent to, another context.
        const SHARES_TABLES = 1 << 5;
    }
}

/// Where a context stands with respect to page-table reclaim.
///
/// ```text
///        try_lend            freeze
///  Idle ─────────▶ Lending   Idle ───────▶ Frozen
///   ▲                 │
///   └─────────────────┘
///       finish_lending
/// ```
///
/// A context being destroyed waits for an in-flight `Lending` to return to `Idle` before it
/// moves to `Frozen`, after which it is never lent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReclaimState {
    Idle = 0,
    Lending = 1,
    Frozen = 2,
}

impl ReclaimState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Lending,
            _ => Self::Frozen,
        }
    }
}

/// The translation set of one address space or of one CPU's reduced-privilege view.
pub struct Context {
    id: ContextId,
    flags: AtomicU16,
    pub(crate) cpus: CpuSet,
    reclaim: AtomicU8,
    mapped: [AtomicUsize; LEAF_LEVELS],
    /// The top-level entries of a shadow-copied context.
    copied: Box<[AtomicU64]>,
    /// The frame of the top-level table for contexts that are not shadow-copied.
    root_frame: Option<PhysicalAddress>,
    pub(crate) state: Mutex<ContextState>,
}

/// The part of a context protected by its lock.
pub(crate) struct ContextState {
    pub(crate) root: NodeHandle,
    /// Every non-root node of the context keyed by `(level, base)`.
    pub(crate) nodes: HashMap<(u8, VirtualAddress), NodeHandle>,
    /// A top-level entry changed since the last shootdown; CPUs running the context must refresh
    /// their copy.
    pub(crate) top_changed: bool,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("flags", &self.flags())
            .field("cpus", &self.cpus)
            .field("reclaim", &self.reclaim_state())
            .field("mapped", &self.mapped)
            .field("root_frame", &self.root_frame)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        flags: ContextFlags,
        root: NodeHandle,
        root_frame: Option<PhysicalAddress>,
    ) -> Self {
        let copied_entries = if !flags.contains(ContextFlags::SHADOW_COPY) {
            0
        } else if flags.contains(ContextFlags::COMPAT32) {
            COMPAT32_TOP_ENTRIES
        } else {
            USER_TOP_ENTRIES
        };
        debug_assert_eq!(
            root_frame.is_none(),
            flags.contains(ContextFlags::SHADOW_COPY)
        );

        Self {
            id,
            flags: AtomicU16::new(flags.bits()),
            cpus: CpuSet::new(),
            reclaim: AtomicU8::new(ReclaimState::Idle as u8),
            mapped: [const { AtomicUsize::new(0) }; LEAF_LEVELS],
            copied: (0..copied_entries).map(|_| AtomicU64::new(0)).collect(),
            root_frame,
            state: Mutex::new(ContextState {
                root,
                nodes: HashMap::new(),
                top_changed: false,
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn flags(&self) -> ContextFlags {
        let mut flags = ContextFlags::from_bits_truncate(self.flags.load(Ordering::Acquire));
        if self.reclaim_state() == ReclaimState::Frozen {
            flags |= ContextFlags::BEING_FREED;
        }
        flags
    }

    pub(crate) fn insert_flags(&self, flags: ContextFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn is_kernel(&self) -> bool {
        self.flags().contains(ContextFlags::KERNEL)
    }

    pub fn is_per_cpu(&self) -> bool {
        self.flags().contains(ContextFlags::PER_CPU)
    }

    /// A context belonging to a process, as opposed to the kernel or a CPU.
    pub fn is_user(&self) -> bool {
        !self
            .flags()
            .intersects(ContextFlags::KERNEL | ContextFlags::PER_CPU)
    }

    pub fn uses_shadow_copy(&self) -> bool {
        self.flags().contains(ContextFlags::SHADOW_COPY)
    }

    pub fn is_compat32(&self) -> bool {
        self.flags().contains(ContextFlags::COMPAT32)
    }

    pub fn shares_tables(&self) -> bool {
        self.flags().contains(ContextFlags::SHARES_TABLES)
    }

    /// The CPUs currently running this context.
    pub fn cpus(&self) -> &CpuSet {
        &self.cpus
    }

    pub(crate) fn top_level(&self) -> u8 {
        if self.is_compat32() {
            COMPAT32_TOP_LEVEL
        } else {
            TOP_LEVEL
        }
    }

    pub(crate) fn root_frame(&self) -> Option<PhysicalAddress> {
        self.root_frame
    }

    pub(crate) fn copied_entry(&self, index: usize) -> &AtomicU64 {
        self.copied.get(index).unwrap_or_else(|| {
            panic!(
                "top-level index {index} outside the {} entries copied for {:?}",
                self.copied.len(),
                self.id
            )
        })
    }

    pub(crate) fn copied_entries(&self) -> &[AtomicU64] {
        &self.copied
    }

    /// The number of leaf entries at `level` reachable from this context's root.
    pub fn mapped_pages(&self, level: u8) -> usize {
        self.mapped[level as usize].load(Ordering::Acquire)
    }

    pub(crate) fn add_mapped(&self, level: u8, count: usize) {
        self.mapped[level as usize].fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn sub_mapped(&self, level: u8, count: usize) {
        let prev = self.mapped[level as usize].fetch_sub(count, Ordering::AcqRel);
        debug_assert!(prev >= count, "mapped page counter underflow");
    }

    /// The number of page-table nodes currently linked into this context, the root excluded.
    pub fn resident_nodes(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock()
    }

    // ===== reclaim state machine =====

    pub fn reclaim_state(&self) -> ReclaimState {
        ReclaimState::from_u8(self.reclaim.load(Ordering::Acquire))
    }

    /// Whether some reclaimer is currently taking page tables away from this context.
    pub fn is_reclaim_victim(&self) -> bool {
        self.reclaim_state() == ReclaimState::Lending
    }

    /// Attempts to start lending page tables to a reclaimer.
    pub(crate) fn try_lend(&self) -> bool {
        self.reclaim
            .compare_exchange(
                ReclaimState::Idle as u8,
                ReclaimState::Lending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn finish_lending(&self) {
        let prev = self
            .reclaim
            .swap(ReclaimState::Idle as u8, Ordering::AcqRel);
        debug_assert_eq!(prev, ReclaimState::Lending as u8);
    }

    /// Waits out any in-flight lending and moves the context to [`ReclaimState::Frozen`].
    pub(crate) fn freeze(&self) {
        let mut backoff = Backoff::new();
        loop {
            match self.reclaim.compare_exchange_weak(
                ReclaimState::Idle as u8,
                ReclaimState::Frozen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(raw) if raw == ReclaimState::Frozen as u8 => return,
                Err(_) => backoff.spin(),
            }
        }
    }
}
