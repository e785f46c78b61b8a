// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
    }
}

use core::ops::Range;
use core::ptr;
use core::sync::atomic::AtomicU64;

use crate::cpu_set::{CpuId, CpuSet};
use crate::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Number of significant virtual address bits with 4-level paging.
pub const VIRTUAL_ADDRESS_BITS: u32 = 48;

/// Number of entries in every page table, regardless of level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Level of the root table (PML4).
pub const TOP_LEVEL: u8 = 3;

/// Level of the root table for 32-bit compatibility contexts. Only the first
/// [`COMPAT32_TOP_ENTRIES`] entries of it are ever used.
pub const COMPAT32_TOP_LEVEL: u8 = 2;

/// Number of intermediate-level entries needed to cover a 4 GiB compatibility address space.
pub const COMPAT32_TOP_ENTRIES: usize = 4;

/// Number of top-level entries covering the lower (user) half of the address space.
pub const USER_TOP_ENTRIES: usize = ENTRIES_PER_TABLE / 2;

/// The geometry of one level of the page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableLevel {
    /// The number of address bits translated below this level.
    shift: u32,
    /// Whether entries at this level may terminate translation.
    supports_leaf: bool,
}

impl PageTableLevel {
    const fn new(shift: u32, supports_leaf: bool) -> Self {
        Self {
            shift,
            supports_leaf,
        }
    }

    /// The number of bytes translated by one entry at this level.
    pub const fn page_size(&self) -> usize {
        1 << self.shift
    }

    /// The number of bytes covered by a whole table at this level.
    pub const fn span(&self) -> usize {
        self.page_size() * ENTRIES_PER_TABLE
    }

    pub const fn supports_leaf(&self) -> bool {
        self.supports_leaf
    }

    /// Returns the index of the entry translating `virt` in a table of this level.
    pub const fn index_of(&self, virt: VirtualAddress) -> usize {
        (virt.get() >> self.shift) & (ENTRIES_PER_TABLE - 1)
    }

    /// Returns the base address of the table at this level that covers `virt`.
    ///
    /// For the top level this is the whole half of the address space.
    pub const fn table_base(&self, virt: VirtualAddress) -> VirtualAddress {
        virt.align_down(self.span())
    }
}

/// The 4-level x86-64 hierarchy, indexed by level: `LEVELS[0]` holds 4 KiB leaves, `LEVELS[3]` is
/// the PML4.
pub const LEVELS: [PageTableLevel; 4] = [
    PageTableLevel::new(12, true), // PT: 4 KiB pages
    PageTableLevel::new(21, true), // PD: 2 MiB pages
    PageTableLevel::new(30, true), // PDPT: 1 GiB pages
    PageTableLevel::new(39, false), // PML4
];

/// Returns the geometry of `level`.
///
/// # Panics
///
/// Panics if `level` is above [`TOP_LEVEL`].
pub const fn level(level: u8) -> PageTableLevel {
    LEVELS[level as usize]
}

const _: () = assert!(LEVELS[0].page_size() == PAGE_SIZE);

/// The narrow set of privileged operations the translation layer needs from the machine.
///
/// Everything that touches a control register, issues an invalidation instruction or sends an
/// inter-processor interrupt goes through this trait. The rest of the crate is plain data
/// structure manipulation and can be tested against an emulated machine.
pub trait Arch: Send + Sync {
    /// Returns the id of the CPU executing the caller.
    fn current_cpu(&self) -> CpuId;

    /// Translates a physical address into a virtual address through which the
    /// memory can be accessed, usually through a direct physical memory map.
    fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress;

    /// Return the physical address of the root table currently loaded on this CPU.
    fn active_table(&self) -> Option<PhysicalAddress>;

    /// Loads a new root table on this CPU (a write to `CR3`).
    ///
    /// # Safety
    ///
    /// `root` must point to a fully populated top-level table that maps at least the currently
    /// executing code and stack. Passing a bogus address will crash the machine on the next
    /// instruction fetch.
    unsafe fn set_active_table(&self, root: PhysicalAddress);

    /// Invalidates any cached translations for `range` on this CPU, including global ones.
    fn fence(&self, range: Range<VirtualAddress>);

    /// Invalidates every non-global cached translation on this CPU.
    fn fence_all(&self);

    /// Invalidates every cached translation on this CPU, global ones included.
    fn fence_global(&self);

    /// Runs `handler` on every CPU in `targets` and returns once all of them have finished.
    ///
    /// Implementations deliver this through inter-processor interrupts. The caller is never part of
    /// `targets`; local work is done directly.
    fn cross_call(&self, targets: &CpuSet, handler: &(dyn Fn(CpuId) + Sync));

    /// Masks interrupts on this CPU, returning whether they were enabled before.
    fn disable_interrupts(&self) -> bool;

    /// Restores the interrupt state previously returned by [`Arch::disable_interrupts`].
    fn restore_interrupts(&self, enabled: bool);

    /// Runs `f` with interrupts masked on this CPU.
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R
    where
        Self: Sized,
    {
        let enabled = self.disable_interrupts();
        let r = f();
        self.restore_interrupts(enabled);
        r
    }

    /// Returns the slot holding entry `index` of the page table backed by `table`.
    ///
    /// # Safety
    ///
    /// `table` must be a live page-table frame and `index` must be below [`ENTRIES_PER_TABLE`].
    #[allow(clippy::cast_ptr_alignment, reason = "page-table frames are page aligned")]
    unsafe fn table_entry(&self, table: PhysicalAddress, index: usize) -> &AtomicU64 {
        debug_assert!(index < ENTRIES_PER_TABLE);
        let slot = self
            .phys_to_virt(table)
            .add(index * size_of::<u64>())
            .as_ptr()
            .cast::<AtomicU64>();

        // Safety: ensured by caller
        unsafe { &*slot }
    }

    /// Fills the frame at `frame` with zeroes.
    ///
    /// # Safety
    ///
    /// `frame` must be a page-sized frame exclusively owned by the caller.
    unsafe fn zero_frame(&self, frame: PhysicalAddress) {
        let virt = self.phys_to_virt(frame);

        // Safety: ensured by caller
        unsafe {
            ptr::write_bytes(virt.as_mut_ptr(), 0, PAGE_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GIB, MIB};

    #[test]
    fn geometry() {
        assert_eq!(level(0).page_size(), PAGE_SIZE);
        assert_eq!(level(1).page_size(), 2 * MIB);
        assert_eq!(level(2).page_size(), GIB);
        assert_eq!(level(0).span(), 2 * MIB);
        assert!(!level(TOP_LEVEL).supports_leaf());
    }

    #[test]
    fn indices() {
        let virt = VirtualAddress::new(0xffff_ffff_8020_3000);
        assert_eq!(level(3).index_of(virt), 511);
        assert_eq!(level(2).index_of(virt), 510);
        assert_eq!(level(1).index_of(virt), 1);
        assert_eq!(level(0).index_of(virt), 3);

        assert_eq!(
            level(0).table_base(virt),
            VirtualAddress::new(0xffff_ffff_8020_0000)
        );
        assert_eq!(
            level(2).table_base(virt),
            VirtualAddress::new(0xffff_ff80_0000_0000)
        );
        assert_eq!(
            level(3).table_base(virt),
            VirtualAddress::new(0xffff_0000_0000_0000)
        );
    }
}
