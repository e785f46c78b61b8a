// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bare-metal [`Arch`] implementation.

use core::arch::asm;
use core::ops::Range;

use crate::arch::Arch;
use crate::cpu_set::{CpuId, CpuSet};
use crate::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

const CR3_ADDRESS_MASK: usize = 0x000f_ffff_ffff_f000;
const CR4_PGE: usize = 1 << 7;
const RFLAGS_IF: usize = 1 << 9;

/// The parts of the machine this crate does not own: figuring out which CPU we are on and
/// delivering inter-processor interrupts.
pub trait Platform: Send + Sync {
    fn current_cpu(&self) -> CpuId;

    /// Sends a cross-call to every CPU in `targets` and spins until each of them ran `handler`.
    fn send_cross_call(&self, targets: &CpuSet, handler: &(dyn Fn(CpuId) + Sync));
}

pub struct X86_64<P> {
    platform: P,
    physmap_base: VirtualAddress,
}

impl<P: Platform> X86_64<P> {
    /// # Safety
    ///
    /// All of physical memory must be mapped read-write at `physmap_base`.
    pub const unsafe fn new(platform: P, physmap_base: VirtualAddress) -> Self {
        Self {
            platform,
            physmap_base,
        }
    }

    pub const fn platform(&self) -> &P {
        &self.platform
    }
}

impl<P: Platform> Arch for X86_64<P> {
    fn current_cpu(&self) -> CpuId {
        self.platform.current_cpu()
    }

    fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        self.physmap_base.add(phys.get())
    }

    fn active_table(&self) -> Option<PhysicalAddress> {
        let cr3: usize;
        // Safety: reading CR3 has no side effects
        unsafe {
            asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }

        Some(PhysicalAddress::new(cr3 & CR3_ADDRESS_MASK))
    }

    unsafe fn set_active_table(&self, root: PhysicalAddress) {
        debug_assert!(root.is_aligned_to(PAGE_SIZE));

        // Safety: ensured by caller
        unsafe {
            asm!("mov cr3, {}", in(reg) root.get(), options(nostack, preserves_flags));
        }
    }

    fn fence(&self, range: Range<VirtualAddress>) {
        let mut virt = range.start.align_down(PAGE_SIZE);
        while virt < range.end {
            // Safety: invlpg only drops cached state
            unsafe {
                asm!("invlpg [{}]", in(reg) virt.get(), options(nostack, preserves_flags));
            }
            let Some(next) = virt.checked_add(PAGE_SIZE) else {
                break;
            };
            virt = next;
        }
    }

    fn fence_all(&self) {
        // Reloading CR3 drops every non-global translation.
        // Safety: we write back the value we just read
        unsafe {
            asm!(
                "mov {0}, cr3",
                "mov cr3, {0}",
                out(reg) _,
                options(nostack, preserves_flags)
            );
        }
    }

    fn fence_global(&self) {
        let enabled = self.disable_interrupts();

        // Safety: toggling CR4.PGE off and back on flushes the whole TLB, nothing else changes
        unsafe {
            let cr4: usize;
            asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
            asm!("mov cr4, {}", in(reg) cr4 & !CR4_PGE, options(nostack, preserves_flags));
            asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }

        self.restore_interrupts(enabled);
    }

    fn cross_call(&self, targets: &CpuSet, handler: &(dyn Fn(CpuId) + Sync)) {
        self.platform.send_cross_call(targets, handler);
    }

    fn disable_interrupts(&self) -> bool {
        let rflags: usize;
        // Safety: saving flags and masking interrupts is always allowed in ring 0
        unsafe {
            asm!("pushfq", "pop {}", "cli", out(reg) rflags, options(nomem));
        }
        rflags & RFLAGS_IF != 0
    }

    fn restore_interrupts(&self, enabled: bool) {
        if enabled {
            // Safety: interrupts were enabled when the matching `disable_interrupts` ran
            unsafe {
                asm!("sti", options(nomem, nostack));
            }
        }
    }
}
