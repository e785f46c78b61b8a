// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ops::Range;

use crate::arch::Arch;
use crate::test_utils::Machine;
use crate::{CpuId, CpuSet, PhysicalAddress, VirtualAddress};

/// [`Arch`] implementation backed by an emulated [`Machine`]. For testing purposes.
#[derive(Debug, Clone)]
pub struct EmulateArch {
    machine: Machine,
}

impl EmulateArch {
    pub const fn new(machine: Machine) -> Self {
        Self { machine }
    }

    pub const fn machine(&self) -> &Machine {
        &self.machine
    }
}

impl Arch for EmulateArch {
    fn current_cpu(&self) -> CpuId {
        self.machine.current_cpu()
    }

    fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        // identity mapping
        VirtualAddress::new(phys.get())
    }

    fn active_table(&self) -> Option<PhysicalAddress> {
        self.machine.active_table(self.current_cpu())
    }

    unsafe fn set_active_table(&self, root: PhysicalAddress) {
        self.machine.set_active_table(root);
    }

    fn fence(&self, range: Range<VirtualAddress>) {
        self.machine.invalidate(range);
    }

    fn fence_all(&self) {
        self.machine.invalidate_all();
    }

    fn fence_global(&self) {
        self.machine.invalidate_global();
    }

    fn cross_call(&self, targets: &CpuSet, handler: &(dyn Fn(CpuId) + Sync)) {
        assert!(
            !targets.contains(self.current_cpu()),
            "cross-calling the current CPU"
        );

        self.machine.send_ipis(targets.len());
        for cpu in targets.iter() {
            self.machine.run_on(cpu, || handler(cpu));
        }
    }

    fn disable_interrupts(&self) -> bool {
        self.machine.set_interrupts(false)
    }

    fn restore_interrupts(&self, enabled: bool) {
        self.machine.set_interrupts(enabled);
    }
}
