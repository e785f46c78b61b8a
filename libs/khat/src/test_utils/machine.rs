// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::arch::{self, ENTRIES_PER_TABLE, TOP_LEVEL};
use crate::{CpuId, PAGE_SIZE, PhysicalAddress, Pte, VirtualAddress};

std::thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
}

/// An emulated multi-CPU x86-64 machine. It is intended to be used in tests and models:
///
/// - a root table register per CPU,
/// - a per-CPU translation cache that keeps serving stale translations until invalidated,
/// - global translations surviving root table switches,
/// - the hardware setting referenced/modified bits while walking the tables and
/// - inter-processor interrupts, counted and delivered synchronously.
///
/// Page tables are read from and written to host memory, so they must be allocated through a
/// frame allocator that hands out identity-mapped host memory such as
/// [`TestFrameAllocator`](crate::test_utils::TestFrameAllocator). Data frames are never touched.
///
/// The CPU an operation runs on is selected per thread through [`Machine::run_on`], defaulting
/// to CPU 0.
pub struct Machine(Arc<MachineInner>);

struct MachineInner {
    cpus: Box<[Mutex<Cpu>]>,
    ipis: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct CachedTranslation {
    frame: PhysicalAddress,
    writable: bool,
    global: bool,
}

#[derive(Debug)]
struct Cpu {
    root: Option<PhysicalAddress>,
    /// Cached translations keyed by 4 KiB page.
    tlb: BTreeMap<VirtualAddress, CachedTranslation>,
    interrupts: bool,
}

impl Clone for Machine {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("cpus", &self.0.cpus.len())
            .field("ipis", &self.ipi_count())
            .finish_non_exhaustive()
    }
}

impl Machine {
    pub fn new(cpus: usize) -> Self {
        let cpus = (0..cpus)
            .map(|_| {
                Mutex::new(Cpu {
                    root: None,
                    tlb: BTreeMap::new(),
                    interrupts: true,
                })
            })
            .collect();

        Self(Arc::new(MachineInner {
            cpus,
            ipis: AtomicUsize::new(0),
        }))
    }

    pub fn cpus(&self) -> usize {
        self.0.cpus.len()
    }

    pub fn current_cpu(&self) -> CpuId {
        CpuId::new(CURRENT_CPU.get())
    }

    /// Runs `f` as if executing on `cpu`.
    pub fn run_on<R>(&self, cpu: CpuId, f: impl FnOnce() -> R) -> R {
        assert!(cpu.get() < self.cpus(), "{cpu:?} does not exist");
        let prev = CURRENT_CPU.replace(cpu.get());
        let r = f();
        CURRENT_CPU.set(prev);
        r
    }

    fn cpu(&self, cpu: CpuId) -> &Mutex<Cpu> {
        &self.0.cpus[cpu.get()]
    }

    /// Accesses `virt` on `cpu` the way the MMU would: through the translation cache first,
    /// walking the active tables on a miss.
    ///
    /// Returns `None` where the access would fault.
    pub fn access(&self, cpu: CpuId, virt: VirtualAddress, write: bool) -> Option<PhysicalAddress> {
        let mut cpu = self.cpu(cpu).lock();
        let page = virt.align_down(PAGE_SIZE);
        let offset = virt.offset_from_unsigned(page);

        if let Some(cached) = cpu.tlb.get(&page)
            && (!write || cached.writable)
        {
            return Some(cached.frame.add(offset));
        }

        let (frame, pte) = walk(cpu.root?, virt, write)?;
        if write && !pte.get(Pte::WRITABLE) {
            return None;
        }
        cpu.tlb.insert(
            page,
            CachedTranslation {
                frame,
                writable: pte.get(Pte::WRITABLE),
                global: pte.get(Pte::GLOBAL),
            },
        );
        Some(frame.add(offset))
    }

    /// Translates `virt` through the tables rooted at `root` without caching anything or touching
    /// the status bits.
    pub fn translate_in(&self, root: PhysicalAddress, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let (frame, _) = peek(root, virt)?;
        Some(frame.add(virt.offset_from_unsigned(virt.align_down(PAGE_SIZE))))
    }

    /// Returns `true` if `cpu` caches a translation for `virt`.
    pub fn tlb_contains(&self, cpu: CpuId, virt: VirtualAddress) -> bool {
        self.cpu(cpu)
            .lock()
            .tlb
            .contains_key(&virt.align_down(PAGE_SIZE))
    }

    pub fn active_table(&self, cpu: CpuId) -> Option<PhysicalAddress> {
        self.cpu(cpu).lock().root
    }

    pub fn ipi_count(&self) -> usize {
        self.0.ipis.load(Ordering::Acquire)
    }

    pub fn interrupts_enabled(&self, cpu: CpuId) -> bool {
        self.cpu(cpu).lock().interrupts
    }

    // ===== operations on the current CPU =====

    pub(crate) fn set_active_table(&self, root: PhysicalAddress) {
        let mut cpu = self.cpu(self.current_cpu()).lock();
        cpu.root = Some(root);
        cpu.tlb.retain(|_, cached| cached.global);
    }

    pub(crate) fn invalidate(&self, range: Range<VirtualAddress>) {
        let mut cpu = self.cpu(self.current_cpu()).lock();
        let start = range.start.align_down(PAGE_SIZE);
        cpu.tlb.retain(|page, _| *page < start || *page >= range.end);
    }

    pub(crate) fn invalidate_all(&self) {
        let mut cpu = self.cpu(self.current_cpu()).lock();
        cpu.tlb.retain(|_, cached| cached.global);
    }

    pub(crate) fn invalidate_global(&self) {
        self.cpu(self.current_cpu()).lock().tlb.clear();
    }

    pub(crate) fn set_interrupts(&self, enabled: bool) -> bool {
        let mut cpu = self.cpu(self.current_cpu()).lock();
        std::mem::replace(&mut cpu.interrupts, enabled)
    }

    pub(crate) fn send_ipis(&self, count: usize) {
        self.0.ipis.fetch_add(count, Ordering::AcqRel);
    }
}

fn slot(table: PhysicalAddress, index: usize) -> &'static AtomicU64 {
    debug_assert!(index < ENTRIES_PER_TABLE);
    let ptr = VirtualAddress::new(table.get() + index * size_of::<u64>())
        .as_ptr()
        .cast::<AtomicU64>();
    // Safety: page tables are identity-mapped host allocations and outlive every walk of them
    unsafe { &*ptr }
}

/// Walks the tables, returning the 4 KiB frame backing `virt` and the leaf entry.
fn peek(root: PhysicalAddress, virt: VirtualAddress) -> Option<(PhysicalAddress, Pte)> {
    let mut table = root;
    for level in (0..=TOP_LEVEL).rev() {
        let geometry = arch::level(level);
        let pte = Pte::from_bits(slot(table, geometry.index_of(virt)).load(Ordering::Acquire));

        if pte.is_vacant() {
            return None;
        }
        if pte.is_leaf(level) {
            let offset = virt
                .align_down(PAGE_SIZE)
                .offset_from_unsigned(virt.align_down(geometry.page_size()));
            return Some((pte.address().add(offset), pte));
        }
        table = pte.address();
    }

    unreachable!("level 0 entries are always leaves")
}

/// Like [`peek`] but sets the referenced and modified bits on the leaf like the hardware would.
fn walk(root: PhysicalAddress, virt: VirtualAddress, write: bool) -> Option<(PhysicalAddress, Pte)> {
    let mut table = root;
    for level in (0..=TOP_LEVEL).rev() {
        let geometry = arch::level(level);
        let entry = slot(table, geometry.index_of(virt));
        let pte = Pte::from_bits(entry.load(Ordering::Acquire));

        if pte.is_vacant() {
            return None;
        }
        if pte.is_leaf(level) {
            let status = Pte::new()
                .with(Pte::ACCESSED, true)
                .with(Pte::DIRTY, write && pte.get(Pte::WRITABLE));
            let pte = Pte::from_bits(entry.fetch_or(status.bits(), Ordering::AcqRel));

            let offset = virt
                .align_down(PAGE_SIZE)
                .offset_from_unsigned(virt.align_down(geometry.page_size()));
            return Some((pte.address().add(offset), pte));
        }
        table = pte.address();
    }

    unreachable!("level 0 entries are always leaves")
}
