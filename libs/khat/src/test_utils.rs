// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod arch;
mod machine;
pub mod proptest;

use core::alloc::Layout;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;

pub use arch::EmulateArch;
pub use machine::Machine;
use parking_lot::Mutex;

use crate::{
    AllocError, CpuId, FrameAllocator, Hat, HatConfig, MemoryAttributes, PAGE_SIZE, Page,
    PageDirectory, PhysicalAddress,
};

pub type TestHat = Hat<EmulateArch, TestFrameAllocator, TestPages>;

/// A frame allocator handing out zeroed host memory, so the emulated [`Machine`] can walk the
/// page tables built in it.
pub struct TestFrameAllocator {
    allocations: Mutex<HashMap<PhysicalAddress, Layout>>,
    limit: AtomicUsize,
}

impl Default for TestFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TestFrameAllocator {
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            limit: AtomicUsize::new(usize::MAX),
        }
    }

    #[must_use]
    pub fn with_limit(self, limit: usize) -> Self {
        self.set_limit(Some(limit));
        self
    }

    /// Caps the number of outstanding allocations. Allocations beyond it fail.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.limit
            .store(limit.unwrap_or(usize::MAX), Ordering::Release);
    }

    pub fn allocated_frames(&self) -> usize {
        self.allocations.lock().len()
    }
}

// Safety: frames are fresh host allocations, identity mapped by `EmulateArch`
unsafe impl FrameAllocator for TestFrameAllocator {
    fn allocate_contiguous(&self, layout: Layout) -> Result<PhysicalAddress, AllocError> {
        let mut allocations = self.allocations.lock();
        if allocations.len() >= self.limit.load(Ordering::Acquire) {
            return Err(AllocError);
        }

        // Safety: frame layouts are never zero-sized
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(AllocError);
        }

        let frame = PhysicalAddress::from_ptr(ptr);
        allocations.insert(frame, layout);
        Ok(frame)
    }

    unsafe fn deallocate(&self, block: PhysicalAddress, layout: Layout) {
        let expected = self
            .allocations
            .lock()
            .remove(&block)
            .unwrap_or_else(|| panic!("freeing {block}, which is not allocated"));
        assert_eq!(layout, expected);

        // Safety: the block was allocated above with the same layout
        unsafe { std::alloc::dealloc(block.as_mut_ptr(), layout) };
    }
}

impl Drop for TestFrameAllocator {
    fn drop(&mut self) {
        for (frame, layout) in self.allocations.get_mut().drain() {
            // Safety: the block was allocated with this layout and is no longer used
            unsafe { std::alloc::dealloc(frame.as_mut_ptr(), layout) };
        }
    }
}

/// Page descriptors for a synthetic range of data frames. The frames are never dereferenced.
pub struct TestPages {
    base: PhysicalAddress,
    pages: Box<[Page]>,
}

impl TestPages {
    pub fn new(base: PhysicalAddress, count: usize) -> Self {
        assert!(base.is_aligned_to(PAGE_SIZE));
        Self {
            base,
            pages: (0..count)
                .map(|n| Page::new(base.add(n * PAGE_SIZE)))
                .collect(),
        }
    }

    pub fn frame(&self, n: usize) -> PhysicalAddress {
        assert!(n < self.pages.len(), "frame {n} out of range");
        self.base.add(n * PAGE_SIZE)
    }

    pub fn get(&self, n: usize) -> &Page {
        &self.pages[n]
    }
}

impl PageDirectory for TestPages {
    fn page(&self, frame: PhysicalAddress) -> Option<&Page> {
        let offset = frame.get().checked_sub(self.base.get())?;
        self.pages.get(offset / PAGE_SIZE)
    }
}

/// First data frame handed out by [`Setup`]. 1 GiB aligned so tests can build large pages.
pub const DATA_BASE: PhysicalAddress = PhysicalAddress::new(0x0010_0000_0000);

/// Number of data frames with descriptors in a [`Setup`].
pub const DATA_FRAMES: usize = 2048;

/// The configuration used by [`Setup`]: the default, except only the last kernel top-level entry
/// is preallocated to keep the frame count of tests small.
pub fn test_config() -> HatConfig {
    HatConfig {
        kernel_top_entries: 511..512,
        ..HatConfig::default()
    }
}

/// Read-only, executable kernel memory.
pub fn kernel_text() -> MemoryAttributes {
    MemoryAttributes::new()
        .with(MemoryAttributes::READ, true)
        .with(MemoryAttributes::EXECUTE, true)
}

/// An emulated machine with a translation layer on top.
pub struct Setup {
    machine: Machine,
    hat: TestHat,
}

impl Setup {
    pub fn new(cpus: usize) -> Self {
        Self::with_config(cpus, test_config())
    }

    pub fn with_config(cpus: usize, config: HatConfig) -> Self {
        let machine = Machine::new(cpus);
        let hat = Hat::new(
            EmulateArch::new(machine.clone()),
            TestFrameAllocator::new(),
            TestPages::new(DATA_BASE, DATA_FRAMES),
            config,
        )
        .unwrap();

        Self { machine, hat }
    }

    pub fn hat(&self) -> &TestHat {
        &self.hat
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// The `n`th data frame.
    pub fn frame(&self, n: usize) -> PhysicalAddress {
        self.hat.pages().frame(n)
    }

    pub fn page(&self, n: usize) -> &Page {
        self.hat.pages().get(n)
    }

    /// Brings the first `count` CPUs online without any static mappings.
    pub fn bring_online(&self, count: usize) {
        for cpu in 0..count {
            self.machine
                .run_on(CpuId::new(cpu), || self.hat.cpu_online(CpuId::new(cpu), &[]))
                .unwrap();
        }
    }

    pub fn into_hat(self) -> TestHat {
        self.hat
    }
}
