// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::fmt;

use crate::{PAGE_SIZE, PhysicalAddress};

/// The layout of a single page-table frame.
pub const FRAME_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
    Ok(layout) => layout,
    Err(_) => panic!("invalid frame layout"),
};

/// The `AllocError` error indicates a frame allocation failure that may be due
/// to resource exhaustion or to something wrong when combining the given input
/// arguments with this allocator.
#[derive(Debug, Copy, Clone)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("physical memory allocation failed")
    }
}

impl core::error::Error for AllocError {}

/// The physical memory manager as seen by the translation layer: a source of page-table frames.
///
/// # Safety
///
/// Frames returned by an allocator must be valid, exclusively owned physical memory reachable
/// through [`Arch::phys_to_virt`](crate::Arch::phys_to_virt), and retain their validity until
/// they are deallocated.
pub unsafe trait FrameAllocator {
    /// Attempts to allocate a contiguous block of physical memory.
    ///
    /// On success, returns a [`PhysicalAddress`] meeting the size and alignment guarantees
    /// of `layout`. The contents of the block are unspecified.
    ///
    /// # Errors
    ///
    /// Returning `Err` indicates that either memory is exhausted or `layout` does not meet
    /// allocator's size or alignment constraints.
    fn allocate_contiguous(&self, layout: Layout) -> Result<PhysicalAddress, AllocError>;

    /// Deallocates the block of memory referenced by `block`.
    ///
    /// # Safety
    ///
    /// 1. `block` must denote a block of frames *currently allocated* via this allocator, and
    /// 2. `layout` must *fit* that block of frames.
    unsafe fn deallocate(&self, block: PhysicalAddress, layout: Layout);

    /// Allocates a single page-table frame.
    ///
    /// # Errors
    ///
    /// Returns `Err` if physical memory is exhausted.
    fn allocate_frame(&self) -> Result<PhysicalAddress, AllocError> {
        self.allocate_contiguous(FRAME_LAYOUT)
    }

    /// Returns a frame obtained from [`FrameAllocator::allocate_frame`].
    ///
    /// # Safety
    ///
    /// `frame` must have been allocated by this allocator and no page table may reference it
    /// anymore, neither in memory nor in any CPU's translation caches.
    unsafe fn deallocate_frame(&self, frame: PhysicalAddress) {
        // Safety: ensured by caller
        unsafe { self.deallocate(frame, FRAME_LAYOUT) }
    }

    /// Creates a "by reference" adapter for this instance of `FrameAllocator`.
    ///
    /// The returned adapter also implements `FrameAllocator` and will simply borrow this.
    #[inline(always)]
    fn by_ref(&self) -> &Self
    where
        Self: Sized,
    {
        self
    }
}

// Safety: we just forward to the inner implementation
unsafe impl<F> FrameAllocator for &F
where
    F: FrameAllocator + ?Sized,
{
    fn allocate_contiguous(&self, layout: Layout) -> Result<PhysicalAddress, AllocError> {
        (**self).allocate_contiguous(layout)
    }

    unsafe fn deallocate(&self, block: PhysicalAddress, layout: Layout) {
        // Safety: ensured by caller
        unsafe { (**self).deallocate(block, layout) }
    }
}
