// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

use arrayvec::ArrayVec;

use crate::arch::Arch;
use crate::{AddressRangeExt, VirtualAddress};

/// A batch of translation cache invalidations collected while editing page tables.
///
/// Contiguous ranges are merged as they are added, so a run of neighbouring pages costs a
/// single slot. Once all `CAP` slots are used the batch degrades to [`Flush::All`].
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flush<const CAP: usize = 16> {
    Ranges(ArrayVec<Range<VirtualAddress>, CAP>),
    All,
}

impl Default for Flush {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> Flush<CAP> {
    pub const fn new() -> Self {
        Self::Ranges(ArrayVec::new_const())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Flush::Ranges(ranges) => ranges.is_empty(),
            Flush::All => false,
        }
    }

    /// Adds `range` to the batch, returning `false` without changing anything if it neither
    /// extends the last range nor fits into a free slot.
    pub fn try_invalidate(&mut self, range: Range<VirtualAddress>) -> bool {
        match self {
            Flush::Ranges(ranges) => {
                if let Some(last) = ranges.last_mut()
                    && last.end == range.start
                {
                    last.end = range.end;
                    true
                } else {
                    ranges.try_push(range).is_ok()
                }
            }
            Flush::All => true,
        }
    }

    pub fn invalidate(&mut self, range: Range<VirtualAddress>) {
        if !self.try_invalidate(range) {
            self.invalidate_all();
        }
    }

    pub fn invalidate_all(&mut self) {
        *self = Flush::All;
    }

    /// Performs the invalidations on the current CPU.
    ///
    /// Ranges spanning more than `threshold` pages are replaced by a full flush. `global` also drops
    /// global translations in that case, which is needed for changes to the kernel half.
    pub fn apply<A: Arch + ?Sized>(&self, arch: &A, threshold: usize, global: bool) {
        let flush_everything = || {
            if global {
                arch.fence_global();
            } else {
                arch.fence_all();
            }
        };

        match self {
            Flush::Ranges(ranges) => {
                for range in ranges {
                    if range.page_count() > threshold {
                        log::trace!("range {range:?} above threshold, flushing everything");
                        flush_everything();
                        return;
                    }

                    log::trace!("flushing range {range:?}");
                    arch.fence(range.clone());
                }
            }
            Flush::All => {
                log::trace!("flushing entire address space");
                flush_everything();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    fn page(n: usize) -> Range<VirtualAddress> {
        Range::from_start_len(VirtualAddress::new(n * PAGE_SIZE), PAGE_SIZE)
    }

    #[test]
    fn contiguous_ranges_coalesce() {
        let mut flush: Flush<2> = Flush::new();
        assert!(flush.is_empty());

        for n in 0..8 {
            assert!(flush.try_invalidate(page(n)));
        }
        assert!(flush.try_invalidate(page(10)));

        let Flush::Ranges(ranges) = &flush else {
            panic!("expected ranges, found {flush:?}");
        };
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], VirtualAddress::new(0)..VirtualAddress::new(8 * PAGE_SIZE));
    }

    #[test]
    fn full_batch_degrades() {
        let mut flush: Flush<2> = Flush::new();
        flush.invalidate(page(0));
        flush.invalidate(page(2));
        assert!(!flush.try_invalidate(page(4)));

        flush.invalidate(page(4));
        assert_eq!(flush, Flush::All);
        assert!(flush.try_invalidate(page(6)));
    }
}
