// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

pub trait AddressRangeExt {
    type Address;
    fn from_start_len(start: Self::Address, len: usize) -> Self;

    /// Returns the length of the address range, in bytes.
    fn len(&self) -> usize;

    /// Returns the number of base pages covered by the range.
    fn page_count(&self) -> usize;

    /// Returns `true` if there exists an address present in both ranges.
    fn overlaps(&self, other: &Self) -> bool;

    /// Returns `true` if `other` lies entirely within `self`.
    fn covers(&self, other: &Self) -> bool;

    /// Returns the intersection of `self` and `other`.
    fn intersect(self, other: Self) -> Self;

    fn is_page_aligned(&self) -> bool;
}

macro_rules! impl_address_range {
    ($address_ty:ident) => {
        impl AddressRangeExt for ::core::ops::Range<$address_ty> {
            type Address = $address_ty;

            fn from_start_len(start: Self::Address, len: usize) -> Self {
                let end = start.add(len);

                Self { start, end }
            }

            fn len(&self) -> usize {
                self.end.offset_from_unsigned(self.start)
            }

            fn page_count(&self) -> usize {
                self.len().div_ceil(PAGE_SIZE)
            }

            fn overlaps(&self, other: &Self) -> bool {
                self.start < other.end && other.start < self.end
            }

            fn covers(&self, other: &Self) -> bool {
                self.start <= other.start && other.end <= self.end
            }

            fn intersect(self, other: Self) -> Self {
                Self {
                    start: core::cmp::max(self.start, other.start),
                    end: core::cmp::min(self.end, other.end),
                }
            }

            fn is_page_aligned(&self) -> bool {
                self.start.is_aligned_to(PAGE_SIZE) && self.end.is_aligned_to(PAGE_SIZE)
            }
        }
    };
}

impl_address_range!(VirtualAddress);
impl_address_range!(PhysicalAddress);

#[cfg(test)]
mod tests {
    use core::ops::Range;

    use super::{AddressRangeExt, *};

    proptest::proptest! {
        #[test]
        fn len(start in 0usize..0x8000_0000_0000, len in 0usize..0x1_0000_0000) {
            let r: Range<VirtualAddress> = Range::from_start_len(VirtualAddress::new(start), len);

            proptest::prop_assert_eq!(len, AddressRangeExt::len(&r));
            proptest::prop_assert_eq!(len.div_ceil(PAGE_SIZE), r.page_count());
        }

        #[test]
        fn intersection_is_covered(a in 0usize..0x10000, b in 0usize..0x10000, la in 1usize..0x1000, lb in 1usize..0x1000) {
            let ra = Range::<VirtualAddress>::from_start_len(VirtualAddress::new(a), la);
            let rb = Range::<VirtualAddress>::from_start_len(VirtualAddress::new(b), lb);

            if ra.overlaps(&rb) {
                let i = ra.clone().intersect(rb.clone());
                proptest::prop_assert!(ra.covers(&i));
                proptest::prop_assert!(rb.covers(&i));
            }
        }
    }
}
