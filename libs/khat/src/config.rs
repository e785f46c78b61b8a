// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

use crate::VirtualAddress;
use crate::arch::{ENTRIES_PER_TABLE, TOP_LEVEL, USER_TOP_ENTRIES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HatConfig {
    /// Maintain a reduced-privilege root per CPU and point the user half of the trampoline frames
    /// at it.
    pub isolation: bool,
    /// Allocate the per-CPU intermediate page needed to run 32-bit compatibility contexts.
    pub compat32: bool,
    /// The largest level at which leaves are installed: `1` for 2 MiB pages, `2` for 1 GiB pages.
    pub max_page_level: u8,
    /// Start of the kernel half of the address space.
    pub kernel_base: VirtualAddress,
    /// Top-level entries of the kernel context that are created up front and never torn down.
    pub kernel_top_entries: Range<usize>,
    /// Invalidations spanning more pages than this are turned into a full flush.
    pub full_flush_threshold: usize,
}

impl Default for HatConfig {
    fn default() -> Self {
        Self {
            isolation: true,
            compat32: true,
            max_page_level: 1,
            kernel_base: VirtualAddress::new(0xffff_8000_0000_0000),
            kernel_top_entries: USER_TOP_ENTRIES..ENTRIES_PER_TABLE,
            full_flush_threshold: 32,
        }
    }
}

impl HatConfig {
    /// # Panics
    ///
    /// Panics if the configuration cannot describe a valid x86-64 setup.
    pub(crate) fn assert_valid(&self) {
        assert!(
            self.max_page_level < TOP_LEVEL,
            "leaves can not be installed at level {}",
            self.max_page_level
        );
        assert!(
            self.kernel_base.is_canonical() && self.kernel_base.is_upper_half(),
            "kernel base {} is not in the upper half",
            self.kernel_base
        );
        assert!(
            self.kernel_top_entries.start >= USER_TOP_ENTRIES
                && self.kernel_top_entries.end <= ENTRIES_PER_TABLE,
            "kernel top-level entries {:?} overlap the user half",
            self.kernel_top_entries
        );
    }
}
