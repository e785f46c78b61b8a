// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `proptest` strategies for translation layer tests

use proptest::prelude::{Just, Strategy, prop_oneof};

use crate::{MemoryAttributes, PAGE_SIZE, VirtualAddress};

/// Produces page aligned `VirtualAddress`s of the `pages` pages following `base`
pub fn page_in(base: VirtualAddress, pages: usize) -> impl Strategy<Value = VirtualAddress> {
    (0..pages).prop_map(move |n| base.add(n * PAGE_SIZE))
}

/// Produces the protections a process mapping typically has
pub fn user_attributes() -> impl Strategy<Value = MemoryAttributes> {
    prop_oneof![
        Just(MemoryAttributes::user_data()),
        Just(MemoryAttributes::user_text()),
        Just(
            MemoryAttributes::user_data().with(MemoryAttributes::WRITE, false)
        ),
    ]
}
