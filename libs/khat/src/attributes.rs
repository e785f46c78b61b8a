// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::pte::CacheMode;

mycelium_bitfield::bitfield! {
    /// The protection and cacheability requested for a translation.
    ///
    /// x86-64 cannot express a present mapping that is not readable, so `READ` is implied by every
    /// installed entry and only reported back by lookups.
    #[derive(PartialEq, Eq)]
    pub struct MemoryAttributes<u8> {
        /// If set, reading from the memory region is allowed.
        pub const READ: bool;
        /// If set, writing to the memory region is allowed.
        pub const WRITE: bool;
        /// If set, instructions may be fetched from the memory region.
        pub const EXECUTE: bool;
        /// If set, the memory region is accessible from user mode.
        pub const USER: bool;
        pub const CACHE: CacheMode;
    }
}

// ===== impl MemoryAttributes =====

impl MemoryAttributes {
    /// Kernel read-write data.
    pub fn kernel_data() -> Self {
        Self::new()
            .with(Self::READ, true)
            .with(Self::WRITE, true)
    }

    /// User read-write data.
    pub fn user_data() -> Self {
        Self::kernel_data().with(Self::USER, true)
    }

    /// User read-only, executable text.
    pub fn user_text() -> Self {
        Self::new()
            .with(Self::READ, true)
            .with(Self::EXECUTE, true)
            .with(Self::USER, true)
    }

    pub fn allows_read(&self) -> bool {
        self.get(Self::READ)
    }

    pub fn allows_write(&self) -> bool {
        self.get(Self::WRITE)
    }

    pub fn allows_execution(&self) -> bool {
        self.get(Self::EXECUTE)
    }

    pub fn allows_user(&self) -> bool {
        self.get(Self::USER)
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.get(Self::CACHE)
    }
}
