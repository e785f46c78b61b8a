// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use static_assertions::assert_eq_size;

use crate::arch::level;
use crate::{MemoryAttributes, PAGE_SIZE, PhysicalAddress};

mycelium_bitfield::bitfield! {
    /// An x86-64 page table entry, bit for bit as the MMU reads it.
    ///
    /// Bits 9 through 11 are ignored by the hardware and carry software status:
    /// `NO_RESYNC`, `NO_REVERSE_MAP` and `LOCKED`.
    ///
    /// Bit 7 is the page-size bit for entries above level 0 and the PAT bit for level 0
    /// entries. This crate never programs the PAT, so a level 0 leaf always has it clear.
    #[derive(PartialEq, Eq)]
    pub struct Pte<u64> {
        pub const PRESENT: bool;
        pub const WRITABLE: bool;
        pub const USER: bool;
        /// Write-through (bit 3) and cache-disable (bit 4).
        pub const CACHE: CacheMode;
        pub const ACCESSED: bool;
        pub const DIRTY: bool;
        pub const HUGE: bool;
        pub const GLOBAL: bool;
        /// Don't copy referenced/modified status into the page descriptor.
        pub const NO_RESYNC: bool;
        /// No mapping list entry exists for this entry.
        pub const NO_REVERSE_MAP: bool;
        /// The entry is pinned and must not be reclaimed.
        pub const LOCKED: bool;
        /// Physical frame number.
        pub const FRAME = 40;
        const _AVAILABLE = 11;
        pub const NO_EXECUTE: bool;
    }
}

mycelium_bitfield::enum_from_bits! {
    /// Cacheability selected through the PWT/PCD bits with the power-on PAT layout.
    #[derive(Debug, Eq, PartialEq)]
    pub enum CacheMode<u8> {
        WriteBack = 0b00,
        WriteThrough = 0b01,
        UncachedMinus = 0b10,
        Uncached = 0b11,
    }
}

assert_eq_size!(Pte, u64);

impl Pte {
    pub const VACANT: Self = Self::new();

    #[expect(clippy::cast_possible_truncation, reason = "only built for 64-bit targets")]
    const fn frame_of(address: PhysicalAddress) -> u64 {
        (address.get() / PAGE_SIZE) as u64
    }

    /// Builds a leaf entry mapping `address` at `level`.
    ///
    /// Software status bits and `GLOBAL` are left clear, the caller adds them as needed.
    #[must_use]
    pub fn leaf(address: PhysicalAddress, at_level: u8, attributes: MemoryAttributes) -> Self {
        debug_assert!(address.is_aligned_to(level(at_level).page_size()));

        Self::new()
            .with(Self::PRESENT, true)
            .with(Self::HUGE, at_level > 0)
            .with(Self::FRAME, Self::frame_of(address))
            .with_attributes(attributes)
    }

    /// Builds an entry pointing at the next-level table in `address`.
    ///
    /// Table entries are maximally permissive; the leaf decides.
    #[must_use]
    pub fn table(address: PhysicalAddress, user: bool) -> Self {
        debug_assert!(address.is_aligned_to(PAGE_SIZE));

        Self::new()
            .with(Self::PRESENT, true)
            .with(Self::WRITABLE, true)
            .with(Self::USER, user)
            .with(Self::FRAME, Self::frame_of(address))
    }

    /// Returns a copy with the protection and cacheability of `attributes`, keeping the frame,
    /// the hardware status bits and all software bits.
    #[must_use]
    pub fn with_attributes(self, attributes: MemoryAttributes) -> Self {
        self.with(Self::WRITABLE, attributes.allows_write())
            .with(Self::USER, attributes.allows_user())
            .with(Self::NO_EXECUTE, !attributes.allows_execution())
            .with(Self::CACHE, attributes.cache_mode())
    }

    pub fn is_vacant(&self) -> bool {
        !self.get(Self::PRESENT)
    }

    /// Returns `true` if the entry terminates translation when found at `at_level`.
    pub fn is_leaf(&self, at_level: u8) -> bool {
        self.get(Self::PRESENT) && (at_level == 0 || self.get(Self::HUGE))
    }

    /// Returns `true` if the entry points to a next-level table when found at `at_level`.
    pub fn is_table(&self, at_level: u8) -> bool {
        self.get(Self::PRESENT) && at_level > 0 && !self.get(Self::HUGE)
    }

    #[expect(clippy::cast_possible_truncation, reason = "only built for 64-bit targets")]
    pub fn address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.get(Self::FRAME) as usize * PAGE_SIZE)
    }

    pub fn attributes(&self) -> MemoryAttributes {
        MemoryAttributes::new()
            .with(MemoryAttributes::READ, self.get(Self::PRESENT))
            .with(MemoryAttributes::WRITE, self.get(Self::WRITABLE))
            .with(MemoryAttributes::EXECUTE, !self.get(Self::NO_EXECUTE))
            .with(MemoryAttributes::USER, self.get(Self::USER))
            .with(MemoryAttributes::CACHE, self.get(Self::CACHE))
    }

    /// Returns a copy with the hardware referenced and modified bits cleared.
    #[must_use]
    pub fn without_status(self) -> Self {
        self.with(Self::ACCESSED, false).with(Self::DIRTY, false)
    }
}
