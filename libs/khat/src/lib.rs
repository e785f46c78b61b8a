// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hardware address translation for x86-64.
//!
//! This crate owns the page-table hierarchies of every address space in the system. It
//! installs and removes translations, keeps a reverse index from physical pages to the entries
//! mapping them, reports hardware referenced/modified status back to the physical page
//! descriptors and coordinates TLB invalidation across CPUs.
//!
//! The central type is [`Hat`]. It is generic over three collaborators:
//!
//! - an [`Arch`] implementation that performs the privileged register accesses (CR3 loads,
//!   `invlpg`, cross-calls),
//! - a [`FrameAllocator`] that hands out page-table storage and
//! - a [`PageDirectory`] that resolves frames to their [`Page`] descriptors.
//!
//! With the `test_utils` feature enabled the crate ships an emulated multi-CPU machine so the
//! whole subsystem can be exercised on a hosted target.

#![cfg_attr(not(any(test, feature = "test_utils")), no_std)]

extern crate alloc;

mod address;
mod address_range;
pub mod arch;
mod attributes;
mod backoff;
mod config;
mod context;
mod cpu_set;
mod error;
mod flush;
mod frame_alloc;
mod hat;
mod ism;
mod node;
mod page;
mod percpu;
mod pte;
mod registry;
mod shootdown;
#[cfg(feature = "test_utils")]
pub mod test_utils;
mod walk;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_range::AddressRangeExt;
pub use arch::Arch;
pub use attributes::MemoryAttributes;
pub use config::HatConfig;
pub use context::{Context, ContextFlags, ContextId, ReclaimState};
pub use cpu_set::{CpuId, CpuSet, MAX_CPUS};
pub use error::Error;
pub use frame_alloc::{AllocError, FRAME_LAYOUT, FrameAllocator};
pub use hat::{Hat, LoadFlags, NodeInfo, PageMapping, SyncMode};
pub use node::NodeHandle;
pub use page::{Page, PageDirectory, PageStatus};
pub use percpu::{StaticMapping, TrampolineFrame};
pub use pte::{CacheMode, Pte};
pub use registry::Registry;
pub use walk::{Walk, WalkEntry};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;
pub const GIB: usize = 1024 * MIB;

/// The base page size of the architecture.
pub const PAGE_SIZE: usize = 4 * KIB;

pub(crate) type RawMutex = spin::mutex::SpinMutex<()>;
pub(crate) type Mutex<T> = lock_api::Mutex<RawMutex, T>;
pub(crate) type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;
