// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::{AllocError, CpuId, VirtualAddress};

/// Recoverable failures of the translation layer.
///
/// Internal-consistency violations are not represented here: they indicate corrupted address
/// space state and halt the system on detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Page-table storage could not be allocated, not even by reclaiming it from another context.
    OutOfMemory,
    /// The requested translation lies inside an existing larger page at `level`. The caller may
    /// demote the larger page and retry.
    LargePageCollision { virt: VirtualAddress, level: u8 },
    /// The named CPU has not been brought online.
    CpuOffline(CpuId),
    /// `virt` is translated by a table borrowed from another context and can not be changed
    /// until it is detached.
    SharedTable { virt: VirtualAddress },
}

impl From<AllocError> for Error {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => f.write_str("out of page-table memory"),
            Error::LargePageCollision { virt, level } => {
                write!(f, "{virt} is covered by an existing level {level} page")
            }
            Error::CpuOffline(cpu) => write!(f, "cpu {cpu} is offline"),
            Error::SharedTable { virt } => {
                write!(f, "{virt} is translated by a table borrowed from another context")
            }
        }
    }
}

impl core::error::Error for Error {}
