// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use smallvec::SmallVec;

use crate::arch::ENTRIES_PER_TABLE;
use crate::context::ContextId;
use crate::node::NodeHandle;
use crate::{Mutex, MutexGuard, PhysicalAddress};

bitflags::bitflags! {
    /// Hardware status accumulated for a physical page across all of its mappings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageStatus: u8 {
        /// Some mapping of the page has been accessed.
        const REFERENCED = 1 << 0;
        /// Some mapping of the page has been written to.
        const MODIFIED = 1 << 1;
    }
}

/// Lookup from physical frames to their descriptors.
///
/// This is implemented by the physical memory manager. Frames without a descriptor (device memory,
/// firmware tables) may only be mapped with [`LoadFlags::NO_REVERSE_MAP`](crate::LoadFlags).
pub trait PageDirectory: Sync {
    fn page(&self, frame: PhysicalAddress) -> Option<&Page>;
}

/// The translation layer's view of a physical page descriptor.
pub struct Page {
    frame: PhysicalAddress,
    status: AtomicU8,
    mappings: Mutex<MappingList>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("frame", &self.frame)
            .field("status", &self.status())
            .field("mappings", &self.mapping_count())
            .finish()
    }
}

impl Page {
    #[must_use]
    pub fn new(frame: PhysicalAddress) -> Self {
        Self {
            frame,
            status: AtomicU8::new(0),
            mappings: Mutex::new(MappingList::new()),
        }
    }

    pub fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    pub fn status(&self) -> PageStatus {
        PageStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    pub fn is_referenced(&self) -> bool {
        self.status().contains(PageStatus::REFERENCED)
    }

    pub fn is_modified(&self) -> bool {
        self.status().contains(PageStatus::MODIFIED)
    }

    /// Clears the given status bits, returning the previous status.
    pub fn clear_status(&self, status: PageStatus) -> PageStatus {
        PageStatus::from_bits_truncate(self.status.fetch_and(!status.bits(), Ordering::AcqRel))
    }

    pub(crate) fn record_status(&self, status: PageStatus) {
        if !status.is_empty() {
            self.status.fetch_or(status.bits(), Ordering::AcqRel);
        }
    }

    /// The number of page table entries currently mapping this page.
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    pub(crate) fn mappings(&self) -> MutexGuard<'_, MappingList> {
        self.mappings.lock()
    }
}

/// One page table entry mapping a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub(crate) context: ContextId,
    pub(crate) node: NodeHandle,
    index: u16,
}

impl Mapping {
    #[expect(clippy::cast_possible_truncation, reason = "tables have 512 entries")]
    pub(crate) fn new(context: ContextId, node: NodeHandle, index: usize) -> Self {
        debug_assert!(index < ENTRIES_PER_TABLE);
        Self {
            context,
            node,
            index: index as u16,
        }
    }

    pub(crate) fn index(&self) -> usize {
        usize::from(self.index)
    }
}

/// The reverse index of a page. The first mapping is stored inline, which covers the
/// overwhelmingly common case of a page mapped exactly once.
#[derive(Debug, Default)]
pub(crate) struct MappingList {
    entries: SmallVec<[Mapping; 1]>,
}

impl MappingList {
    pub(crate) fn new() -> Self {
        Self {
            entries: SmallVec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, node: NodeHandle, index: usize) -> bool {
        self.entries
            .iter()
            .any(|m| m.node == node && m.index() == index)
    }

    /// Records a new mapping.
    ///
    /// # Panics
    ///
    /// Panics if the `(node, index)` pair is already recorded: a single entry cannot map a page
    /// twice.
    pub(crate) fn insert(&mut self, mapping: Mapping) {
        assert!(
            !self.contains(mapping.node, mapping.index()),
            "duplicate mapping list entry {mapping:?}"
        );
        self.entries.push(mapping);
    }

    /// Removes the mapping for `(node, index)`, returning `false` if there was none.
    pub(crate) fn remove(&mut self, node: NodeHandle, index: usize) -> bool {
        match self
            .entries
            .iter()
            .position(|m| m.node == node && m.index() == index)
        {
            Some(pos) => {
                self.entries.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(index: usize) -> Mapping {
        Mapping::new(ContextId::new(1), NodeHandle::new(7, 0), index)
    }

    #[test]
    fn insert_and_remove() {
        let page = Page::new(PhysicalAddress::new(0x1000));
        {
            let mut list = page.mappings();
            list.insert(mapping(0));
            list.insert(mapping(1));
            assert!(list.contains(NodeHandle::new(7, 0), 1));
        }
        assert_eq!(page.mapping_count(), 2);

        assert!(page.mappings().remove(NodeHandle::new(7, 0), 0));
        assert!(!page.mappings().remove(NodeHandle::new(7, 0), 0));
        assert_eq!(page.mapping_count(), 1);
    }

    #[test]
    #[should_panic = "duplicate mapping list entry"]
    fn duplicate_entry() {
        let mut list = MappingList::new();
        list.insert(mapping(3));
        list.insert(mapping(3));
    }

    #[test]
    fn status_accumulates() {
        let page = Page::new(PhysicalAddress::new(0x1000));
        page.record_status(PageStatus::REFERENCED);
        page.record_status(PageStatus::MODIFIED);
        assert!(page.is_referenced() && page.is_modified());

        let old = page.clear_status(PageStatus::MODIFIED);
        assert_eq!(old, PageStatus::REFERENCED | PageStatus::MODIFIED);
        assert_eq!(page.status(), PageStatus::REFERENCED);
    }
}
