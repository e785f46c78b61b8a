// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Page-table node bookkeeping.
//!
//! Every page table in the system is described by a [`Node`] stored in a single [`NodeArena`] and
//! referred to by a generation-checked [`NodeHandle`]. Nodes record how their table is backed:
//!
//! - [`Backing::Owned`]: the node exclusively owns its frame.
//! - [`Backing::Borrowed`]: the node reuses the frame of another context's node. The source node
//!   counts its borrowers in [`Node::shares`] and its frame lives until the last borrower is gone.
//!   The arena also keeps the list of borrowers per source so changes to the source's entries can
//!   be credited to every context translating through them.
//! - [`Backing::Copied`]: the top-level node of a shadow-copied context. Its entries live in the
//!   context itself and are copied into per-CPU roots on demand.

use alloc::vec::Vec;
use core::{fmt, mem};

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::context::ContextId;
use crate::{Mutex, PhysicalAddress, VirtualAddress};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

impl NodeHandle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({}v{})", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backing {
    Owned(PhysicalAddress),
    Borrowed {
        source: NodeHandle,
        frame: PhysicalAddress,
    },
    Copied,
}

impl Backing {
    pub(crate) fn frame(&self) -> Option<PhysicalAddress> {
        match self {
            Backing::Owned(frame) | Backing::Borrowed { frame, .. } => Some(*frame),
            Backing::Copied => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    pub(crate) owner: ContextId,
    pub(crate) level: u8,
    /// The lowest address translated through this node.
    pub(crate) base: VirtualAddress,
    pub(crate) parent: Option<NodeHandle>,
    pub(crate) backing: Backing,
    /// One for every in-flight holder and one for every child linked below this node.
    pub(crate) busy: u32,
    /// Number of present entries.
    pub(crate) valid: u32,
    /// Number of pinned entries.
    pub(crate) locked: u32,
    /// Number of nodes borrowing this node's frame.
    pub(crate) shares: u32,
    /// Created by a load that expects the node to be shared later; exempt from reclaim.
    pub(crate) share_hint: bool,
    /// Released by its owner while still borrowed. No longer reachable from any context.
    pub(crate) zombie: bool,
}

impl Node {
    pub(crate) fn new(
        owner: ContextId,
        level: u8,
        base: VirtualAddress,
        parent: Option<NodeHandle>,
        backing: Backing,
    ) -> Self {
        Self {
            owner,
            level,
            base,
            parent,
            backing,
            busy: 0,
            valid: 0,
            locked: 0,
            shares: 0,
            share_hint: false,
            zombie: false,
        }
    }

    pub(crate) fn is_borrowed(&self) -> bool {
        matches!(self.backing, Backing::Borrowed { .. })
    }

    /// Whether the node may be taken away from its owner under memory pressure.
    pub(crate) fn is_reclaimable(&self) -> bool {
        self.level == 0
            && self.busy == 0
            && self.locked == 0
            && self.shares == 0
            && !self.share_hint
            && !self.zombie
            && matches!(self.backing, Backing::Owned(_))
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
    borrowers: HashMap<NodeHandle, SmallVec<[NodeHandle; 2]>>,
}

impl Slots {
    fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.entries
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.node.as_mut())
    }
}

/// Storage for every node of every context.
///
/// The arena lock is a leaf lock: it is only ever held for the duration of a single accessor call
/// and no other lock is taken while holding it.
pub(crate) struct NodeArena {
    slots: Mutex<Slots>,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                len: 0,
                borrowers: HashMap::new(),
            }),
        }
    }

    pub(crate) fn insert(&self, node: Node) -> NodeHandle {
        let mut slots = self.slots.lock();
        slots.len += 1;

        if let Some(index) = slots.free.pop() {
            let slot = &mut slots.entries[index as usize];
            debug_assert!(slot.node.is_none());
            slot.node = Some(node);
            NodeHandle::new(index, slot.generation)
        } else {
            let index = u32::try_from(slots.entries.len()).expect("node arena exhausted");
            slots.entries.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeHandle::new(index, 0)
        }
    }

    pub(crate) fn remove(&self, handle: NodeHandle) -> Option<Node> {
        let mut slots = self.slots.lock();
        let slot = slots.entries.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }

        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(handle.index);
        slots.len -= 1;
        Some(node)
    }

    /// Returns a snapshot of the node, or `None` if the handle is stale.
    pub(crate) fn try_get(&self, handle: NodeHandle) -> Option<Node> {
        let slots = self.slots.lock();
        let slot = slots.entries.get(handle.index as usize)?;
        if slot.generation == handle.generation {
            slot.node
        } else {
            None
        }
    }

    /// Returns a snapshot of the node.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale. Handles reachable from a context's node hash are always
    /// live, so this indicates corrupted bookkeeping.
    pub(crate) fn get(&self, handle: NodeHandle) -> Node {
        self.try_get(handle)
            .unwrap_or_else(|| panic!("stale page table node handle {handle:?}"))
    }

    /// Runs `f` on the node under the arena lock.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub(crate) fn update<R>(&self, handle: NodeHandle, f: impl FnOnce(&mut Node) -> R) -> R {
        let mut slots = self.slots.lock();
        let node = slots
            .node_mut(handle)
            .unwrap_or_else(|| panic!("stale page table node handle {handle:?}"));

        f(node)
    }

    /// Records that `borrower` translates through the frame of `source`.
    pub(crate) fn lend(&self, source: NodeHandle, borrower: NodeHandle) {
        self.slots
            .lock()
            .borrowers
            .entry(source)
            .or_default()
            .push(borrower);
    }

    /// Removes `borrower` from the borrowers of `source` and takes the number of valid entries it
    /// was credited with.
    pub(crate) fn unlend(&self, source: NodeHandle, borrower: NodeHandle) -> u32 {
        let mut slots = self.slots.lock();
        if let Some(list) = slots.borrowers.get_mut(&source) {
            list.retain(|handle| *handle != borrower);
            if list.is_empty() {
                slots.borrowers.remove(&source);
            }
        }

        slots
            .node_mut(borrower)
            .map_or(0, |node| mem::take(&mut node.valid))
    }

    /// Returns the nodes currently borrowing `source`, each with the context it belongs to.
    pub(crate) fn borrowers(&self, source: NodeHandle) -> SmallVec<[(NodeHandle, ContextId); 2]> {
        let slots = self.slots.lock();
        let Some(list) = slots.borrowers.get(&source) else {
            return SmallVec::new();
        };

        list.iter()
            .filter_map(|&handle| {
                let slot = slots.entries.get(handle.index as usize)?;
                let node = slot.node.as_ref()?;
                (slot.generation == handle.generation).then_some((handle, node.owner))
            })
            .collect()
    }

    /// Runs `f` on `borrower` under the arena lock, provided it still borrows `source`.
    pub(crate) fn update_borrower<R>(
        &self,
        source: NodeHandle,
        borrower: NodeHandle,
        f: impl FnOnce(&mut Node) -> R,
    ) -> Option<R> {
        let mut slots = self.slots.lock();
        if !slots
            .borrowers
            .get(&source)
            .is_some_and(|list| list.contains(&borrower))
        {
            return None;
        }

        slots.node_mut(borrower).map(f)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len
    }

    /// Removes every node, invalidating all outstanding handles.
    pub(crate) fn drain(&self) -> Vec<Node> {
        let mut slots = self.slots.lock();
        slots.len = 0;
        slots.free.clear();
        slots.borrowers.clear();
        let entries = mem::take(&mut slots.entries);
        entries.into_iter().filter_map(|slot| slot.node).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(level: u8) -> Node {
        Node::new(
            ContextId::new(1),
            level,
            VirtualAddress::new(0x40_0000),
            None,
            Backing::Owned(PhysicalAddress::new(0x1000)),
        )
    }

    #[test]
    fn handles_are_generation_checked() {
        let arena = NodeArena::new();

        let a = arena.insert(node(0));
        assert_eq!(arena.len(), 1);
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());

        // the slot is reused with a new generation
        let b = arena.insert(node(1));
        assert_ne!(a, b);
        assert!(arena.try_get(a).is_none());
        assert_eq!(arena.get(b).level, 1);
    }

    #[test]
    fn update_counts() {
        let arena = NodeArena::new();
        let h = arena.insert(node(0));

        arena.update(h, |n| n.valid += 3);
        assert_eq!(arena.get(h).valid, 3);
        assert!(arena.get(h).is_reclaimable());

        arena.update(h, |n| n.locked = 1);
        assert!(!arena.get(h).is_reclaimable());
    }

    #[test]
    #[should_panic = "stale page table node handle"]
    fn stale_get_panics() {
        let arena = NodeArena::new();
        let h = arena.insert(node(0));
        arena.remove(h);
        let _ = arena.get(h);
    }

    #[test]
    fn borrowers_follow_lending() {
        let arena = NodeArena::new();
        let source = arena.insert(node(0));
        let borrower = arena.insert(Node::new(
            ContextId::new(2),
            0,
            VirtualAddress::new(0x80_0000),
            None,
            Backing::Borrowed {
                source,
                frame: PhysicalAddress::new(0x1000),
            },
        ));
        arena.update(borrower, |n| n.valid = 7);

        arena.lend(source, borrower);
        assert_eq!(
            arena.borrowers(source).as_slice(),
            [(borrower, ContextId::new(2))]
        );
        assert_eq!(arena.update_borrower(source, borrower, |n| n.valid += 1), Some(()));

        assert_eq!(arena.unlend(source, borrower), 8);
        assert_eq!(arena.get(borrower).valid, 0);
        assert!(arena.borrowers(source).is_empty());
        assert_eq!(arena.update_borrower(source, borrower, |n| n.valid += 1), None);
    }

    #[test]
    fn drain_invalidates_handles() {
        let arena = NodeArena::new();
        let a = arena.insert(node(0));
        arena.insert(node(1));

        assert_eq!(arena.drain().len(), 2);
        assert_eq!(arena.len(), 0);
        assert!(arena.try_get(a).is_none());
    }
}
