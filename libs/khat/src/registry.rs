// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::Mutex;
use crate::context::{Context, ContextId};

/// The set of live address-space contexts.
///
/// The reclaim path consults it to find contexts it may take page tables from. It rotates a
/// cursor through the list so pressure is spread across all contexts instead of always hitting
/// the oldest one.
pub struct Registry {
    inner: Mutex<Inner>,
    next_id: AtomicU32,
}

struct Inner {
    live: bool,
    contexts: Vec<Arc<Context>>,
    cursor: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                live: false,
                contexts: Vec::new(),
                cursor: 0,
            }),
            next_id: AtomicU32::new(0),
        }
    }

    pub fn init(&self) {
        let mut inner = self.inner.lock();
        assert!(!inner.live, "context registry initialized twice");
        inner.live = true;
    }

    /// Shuts the registry down, returning every context still registered.
    pub fn teardown(&self) -> Vec<Arc<Context>> {
        let mut inner = self.inner.lock();
        inner.live = false;
        inner.cursor = 0;
        mem::take(&mut inner.contexts)
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().live
    }

    pub(crate) fn allocate_id(&self) -> ContextId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        assert_ne!(id, ContextId::NONE, "context ids exhausted");
        ContextId::new(id)
    }

    pub(crate) fn register(&self, context: Arc<Context>) {
        let mut inner = self.inner.lock();
        assert!(inner.live, "context registry is not initialized");
        inner.contexts.push(context);
    }

    pub(crate) fn unregister(&self, id: ContextId) -> Option<Arc<Context>> {
        let mut inner = self.inner.lock();
        let pos = inner.contexts.iter().position(|ctx| ctx.id() == id)?;
        let ctx = inner.contexts.swap_remove(pos);
        if inner.cursor >= inner.contexts.len() {
            inner.cursor = 0;
        }
        Some(ctx)
    }

    pub fn get(&self, id: ContextId) -> Option<Arc<Context>> {
        self.inner
            .lock()
            .contexts
            .iter()
            .find(|ctx| ctx.id() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the contexts `requester` may take page tables from, starting at the cursor.
    ///
    /// The kernel and per-CPU contexts, contexts being destroyed or already lending, and the
    /// requester itself are never candidates.
    pub(crate) fn reclaim_candidates(&self, requester: Option<ContextId>) -> Vec<Arc<Context>> {
        let mut inner = self.inner.lock();
        let len = inner.contexts.len();
        if len == 0 {
            return Vec::new();
        }

        let start = inner.cursor % len;
        inner.cursor = (start + 1) % len;

        let (tail, head) = inner.contexts.split_at(start);
        head.iter()
            .chain(tail)
            .filter(|ctx| {
                ctx.is_user()
                    && !ctx.is_reclaim_victim()
                    && !ctx.flags().contains(crate::ContextFlags::BEING_FREED)
                    && Some(ctx.id()) != requester
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFlags;
    use crate::node::NodeHandle;

    fn context(registry: &Registry, flags: ContextFlags) -> Arc<Context> {
        Arc::new(Context::new(
            registry.allocate_id(),
            flags | ContextFlags::SHADOW_COPY,
            NodeHandle::new(0, 0),
            None,
        ))
    }

    #[test]
    fn lifecycle() {
        let registry = Registry::new();
        registry.init();

        let a = context(&registry, ContextFlags::empty());
        registry.register(a.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(a.id()).is_some());

        assert!(registry.unregister(a.id()).is_some());
        assert!(registry.unregister(a.id()).is_none());

        registry.register(a.clone());
        let drained = registry.teardown();
        assert_eq!(drained.len(), 1);
        assert!(!registry.is_live());
    }

    #[test]
    #[should_panic = "not initialized"]
    fn register_before_init() {
        let registry = Registry::new();
        let a = context(&registry, ContextFlags::empty());
        registry.register(a);
    }

    #[test]
    fn candidates_rotate_and_filter() {
        let registry = Registry::new();
        registry.init();

        let ctxs: Vec<_> = (0..3)
            .map(|_| context(&registry, ContextFlags::empty()))
            .collect();
        for ctx in &ctxs {
            registry.register(ctx.clone());
        }

        let ids = |v: Vec<Arc<Context>>| v.iter().map(|c| c.id()).collect::<Vec<_>>();

        let first = ids(registry.reclaim_candidates(None));
        let second = ids(registry.reclaim_candidates(None));
        assert_eq!(first, [ctxs[0].id(), ctxs[1].id(), ctxs[2].id()]);
        assert_eq!(second, [ctxs[1].id(), ctxs[2].id(), ctxs[0].id()]);

        // lending and frozen contexts, as well as the requester, are skipped
        assert!(ctxs[1].try_lend());
        ctxs[2].freeze();
        let third = ids(registry.reclaim_candidates(Some(ctxs[0].id())));
        assert!(third.is_empty());
    }
}
