// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::iter::FusedIterator;

use crate::arch::{self, Arch};
use crate::context::Context;
use crate::frame_alloc::FrameAllocator;
use crate::hat::Hat;
use crate::node::NodeHandle;
use crate::page::PageDirectory;
use crate::pte::Pte;
use crate::VirtualAddress;

/// A leaf translation yielded by [`Walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkEntry {
    /// The first address translated by the entry.
    pub virt: VirtualAddress,
    pub level: u8,
    pub pte: Pte,
    pub node: NodeHandle,
    /// The entry lives in a table borrowed from another context.
    pub shared: bool,
}

/// A lazy walk over the leaf translations of a context, in address order.
///
/// The context is only locked while looking for the next entry, so a walk may be interleaved
/// with edits to the same context. It never yields an entry twice and always terminates. A walk
/// that was dropped can be picked up again with [`Walk::resume_at`] from its last
/// [`Walk::cursor`].
pub struct Walk<'a, A, F, P> {
    hat: &'a Hat<A, F, P>,
    ctx: &'a Context,
    cursor: Option<VirtualAddress>,
    end: VirtualAddress,
}

impl<'a, A, F, P> Walk<'a, A, F, P>
where
    A: Arch,
    F: FrameAllocator,
    P: PageDirectory,
{
    pub(crate) fn new(
        hat: &'a Hat<A, F, P>,
        ctx: &'a Context,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Self {
        Self {
            hat,
            ctx,
            cursor: Some(start),
            end,
        }
    }

    /// Continues a walk of `ctx` at `cursor`.
    pub fn resume_at(
        hat: &'a Hat<A, F, P>,
        ctx: &'a Context,
        cursor: VirtualAddress,
        end: VirtualAddress,
    ) -> Self {
        Self::new(hat, ctx, cursor, end)
    }

    /// The address the next entry will be searched from, `None` once the walk is exhausted.
    pub fn cursor(&self) -> Option<VirtualAddress> {
        self.cursor
    }
}

impl<A, F, P> Iterator for Walk<'_, A, F, P>
where
    A: Arch,
    F: FrameAllocator,
    P: PageDirectory,
{
    type Item = WalkEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let from = self.cursor?;

        let st = self.ctx.lock();
        let Some(leaf) = self.hat.next_leaf(self.ctx, &st, from, self.end) else {
            self.cursor = None;
            return None;
        };
        drop(st);

        self.cursor = leaf
            .virt
            .checked_add(arch::level(leaf.level).page_size());

        Some(WalkEntry {
            virt: leaf.virt,
            level: leaf.level,
            pte: leaf.pte,
            node: leaf.handle,
            shared: leaf.node.is_borrowed(),
        })
    }
}

impl<A, F, P> FusedIterator for Walk<'_, A, F, P>
where
    A: Arch,
    F: FrameAllocator,
    P: PageDirectory,
{
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::Setup;
    use crate::test_utils::proptest::page_in;
    use crate::{LoadFlags, MemoryAttributes, PAGE_SIZE};

    const BASE: VirtualAddress = VirtualAddress::new(0x40_0000);

    fn load(setup: &Setup, ctx: &Context, page: usize) {
        setup
            .hat()
            .load(
                ctx,
                BASE.add(page * PAGE_SIZE),
                setup.frame(page),
                PAGE_SIZE,
                MemoryAttributes::user_data(),
                LoadFlags::empty(),
            )
            .unwrap();
    }

    #[test_log::test]
    fn resume_after_edits() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);
        for page in [0, 3, 7] {
            load(&setup, &ctx, page);
        }

        let end = BASE.add(16 * PAGE_SIZE);
        let mut walk = hat.walk(&ctx, BASE, 16 * PAGE_SIZE);
        assert_eq!(walk.next().map(|entry| entry.virt), Some(BASE));
        let cursor = walk.cursor().unwrap();
        drop(walk);

        hat.unload(&ctx, BASE.add(3 * PAGE_SIZE), PAGE_SIZE, None);
        load(&setup, &ctx, 9);

        let rest: Vec<_> = Walk::resume_at(hat, &ctx, cursor, end)
            .map(|entry| entry.virt)
            .collect();
        assert_eq!(rest, [BASE.add(7 * PAGE_SIZE), BASE.add(9 * PAGE_SIZE)]);
    }

    #[test_log::test]
    fn unload_while_walking() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);
        for page in 0..8 {
            load(&setup, &ctx, page);
        }

        let mut seen = Vec::new();
        for entry in hat.walk(&ctx, BASE, 8 * PAGE_SIZE) {
            hat.unload(&ctx, entry.virt, PAGE_SIZE, None);
            seen.push(entry.virt);
        }

        assert_eq!(seen.len(), 8);
        assert_eq!(ctx.mapped_pages(0), 0);
    }

    #[test_log::test]
    fn walk_ends_at_top_of_address_space() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let kernel = hat.kernel_context();
        let last = VirtualAddress::new(0xffff_ffff_ffff_f000);
        hat.load(
            kernel,
            last,
            setup.frame(0),
            PAGE_SIZE,
            MemoryAttributes::kernel_data(),
            LoadFlags::NO_REVERSE_MAP,
        )
        .unwrap();

        let mut walk = hat.walk(kernel, last, PAGE_SIZE);
        assert_eq!(walk.next().map(|entry| entry.virt), Some(last));
        assert!(walk.cursor().is_none());
        assert!(walk.next().is_none());
    }

    proptest! {
        #[test]
        fn yields_every_page_once(pages in proptest::collection::btree_set(page_in(BASE, 64), 0..16)) {
            let setup = Setup::new(1);
            let hat = setup.hat();
            let ctx = hat.create_context(false);
            for virt in &pages {
                load(&setup, &ctx, virt.offset_from_unsigned(BASE) / PAGE_SIZE);
            }

            let walked: BTreeSet<_> = hat
                .walk(&ctx, VirtualAddress::MIN, usize::MAX)
                .map(|entry| entry.virt)
                .collect();
            prop_assert_eq!(walked, pages);
        }
    }
}
