// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared mappings: page tables shared outright between contexts.
//!
//! Attaching a region that is backed by fully populated, 2 MiB aligned leaf tables in the source
//! links those very tables into the destination instead of copying their entries. Everything
//! else is materialized as independent translations. Only leaf tables are ever shared.

use alloc::vec::Vec;

use crate::arch::{self, Arch, ENTRIES_PER_TABLE};
use crate::context::{Context, ContextFlags, ContextState};
use crate::frame_alloc::FrameAllocator;
use crate::hat::{Hat, LoadFlags, Pending};
use crate::node::{Backing, NodeHandle};
use crate::page::PageDirectory;
use crate::pte::Pte;
use crate::{AddressRangeExt, Error, PAGE_SIZE, VirtualAddress};

impl<A, F, P> Hat<A, F, P>
where
    A: Arch,
    F: FrameAllocator,
    P: PageDirectory,
{
    /// Makes `[virt, virt + len)` of `dst` translate like `[src_virt, src_virt + len)` of `src`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] or [`Error::LargePageCollision`] if a translation could not
    /// be materialized, and [`Error::SharedTable`] if part of the destination already borrows a
    /// different table. Attaching the same region again succeeds without changes. Chunks attached
    /// before a failure stay attached.
    ///
    /// # Panics
    ///
    /// Panics if either context is not a process context, both are the same, or the ranges are
    /// not page aligned.
    pub fn attach(
        &self,
        dst: &Context,
        virt: VirtualAddress,
        src: &Context,
        src_virt: VirtualAddress,
        len: usize,
    ) -> Result<(), Error> {
        assert!(
            dst.is_user() && src.is_user() && dst.id() != src.id(),
            "can not attach {:?} to {:?}",
            src.id(),
            dst.id()
        );
        assert!(
            virt.is_aligned_to(PAGE_SIZE)
                && src_virt.is_aligned_to(PAGE_SIZE)
                && len % PAGE_SIZE == 0,
            "unaligned attach of {len:#x} bytes at {virt}"
        );

        // always lock in id order
        let (mut dst_st, src_st) = if dst.id() < src.id() {
            let dst_st = dst.lock();
            (dst_st, src.lock())
        } else {
            let src_st = src.lock();
            (dst.lock(), src_st)
        };

        let chunk = arch::level(0).span();
        let mut pending = Pending::default();
        let mut result = Ok(());
        let mut offset = 0;
        while offset < len {
            let dst_virt = virt.add(offset);
            let step = (chunk - dst_virt.get() % chunk).min(len - offset);

            result = self.attach_chunk(
                dst,
                &mut dst_st,
                dst_virt,
                src,
                &src_st,
                src_virt.add(offset),
                step,
                &mut pending,
            );
            if result.is_err() {
                break;
            }
            offset += step;
        }

        drop(src_st);
        self.finish(dst, &mut dst_st, &mut pending);

        log::debug!(
            "attached {len:#x} bytes of {:?} at {src_virt} to {:?} at {virt}",
            src.id(),
            dst.id()
        );
        result
    }

    fn attach_chunk(
        &self,
        dst: &Context,
        dst_st: &mut ContextState,
        virt: VirtualAddress,
        src: &Context,
        src_st: &ContextState,
        src_virt: VirtualAddress,
        len: usize,
        pending: &mut Pending,
    ) -> Result<(), Error> {
        let chunk = arch::level(0).span();

        let base = virt.align_down(chunk);
        if let Some(&existing) = dst_st.nodes.get(&(0, base))
            && let Backing::Borrowed { source, .. } = self.arena.get(existing).backing
        {
            let src_base = src_virt.align_down(chunk);
            if virt.offset_from_unsigned(base) == src_virt.offset_from_unsigned(src_base)
                && src_st.nodes.get(&(0, src_base)) == Some(&source)
            {
                log::trace!("{:?}: {virt} already shares {source:?}", dst.id());
                return Ok(());
            }
            return Err(Error::SharedTable { virt });
        }

        if len == chunk
            && virt.is_aligned_to(chunk)
            && src_virt.is_aligned_to(chunk)
            && let Some(&source) = src_st.nodes.get(&(0, src_virt))
            && !dst_st.nodes.contains_key(&(0, virt))
        {
            let node = self.arena.get(source);
            if matches!(node.backing, Backing::Owned(_))
                && !node.zombie
                && node.valid as usize == ENTRIES_PER_TABLE
            {
                let handle = self.create_node(dst, dst_st, virt, 0, Some(source), false, pending)?;
                let valid = self.arena.get(handle).valid;
                dst.add_mapped(0, valid as usize);
                dst.insert_flags(ContextFlags::SHARES_TABLES);
                src.insert_flags(ContextFlags::SHARES_TABLES);

                log::trace!(
                    "{:?}: sharing {source:?} of {:?} at {virt}",
                    dst.id(),
                    src.id()
                );
                return Ok(());
            }
        }

        // Copy whatever the source maps in this chunk.
        let src_range = src_virt..src_virt.saturating_add(len);
        let mut cursor = src_virt;
        while let Some(leaf) = self.next_leaf(src, src_st, cursor, src_range.end) {
            let clipped = leaf.range().intersect(src_range.clone());
            let phys = leaf
                .pte
                .address()
                .add(clipped.start.offset_from_unsigned(leaf.virt));
            let target = virt.add(clipped.start.offset_from_unsigned(src_virt));

            let mut flags = LoadFlags::empty();
            flags.set(LoadFlags::NO_REVERSE_MAP, leaf.pte.get(Pte::NO_REVERSE_MAP));
            flags.set(LoadFlags::NO_RESYNC, leaf.pte.get(Pte::NO_RESYNC));

            self.load_locked(
                dst,
                dst_st,
                target,
                phys,
                clipped.len(),
                leaf.pte.attributes(),
                flags,
                pending,
            )?;
            cursor = clipped.end;
        }

        Ok(())
    }

    /// Undoes [`Hat::attach`] for `[virt, virt + len)` of `dst`.
    ///
    /// Shared tables are dropped from `dst` without touching their entries; the table itself is
    /// released by whoever lets go of it last. Materialized translations are unloaded normally.
    ///
    /// # Panics
    ///
    /// Panics if the range covers only part of a shared table.
    pub fn detach(&self, dst: &Context, virt: VirtualAddress, len: usize) {
        let end = virt.checked_add(len).unwrap_or(VirtualAddress::MAX);
        let range = virt..end;
        let span = arch::level(0).span();

        let mut st = dst.lock();
        let mut pending = Pending::default();

        let shared: Vec<(VirtualAddress, NodeHandle)> = st
            .nodes
            .iter()
            .filter(|&(&(level, base), _)| {
                level == 0 && range.overlaps(&(base..base.saturating_add(span)))
            })
            .map(|(&(_, base), &handle)| (base, handle))
            .filter(|&(_, handle)| self.arena.get(handle).is_borrowed())
            .collect();

        for (base, handle) in shared {
            assert!(
                range.covers(&(base..base.saturating_add(span))),
                "{:?}: {range:?} detaches part of the shared table at {base}",
                dst.id()
            );
            self.unshare(dst, &mut st, handle, &mut pending);
        }

        let mut runs = Vec::new();
        self.unload_locked(dst, &mut st, virt, end, &mut pending, &mut runs);
        self.finish(dst, &mut st, &mut pending);

        log::debug!("{:?}: detached {len:#x} bytes at {virt}", dst.id());
    }

    /// Drops a borrowed table from `ctx`.
    pub(crate) fn unshare(
        &self,
        ctx: &Context,
        st: &mut ContextState,
        handle: NodeHandle,
        pending: &mut Pending,
    ) {
        let node = self.arena.get(handle);
        let Backing::Borrowed { source, .. } = node.backing else {
            unreachable!("{handle:?} is not borrowed");
        };
        let valid = self.arena.unlend(source, handle);
        ctx.sub_mapped(node.level, valid as usize);

        // Other contexts translate through the lender's table at addresses we don't know.
        pending.everywhere = true;
        self.maybe_reap(ctx, st, handle, pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Setup;
    use crate::{MIB, MemoryAttributes};

    const SRC: VirtualAddress = VirtualAddress::new(0x4000_0000);
    const DST: VirtualAddress = VirtualAddress::new(0x8000_0000);

    /// Fills the 2 MiB chunk at `SRC` with 4 KiB pages backed by frames `1..=512`.
    fn populate(setup: &Setup, src: &Context) {
        setup
            .hat()
            .load(
                src,
                SRC,
                setup.frame(1),
                2 * MIB,
                MemoryAttributes::user_data(),
                LoadFlags::SHARE_HINT,
            )
            .unwrap();
        assert_eq!(src.mapped_pages(0), 512);
    }

    #[test_log::test]
    fn attach_shares_full_table() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let src = hat.create_context(false);
        let dst = hat.create_context(false);
        populate(&setup, &src);

        // the intermediate tables of the destination exist already
        hat.load(
            &dst,
            DST.add(4 * MIB),
            setup.frame(600),
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::empty(),
        )
        .unwrap();
        let frames = hat.frames().allocated_frames();
        let mapped = dst.mapped_pages(0);

        hat.attach(&dst, DST, &src, SRC, 2 * MIB).unwrap();

        assert_eq!(hat.frames().allocated_frames(), frames);
        assert_eq!(dst.mapped_pages(0), mapped + 512);
        let info = hat.node_info(&dst, DST, 0).unwrap();
        assert!(info.shared);
        assert_eq!(info.valid, 512);
        assert_eq!(hat.node_info(&src, SRC, 0).unwrap().share_count, 1);
        assert!(src.shares_tables());
        assert!(dst.shares_tables());

        assert_eq!(
            hat.lookup(&dst, DST.add(5 * PAGE_SIZE)).map(|(phys, _, _)| phys),
            Some(setup.frame(6))
        );
        assert!(hat.walk(&dst, DST, 2 * MIB).all(|entry| entry.shared));
        assert_eq!(setup.page(6).mapping_count(), 1);

        // edits of the owner show through
        let read_only = MemoryAttributes::user_data().with(MemoryAttributes::WRITE, false);
        hat.protect(&src, SRC, PAGE_SIZE, read_only);
        let (_, attributes, _) = hat.lookup(&dst, DST).unwrap();
        assert_eq!(attributes, read_only);
    }

    #[test_log::test]
    fn detach_leaves_source_intact() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let src = hat.create_context(false);
        let dst = hat.create_context(false);
        populate(&setup, &src);
        let frames = hat.frames().allocated_frames();

        hat.attach(&dst, DST, &src, SRC, 2 * MIB).unwrap();
        hat.detach(&dst, DST, 2 * MIB);

        assert_eq!(dst.mapped_pages(0), 0);
        assert_eq!(dst.resident_nodes(), 0);
        assert!(hat.lookup(&dst, DST).is_none());
        assert_eq!(hat.node_info(&src, SRC, 0).unwrap().share_count, 0);
        assert_eq!(
            hat.lookup(&src, SRC).map(|(phys, _, _)| phys),
            Some(setup.frame(1))
        );
        assert_eq!(hat.frames().allocated_frames(), frames);
    }

    #[test_log::test]
    fn attach_again() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let src = hat.create_context(false);
        let dst = hat.create_context(false);
        populate(&setup, &src);

        hat.attach(&dst, DST, &src, SRC, 2 * MIB).unwrap();
        let frames = hat.frames().allocated_frames();

        hat.attach(&dst, DST, &src, SRC, 2 * MIB).unwrap();
        hat.attach(&dst, DST.add(PAGE_SIZE), &src, SRC.add(PAGE_SIZE), PAGE_SIZE)
            .unwrap();
        assert_eq!(hat.frames().allocated_frames(), frames);
        assert_eq!(dst.mapped_pages(0), 512);
        assert_eq!(hat.node_info(&src, SRC, 0).unwrap().share_count, 1);

        // a different source can't be written through the borrowed table
        let other = hat.create_context(false);
        hat.load(
            &other,
            SRC,
            setup.frame(600),
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::empty(),
        )
        .unwrap();
        assert_eq!(
            hat.attach(&dst, DST, &other, SRC, PAGE_SIZE),
            Err(Error::SharedTable { virt: DST })
        );
        assert_eq!(
            hat.lookup(&dst, DST).map(|(phys, _, _)| phys),
            Some(setup.frame(1))
        );
    }

    #[test_log::test]
    fn source_edits_reach_borrowers() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let src = hat.create_context(false);
        let dst = hat.create_context(false);
        populate(&setup, &src);
        hat.attach(&dst, DST, &src, SRC, 2 * MIB).unwrap();

        hat.unload(&src, SRC, PAGE_SIZE, None);
        assert_eq!(src.mapped_pages(0), 511);
        assert_eq!(dst.mapped_pages(0), 511);
        assert_eq!(hat.node_info(&dst, DST, 0).unwrap().valid, 511);
        assert_eq!(hat.walk(&dst, DST, 2 * MIB).count(), 511);
        assert!(hat.lookup(&dst, DST).is_none());

        hat.load(
            &src,
            SRC,
            setup.frame(1),
            PAGE_SIZE,
            MemoryAttributes::user_data(),
            LoadFlags::SHARE_HINT,
        )
        .unwrap();
        assert_eq!(dst.mapped_pages(0), 512);
        assert_eq!(hat.walk(&dst, DST, 2 * MIB).count(), 512);

        hat.detach(&dst, DST, 2 * MIB);
        assert_eq!(dst.mapped_pages(0), 0);
        assert_eq!(src.mapped_pages(0), 512);
    }

    #[test_log::test]
    fn owner_destroyed_while_shared() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let frames = hat.frames().allocated_frames();
        let src = hat.create_context(false);
        let dst = hat.create_context(false);
        populate(&setup, &src);
        hat.attach(&dst, DST, &src, SRC, 2 * MIB).unwrap();

        hat.destroy_context(src);
        assert_eq!(
            hat.lookup(&dst, DST).map(|(phys, _, _)| phys),
            Some(setup.frame(1))
        );
        assert_eq!(setup.page(1).mapping_count(), 1);

        hat.detach(&dst, DST, 2 * MIB);
        assert_eq!(setup.page(1).mapping_count(), 0);
        hat.destroy_context(dst);
        assert_eq!(hat.frames().allocated_frames(), frames);
    }

    #[test_log::test]
    fn partial_ranges_are_copied() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let src = hat.create_context(false);
        let dst = hat.create_context(false);
        hat.load(
            &src,
            SRC.add(PAGE_SIZE),
            setup.frame(1),
            4 * PAGE_SIZE,
            MemoryAttributes::user_text(),
            LoadFlags::empty(),
        )
        .unwrap();

        hat.attach(&dst, DST, &src, SRC, 8 * PAGE_SIZE).unwrap();

        assert!(hat.lookup(&dst, DST).is_none());
        for n in 1..5 {
            let (phys, attributes, level) = hat.lookup(&dst, DST.add(n * PAGE_SIZE)).unwrap();
            assert_eq!(phys, setup.frame(n));
            assert_eq!(attributes, MemoryAttributes::user_text());
            assert_eq!(level, 0);
        }
        assert!(!hat.node_info(&dst, DST, 0).unwrap().shared);
        assert!(!dst.shares_tables());
        assert_eq!(setup.page(1).mapping_count(), 2);

        hat.detach(&dst, DST, 8 * PAGE_SIZE);
        assert_eq!(setup.page(1).mapping_count(), 1);
        assert_eq!(dst.mapped_pages(0), 0);
    }

    #[test_log::test]
    fn large_source_pages_are_clipped() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let src = hat.create_context(false);
        let dst = hat.create_context(false);
        hat.load(
            &src,
            SRC,
            setup.frame(0),
            2 * MIB,
            MemoryAttributes::user_data(),
            LoadFlags::empty(),
        )
        .unwrap();
        assert_eq!(src.mapped_pages(1), 1);

        hat.attach(&dst, DST, &src, SRC.add(2 * PAGE_SIZE), 4 * PAGE_SIZE)
            .unwrap();

        assert_eq!(dst.mapped_pages(0), 4);
        assert_eq!(
            hat.lookup(&dst, DST).map(|(phys, _, _)| phys),
            Some(setup.frame(2))
        );
        assert_eq!(setup.page(2).mapping_count(), 1);
    }

    #[test_log::test]
    #[should_panic = "can not attach"]
    fn attach_to_itself() {
        let setup = Setup::new(1);
        let hat = setup.hat();
        let ctx = hat.create_context(false);

        let _ = hat.attach(&ctx, DST, &ctx, SRC, 2 * MIB);
    }
}
