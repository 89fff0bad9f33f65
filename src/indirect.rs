//! Multi-level indirection trees.
//!
//! The blocks backing a file are addressed through four trees rooted in its
//! descriptor, each tree covering a contiguous range of logical block
//! indices. With `F` the pointer-block fan-out:
//!
//! - logical block 0 sits directly behind `ptrs[0]`;
//! - blocks `1 .. 1 + F` go through the singly-indirect tree at `ptrs[1]`;
//! - blocks `1 + F .. 1 + F + F^2` through the doubly-indirect tree;
//! - blocks up to `1 + F + F^2 + F^3` through the triply-indirect tree.
//!
//! A logical index is always addressed by the smallest-depth tree covering
//! it. Interior pointer blocks are allocated lazily on the way down when a
//! file grows, and freed eagerly on the way back up as soon as their last
//! slot is cleared, so an allocated interior block always carries at least
//! one live pointer.
//!
//! Files grow by appending at strictly increasing logical indices and shrink
//! from the top index downwards. Pointer blocks therefore fill left to right
//! and drain right to left, which makes the emptiness check on the unwind
//! path a constant-time test: an interior block becomes empty exactly when
//! slot 0 is the one being cleared.

use crate::err::{CanFail, FsError, FsResult};
use crate::geometry::FsGeometry;
use crate::layout::{BlockId, Descriptor, FileId};
use crate::store::MemFs;

/// Position of a logical block inside the indirection scheme: the tree depth
/// that covers it and the offset within that tree's range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TreePath {
    pub depth: usize,
    pub offset: u64,
}

/// Maps logical block index `k` to its tree.
///
/// # Errors
///
/// [`FsError::OutOfRange`] past the maximum addressable index
/// `1 + F + F^2 + F^3`.
pub(crate) fn classify(geometry: &FsGeometry, k: u64) -> FsResult<TreePath> {
    let f = geometry.fan_out();

    if k < 1 {
        return Ok(TreePath { depth: 0, offset: k });
    }

    let singly = 1u64.saturating_add(f);
    if k < singly {
        return Ok(TreePath {
            depth: 1,
            offset: k - 1,
        });
    }

    let f_squared = f.saturating_mul(f);
    let doubly = singly.saturating_add(f_squared);
    if k < doubly {
        return Ok(TreePath {
            depth: 2,
            offset: k - singly,
        });
    }

    let triply = doubly.saturating_add(f_squared.saturating_mul(f));
    if k < triply {
        return Ok(TreePath {
            depth: 3,
            offset: k - doubly,
        });
    }

    Err(FsError::OutOfRange)
}

/// Logical blocks covered by one slot `levels_below` levels above the data
/// blocks.
fn level_span(fan_out: u64, levels_below: u32) -> u64 {
    (0..levels_below).fold(1u64, |span, _| span.saturating_mul(fan_out))
}

/// Where a freshly allocated interior block was hooked in.
enum ParentSlot {
    /// Tree root `ptrs[d]` of the descriptor being grown.
    Root,
    /// Slot of another pointer block.
    Slot(BlockId, u64),
}

/// Interior pointer blocks created by one append, recorded so a failed
/// append can put the tree back exactly as it found it.
#[derive(Default)]
struct NewLinks {
    entries: [Option<(ParentSlot, BlockId)>; 3],
    len: usize,
}

impl NewLinks {
    fn push(&mut self, parent: ParentSlot, block: BlockId) {
        self.entries[self.len] = Some((parent, block));
        self.len += 1;
    }
}

impl MemFs {
    /// Resolves the `k`-th logical block of a descriptor without mutating
    /// anything.
    ///
    /// Returns [`BlockId::NULL`] if the walk crosses an unallocated slot;
    /// within `0 .. block_count` the resize engine keeps every path fully
    /// allocated, so a null result is only observable on indices past the
    /// file's frontier.
    pub(crate) fn locate_block(&self, desc: &Descriptor, k: u64) -> FsResult<BlockId> {
        let path = classify(self.geometry(), k)?;
        let fan_out = self.geometry().fan_out();

        let mut cur = desc.data.ptrs[path.depth];
        let mut offset = path.offset;
        let mut below = path.depth.saturating_sub(1) as u32;

        for _ in 0..path.depth {
            if cur.is_null() {
                return Ok(BlockId::NULL);
            }

            let span = level_span(fan_out, below);
            below = below.saturating_sub(1);

            cur = self.ptr_slot(cur, offset / span)?;
            offset %= span;
        }

        Ok(cur)
    }

    /// Appends one data block at the file's current frontier, allocating
    /// any missing interior pointer blocks along the path.
    ///
    /// On success the descriptor's size advances by one block. On failure
    /// the interior blocks created by this call are freed again and the
    /// descriptor is left untouched, so the no-empty-interior invariant
    /// holds either way.
    pub(crate) fn append_block(&mut self, id: FileId) -> CanFail<FsError> {
        let mut desc = *self.descriptor(id)?;
        let block_size = self.geometry().block_size();

        let k = desc.block_count(block_size);
        let path = classify(self.geometry(), k)?;

        let mut links = NewLinks::default();
        match self.grow_path(&mut desc, &path, &mut links) {
            Ok(()) => {
                desc.header.size = (k + 1) * block_size;
                *self.descriptor_mut(id)? = desc;
                Ok(())
            }
            Err(e) => {
                self.unwind_links(&links)?;
                Err(e)
            }
        }
    }

    fn grow_path(
        &mut self,
        desc: &mut Descriptor,
        path: &TreePath,
        links: &mut NewLinks,
    ) -> CanFail<FsError> {
        if path.depth == 0 {
            desc.data.ptrs[0] = self.allocate_block(0)?;
            return Ok(());
        }

        let block_size = self.geometry().block_size();
        let fan_out = self.geometry().fan_out();

        let mut cur = desc.data.ptrs[path.depth];
        if cur.is_null() {
            cur = self.allocate_block(block_size)?;
            links.push(ParentSlot::Root, cur);
            desc.data.ptrs[path.depth] = cur;
        }

        let mut offset = path.offset;
        let mut below = (path.depth - 1) as u32;

        for level in 0..path.depth {
            let span = level_span(fan_out, below);
            below = below.saturating_sub(1);

            let slot = offset / span;
            offset %= span;

            if level == path.depth - 1 {
                let data = self.allocate_block(0)?;
                self.set_ptr_slot(cur, slot, data)?;
            } else {
                let next = self.ptr_slot(cur, slot)?;
                if next.is_null() {
                    let fresh = self.allocate_block(block_size)?;
                    self.set_ptr_slot(cur, slot, fresh)?;
                    links.push(ParentSlot::Slot(cur, slot), fresh);
                    cur = fresh;
                } else {
                    cur = next;
                }
            }
        }

        Ok(())
    }

    /// Rolls back the interior blocks created by a failed append, deepest
    /// first. The descriptor copy was never written back, so root links die
    /// with it.
    fn unwind_links(&mut self, links: &NewLinks) -> CanFail<FsError> {
        for (parent, block) in links.entries[..links.len].iter().rev().flatten() {
            self.free_block(*block)?;
            if let ParentSlot::Slot(parent_block, slot) = parent {
                self.set_ptr_slot(*parent_block, *slot, BlockId::NULL)?;
            }
        }

        Ok(())
    }

    /// Frees the data block at the file's highest logical index, then frees
    /// every interior pointer block the removal emptied, up to and including
    /// the tree root.
    pub(crate) fn free_tail_block(&mut self, id: FileId) -> CanFail<FsError> {
        let mut desc = *self.descriptor(id)?;
        let block_size = self.geometry().block_size();

        let count = desc.block_count(block_size);
        if count == 0 {
            return Ok(());
        }

        let k = count - 1;
        let path = classify(self.geometry(), k)?;

        if path.depth == 0 {
            self.free_block(desc.data.ptrs[0])?;
            desc.data.ptrs[0] = BlockId::NULL;
        } else {
            let fan_out = self.geometry().fan_out();

            // walk down, recording the pointer block and slot used at each
            // level
            let mut chain = [(BlockId::NULL, 0u64); 3];
            let mut cur = desc.data.ptrs[path.depth];
            let mut offset = path.offset;
            let mut below = (path.depth - 1) as u32;

            for link in chain.iter_mut().take(path.depth) {
                let span = level_span(fan_out, below);
                below = below.saturating_sub(1);

                let slot = offset / span;
                offset %= span;

                *link = (cur, slot);
                cur = self.ptr_slot(cur, slot)?;
            }

            self.free_block(cur)?;
            let (leaf_parent, leaf_slot) = chain[path.depth - 1];
            self.set_ptr_slot(leaf_parent, leaf_slot, BlockId::NULL)?;

            // frees fill right-to-left, so a pointer block is empty exactly
            // when its slot 0 was just cleared
            for level in (0..path.depth).rev() {
                let (block, slot) = chain[level];
                if slot != 0 {
                    break;
                }

                self.free_block(block)?;
                if level == 0 {
                    desc.data.ptrs[path.depth] = BlockId::NULL;
                } else {
                    let (parent, parent_slot) = chain[level - 1];
                    self.set_ptr_slot(parent, parent_slot, BlockId::NULL)?;
                }
            }
        }

        desc.header.size = k * block_size;
        *self.descriptor_mut(id)? = desc;
        Ok(())
    }

    /// Grows or shrinks a file's block set to match `target` bytes.
    ///
    /// Growth appends `⌈target / block_size⌉ − current` blocks in order;
    /// shrinking frees from the top index down. The exact byte size is
    /// committed once the block set matches, making the operation idempotent
    /// with respect to the final size.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] on a descriptor that is not live;
    /// [`FsError::OutOfRange`] when `target` exceeds the addressable
    /// capacity of the indirection trees; [`FsError::OutOfSpace`] when the
    /// allocator runs dry mid-growth. Either way the blocks appended before
    /// the failure stay committed and the size reflects them: a target past
    /// the tree capacity still grows the file up to that capacity before
    /// the error surfaces.
    pub(crate) fn resize_file(&mut self, id: FileId, target: u64) -> CanFail<FsError> {
        let desc = self.descriptor(id)?;
        if !desc.exists() {
            return Err(FsError::NotFound);
        }

        let block_size = self.geometry().block_size();
        let cur_blocks = desc.block_count(block_size);
        let new_blocks = target.div_ceil(block_size);
        let max_blocks = self.geometry().max_file_blocks();

        if new_blocks > cur_blocks {
            for appended in cur_blocks..new_blocks.min(max_blocks) {
                if let Err(e) = self.append_block(id) {
                    if e == FsError::OutOfSpace {
                        log::warn!(
                            "memfs: resize of file {id} stopped at {appended}/{new_blocks} blocks: out of space",
                        );
                    }
                    return Err(e);
                }
            }

            // the in-range growth above is committed either way
            if new_blocks > max_blocks {
                return Err(FsError::OutOfRange);
            }
        } else {
            for _ in new_blocks..cur_blocks {
                self.free_tail_block(id)?;
            }
        }

        self.descriptor_mut(id)?.header.size = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FileFlags;

    // fan-out 8: brackets are [0], [1, 9), [9, 73), [73, 585)
    fn fs() -> MemFs {
        let geometry = FsGeometry::with_descriptor_count(64, 64, 16, 4).unwrap();
        let mut fs = MemFs::new(geometry);
        fs.descriptor_mut(FileId::from(0)).unwrap().attributes.flags = FileFlags::EX;
        fs
    }

    fn path(depth: usize, offset: u64) -> TreePath {
        TreePath { depth, offset }
    }

    #[test]
    fn test_classify_brackets() {
        let geometry = FsGeometry::with_descriptor_count(64, 8, 2, 4).unwrap();

        assert_eq!(classify(&geometry, 0).unwrap(), path(0, 0));
        assert_eq!(classify(&geometry, 1).unwrap(), path(1, 0));
        assert_eq!(classify(&geometry, 8).unwrap(), path(1, 7));
        assert_eq!(classify(&geometry, 9).unwrap(), path(2, 0));
        assert_eq!(classify(&geometry, 72).unwrap(), path(2, 63));
        assert_eq!(classify(&geometry, 73).unwrap(), path(3, 0));
        assert_eq!(classify(&geometry, 584).unwrap(), path(3, 511));
        assert_eq!(classify(&geometry, 585), Err(FsError::OutOfRange));
    }

    #[test]
    fn test_direct_append_and_free() {
        let mut fs = fs();
        let id = FileId::from(0);

        fs.append_block(id).unwrap();
        let desc = *fs.descriptor(id).unwrap();
        assert_eq!(desc.header.size, 64);
        assert!(!desc.data.ptrs[0].is_null());
        assert_eq!(fs.payload(), 2);

        let located = fs.locate_block(&desc, 0).unwrap();
        assert_eq!(located, desc.data.ptrs[0]);

        fs.free_tail_block(id).unwrap();
        let desc = *fs.descriptor(id).unwrap();
        assert_eq!(desc.header.size, 0);
        assert!(desc.data.ptrs[0].is_null());
        assert_eq!(fs.payload(), 1);
    }

    #[test]
    fn test_singly_indirect_transition() {
        let mut fs = fs();
        let id = FileId::from(0);

        // block 0 direct, block 1 allocates the singly-indirect root too
        fs.append_block(id).unwrap();
        fs.append_block(id).unwrap();

        let desc = *fs.descriptor(id).unwrap();
        assert!(!desc.data.ptrs[1].is_null());
        // reserved + direct data + interior root + one indirect data block
        assert_eq!(fs.payload(), 4);

        let data = fs.locate_block(&desc, 1).unwrap();
        assert_eq!(fs.ptr_slot(desc.data.ptrs[1], 0).unwrap(), data);

        // freeing block 1 must also free the now-empty interior root
        fs.free_tail_block(id).unwrap();
        let desc = *fs.descriptor(id).unwrap();
        assert!(desc.data.ptrs[1].is_null());
        assert_eq!(fs.payload(), 2);
    }

    #[test]
    fn test_deep_grow_and_shrink_roundtrip() {
        let mut fs = fs();
        let id = FileId::from(0);

        // 80 blocks: direct + full singly (8) + deep into doubly territory
        for _ in 0..80 {
            fs.append_block(id).unwrap();
        }

        let desc = *fs.descriptor(id).unwrap();
        assert!(!desc.data.ptrs[0].is_null());
        assert!(!desc.data.ptrs[1].is_null());
        assert!(!desc.data.ptrs[2].is_null());
        assert!(desc.data.ptrs[3].is_null());

        // doubly tree holds blocks 9..80: 71 data blocks behind a root and
        // ceil(71 / 8) = 9 level-1 pointer blocks
        assert_eq!(fs.payload(), 1 + 80 + 1 + 1 + 9);

        // every logical block resolves to a distinct allocated block
        let mut seen = alloc::vec::Vec::new();
        for k in 0..80 {
            let block = fs.locate_block(&desc, k).unwrap();
            assert!(!block.is_null());
            assert!(!seen.contains(&block));
            seen.push(block);
        }

        for _ in 0..80 {
            fs.free_tail_block(id).unwrap();
        }

        let desc = *fs.descriptor(id).unwrap();
        assert_eq!(fs.payload(), 1);
        assert!(desc.data.ptrs.iter().all(|p| p.is_null()));
    }

    #[test]
    fn test_triply_indirect_paths() {
        let mut fs = fs();
        let id = FileId::from(0);

        // 74 blocks crosses into the triply-indirect bracket (k = 73)
        for _ in 0..74 {
            fs.append_block(id).unwrap();
        }

        let desc = *fs.descriptor(id).unwrap();
        assert!(!desc.data.ptrs[3].is_null());

        let data = fs.locate_block(&desc, 73).unwrap();
        let level1 = fs.ptr_slot(desc.data.ptrs[3], 0).unwrap();
        let level2 = fs.ptr_slot(level1, 0).unwrap();
        assert_eq!(fs.ptr_slot(level2, 0).unwrap(), data);

        // dropping back to 73 blocks removes the whole triply chain
        fs.free_tail_block(id).unwrap();
        let desc = *fs.descriptor(id).unwrap();
        assert!(desc.data.ptrs[3].is_null());
    }

    #[test]
    fn test_locate_past_frontier_is_null() {
        let mut fs = fs();
        let id = FileId::from(0);

        fs.append_block(id).unwrap();
        let desc = *fs.descriptor(id).unwrap();

        assert_eq!(fs.locate_block(&desc, 1).unwrap(), BlockId::NULL);
        assert_eq!(fs.locate_block(&desc, 30).unwrap(), BlockId::NULL);
        assert_eq!(fs.locate_block(&desc, 600), Err(FsError::OutOfRange));
    }

    #[test]
    fn test_failed_append_leaves_no_empty_interior() {
        // 16 usable blocks total; fill almost everything with one file,
        // then force an append that can allocate the interior root but not
        // the data block
        let geometry = FsGeometry::with_descriptor_count(64, 8, 2, 4).unwrap();
        let mut fs = MemFs::new(geometry);
        fs.descriptor_mut(FileId::from(0)).unwrap().attributes.flags = FileFlags::EX;
        let id = FileId::from(0);

        // 1 reserved + 1 direct data + 13 filler = 15 taken, one block left
        fs.append_block(id).unwrap();
        for _ in 0..13 {
            fs.allocate_block(0).unwrap();
        }

        // appending block 1 needs the singly-indirect root plus a data
        // block; only one is available
        assert_eq!(fs.append_block(id), Err(FsError::OutOfSpace));

        let desc = *fs.descriptor(id).unwrap();
        assert_eq!(desc.header.size, 64);
        assert!(desc.data.ptrs[1].is_null());
        assert_eq!(fs.payload(), 15);
    }

    #[test]
    fn test_resize_file_paths() {
        let mut fs = fs();
        let id = FileId::from(0);

        fs.resize_file(id, 100).unwrap();
        let desc = *fs.descriptor(id).unwrap();
        assert_eq!(desc.header.size, 100);
        assert_eq!(desc.block_count(64), 2);

        // same block count, size updated exactly
        fs.resize_file(id, 90).unwrap();
        assert_eq!(fs.descriptor(id).unwrap().header.size, 90);

        fs.resize_file(id, 0).unwrap();
        let desc = *fs.descriptor(id).unwrap();
        assert_eq!(desc.header.size, 0);
        assert_eq!(fs.payload(), 1);

        assert_eq!(fs.resize_file(FileId::from(1), 10), Err(FsError::NotFound));
    }

    #[test]
    fn test_resize_past_capacity_commits_reachable_growth() {
        let mut fs = fs();
        let id = FileId::from(0);

        // the in-range part of an oversized grow is kept, like a grow cut
        // short by exhaustion
        assert_eq!(fs.resize_file(id, u64::MAX), Err(FsError::OutOfRange));

        let max_blocks = fs.geometry().max_file_blocks();
        let desc = *fs.descriptor(id).unwrap();
        assert_eq!(desc.block_count(64), max_blocks);
        assert_eq!(desc.header.size, max_blocks * 64);

        // growing again past capacity from the brim appends nothing
        assert_eq!(fs.resize_file(id, u64::MAX), Err(FsError::OutOfRange));
        assert_eq!(fs.descriptor(id).unwrap().block_count(64), max_blocks);

        fs.resize_file(id, 0).unwrap();
        assert_eq!(fs.payload(), 1);
    }
}
