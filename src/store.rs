//! The in-memory store and its block allocator.
//!
//! [`MemFs`] owns a single contiguous byte region laid out as header,
//! descriptor table and super-block array. Every structure of the filesystem
//! lives inside that region; the store performs no heap allocation after
//! construction. Typed access goes through [`bytemuck`] views computed from
//! the validated [`FsGeometry`].
//!
//! The global allocator hands out one block at a time, first-fit and
//! low-address-first: super-blocks are scanned in index order for spare
//! capacity, then the lowest free bit inside the first non-saturated
//! super-block wins. The ordering is deterministic and observable, and the
//! test suite relies on it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use bytemuck::{cast_slice, cast_slice_mut, from_bytes, from_bytes_mut};

use crate::err::{CanFail, FsError, FsResult};
use crate::file::FileRef;
use crate::geometry::FsGeometry;
use crate::layout::{BlockId, Descriptor, FileId, Header, DESCRIPTOR_SIZE, HEADER_SIZE};
use crate::superblock::{SuperBlockMut, SuperBlockRef};

/// A store shared behind a reader/writer lock, for callers that need to hand
/// the filesystem around. The core itself takes no locks.
pub type SharedFs = Arc<spin::RwLock<MemFs>>;

/// An in-memory block-structured filesystem.
pub struct MemFs {
    geometry: FsGeometry,
    region: Box<[u64]>,
}

impl MemFs {
    /// Creates an empty store for the given geometry.
    ///
    /// The region is zeroed, the header is populated and block 0 is marked
    /// permanently allocated so that the identifier 0 can serve as the null
    /// pointer-slot sentinel.
    pub fn new(geometry: FsGeometry) -> Self {
        // the backing region is allocated as u64 words so that every 8-byte
        // aligned view into it is valid
        let words = geometry.total_size().div_ceil(8) as usize;
        let region = vec![0u64; words].into_boxed_slice();

        let mut fs = Self { geometry, region };

        *fs.header_mut() = Header {
            block_size: geometry.block_size(),
            super_block_size: geometry.super_block_size(),
            descriptor_count: geometry.descriptor_count(),
            super_block_count: geometry.super_block_count(),
            user_data: [0; 4],
        };

        fs.super_block_mut(0)
            .alloc(0)
            .expect("reserving block 0 in a fresh store cannot fail");

        log::debug!(
            "memfs: created store with {} blocks of {} bytes, {} descriptors",
            geometry.block_capacity(),
            geometry.block_size(),
            geometry.descriptor_count(),
        );

        fs
    }

    /// Wraps the store behind a reader/writer lock.
    pub fn into_shared(self) -> SharedFs {
        Arc::new(spin::RwLock::new(self))
    }

    /// The store's validated geometry.
    pub fn geometry(&self) -> &FsGeometry {
        &self.geometry
    }

    /// Total size of the backing region in bytes.
    pub fn total_size(&self) -> u64 {
        self.geometry.total_size()
    }

    fn bytes(&self) -> &[u8] {
        cast_slice(&self.region)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        cast_slice_mut(&mut self.region)
    }

    fn range(&self, offset: u64, len: u64) -> &[u8] {
        &self.bytes()[offset as usize..(offset + len) as usize]
    }

    fn range_mut(&mut self, offset: u64, len: u64) -> &mut [u8] {
        &mut self.bytes_mut()[offset as usize..(offset + len) as usize]
    }

    /// The store header.
    pub fn header(&self) -> &Header {
        from_bytes(self.range(0, HEADER_SIZE))
    }

    fn header_mut(&mut self) -> &mut Header {
        from_bytes_mut(self.range_mut(0, HEADER_SIZE))
    }

    /// Reads one of the four opaque user words of the header.
    pub fn user_word(&self, index: usize) -> FsResult<u64> {
        self.header()
            .user_data
            .get(index)
            .copied()
            .ok_or(FsError::OutOfRange)
    }

    /// Writes one of the four opaque user words of the header.
    pub fn set_user_word(&mut self, index: usize, value: u64) -> CanFail<FsError> {
        *self
            .header_mut()
            .user_data
            .get_mut(index)
            .ok_or(FsError::OutOfRange)? = value;

        Ok(())
    }

    /// Borrows descriptor `id`.
    pub(crate) fn descriptor(&self, id: FileId) -> FsResult<&Descriptor> {
        if id.index() >= self.geometry.descriptor_count() {
            return Err(FsError::OutOfRange);
        }

        let offset = self.geometry.descriptor_offset(id.index());
        Ok(from_bytes(self.range(offset, DESCRIPTOR_SIZE)))
    }

    /// Mutably borrows descriptor `id`.
    pub(crate) fn descriptor_mut(&mut self, id: FileId) -> FsResult<&mut Descriptor> {
        if id.index() >= self.geometry.descriptor_count() {
            return Err(FsError::OutOfRange);
        }

        let offset = self.geometry.descriptor_offset(id.index());
        Ok(from_bytes_mut(self.range_mut(offset, DESCRIPTOR_SIZE)))
    }

    /// Read view over super-block `j`. The index must be in range.
    pub(crate) fn super_block(&self, j: u64) -> SuperBlockRef<'_> {
        let offset = self.geometry.super_block_offset(j) as usize;
        let bitmap = self.geometry.bitmap_bytes() as usize;
        let bytes = &self.bytes()[offset..offset + 8 + bitmap];
        let (amount, flags) = bytes.split_at(8);

        SuperBlockRef::new(*from_bytes(amount), flags)
    }

    /// Write view over super-block `j`. The index must be in range.
    pub(crate) fn super_block_mut(&mut self, j: u64) -> SuperBlockMut<'_> {
        let offset = self.geometry.super_block_offset(j) as usize;
        let bitmap = self.geometry.bitmap_bytes() as usize;
        let bytes = &mut self.bytes_mut()[offset..offset + 8 + bitmap];
        let (amount, flags) = bytes.split_at_mut(8);

        SuperBlockMut::new(from_bytes_mut(amount), flags)
    }

    fn check_block(&self, block: BlockId) -> CanFail<FsError> {
        if block.index() >= self.geometry.block_capacity() {
            return Err(FsError::OutOfRange);
        }

        Ok(())
    }

    /// Borrows the raw bytes of a block.
    pub fn block(&self, block: BlockId) -> FsResult<&[u8]> {
        self.check_block(block)?;

        let offset = self.geometry.block_offset(block);
        Ok(self.range(offset, self.geometry.block_size()))
    }

    /// Mutably borrows the raw bytes of a block.
    pub fn block_mut(&mut self, block: BlockId) -> FsResult<&mut [u8]> {
        self.check_block(block)?;

        let offset = self.geometry.block_offset(block);
        Ok(self.range_mut(offset, self.geometry.block_size()))
    }

    /// Borrows a block reinterpreted as an array of pointer slots.
    pub fn pointer_block(&self, block: BlockId) -> FsResult<&[BlockId]> {
        Ok(cast_slice(self.block(block)?))
    }

    /// Mutably borrows a block reinterpreted as an array of pointer slots.
    pub(crate) fn pointer_block_mut(&mut self, block: BlockId) -> FsResult<&mut [BlockId]> {
        Ok(cast_slice_mut(self.block_mut(block)?))
    }

    /// Reads pointer slot `slot` of block `block`.
    pub(crate) fn ptr_slot(&self, block: BlockId, slot: u64) -> FsResult<BlockId> {
        self.pointer_block(block)?
            .get(slot as usize)
            .copied()
            .ok_or(FsError::OutOfRange)
    }

    /// Writes pointer slot `slot` of block `block`.
    pub(crate) fn set_ptr_slot(
        &mut self,
        block: BlockId,
        slot: u64,
        value: BlockId,
    ) -> CanFail<FsError> {
        *self
            .pointer_block_mut(block)?
            .get_mut(slot as usize)
            .ok_or(FsError::OutOfRange)? = value;

        Ok(())
    }

    /// Smallest free global block index.
    ///
    /// Super-blocks are scanned in index order; the first one with spare
    /// capacity provides its lowest free bit.
    ///
    /// # Errors
    ///
    /// [`FsError::OutOfSpace`] when every super-block is saturated.
    pub fn find_free_block(&self) -> FsResult<BlockId> {
        for j in 0..self.geometry.super_block_count() {
            let sb = self.super_block(j);
            if sb.is_saturated() {
                continue;
            }

            let i = sb
                .first_free()
                .expect("non-saturated super-block has a free bit");
            return Ok(BlockId::from(j * self.geometry.super_block_size() + i));
        }

        Err(FsError::OutOfSpace)
    }

    /// Allocates the lowest free block and zeroes its first `zero_prefix`
    /// bytes.
    ///
    /// Callers allocating interior pointer blocks pass the block size so
    /// every slot reads as null; data blocks are handed out raw.
    pub(crate) fn allocate_block(&mut self, zero_prefix: u64) -> FsResult<BlockId> {
        let block = self.find_free_block()?;
        let j = block.index() / self.geometry.super_block_size();
        let i = block.index() % self.geometry.super_block_size();

        self.super_block_mut(j).alloc(i)?;

        if zero_prefix > 0 {
            let len = zero_prefix.min(self.geometry.block_size());
            let offset = self.geometry.block_offset(block);
            self.range_mut(offset, len).fill(0);
        }

        Ok(block)
    }

    /// Returns a block to its super-block's free pool.
    ///
    /// # Errors
    ///
    /// [`FsError::OutOfRange`] for an invalid identifier;
    /// [`FsError::DoubleFree`] if the block is not allocated.
    pub(crate) fn free_block(&mut self, block: BlockId) -> CanFail<FsError> {
        self.check_block(block)?;

        let j = block.index() / self.geometry.super_block_size();
        let i = block.index() % self.geometry.super_block_size();
        self.super_block_mut(j).free(i)
    }

    /// Total number of allocated blocks across all super-blocks, pointer
    /// blocks and the reserved block 0 included.
    pub fn payload(&self) -> u64 {
        (0..self.geometry.super_block_count())
            .map(|j| self.super_block(j).taken_amount())
            .sum()
    }

    /// Returns the handle for descriptor `id`.
    ///
    /// # Errors
    ///
    /// [`FsError::OutOfRange`] past the descriptor table.
    pub fn file_at(&mut self, id: FileId) -> FsResult<FileRef<'_>> {
        if id.index() >= self.geometry.descriptor_count() {
            return Err(FsError::OutOfRange);
        }

        Ok(FileRef::new(self, id))
    }

    /// Whether descriptor `id` is live.
    pub fn exists(&self, id: FileId) -> FsResult<bool> {
        Ok(self.descriptor(id)?.exists())
    }

    /// Iterator over the identifiers of all live descriptors.
    pub fn live_files(&self) -> impl Iterator<Item = FileId> + '_ {
        (0..self.geometry.descriptor_count())
            .map(FileId::from)
            .filter(|id| self.descriptor(*id).map(Descriptor::exists).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_fs() -> MemFs {
        // 2 super-blocks of 8 blocks, 64-byte blocks, 4 descriptors
        MemFs::new(FsGeometry::with_descriptor_count(64, 8, 2, 4).unwrap())
    }

    #[test]
    fn test_fresh_store_state() {
        let fs = small_fs();

        assert_eq!(fs.payload(), 1);
        assert!(fs.super_block(0).is_taken(0).unwrap());
        assert_eq!(fs.header().block_size, 64);
        assert_eq!(fs.header().super_block_size, 8);
        assert_eq!(fs.header().super_block_count, 2);
        assert_eq!(fs.header().descriptor_count, 4);
        assert_eq!(fs.live_files().count(), 0);
    }

    #[test]
    fn test_first_fit_is_deterministic() {
        let mut fs = small_fs();

        let a = fs.allocate_block(0).unwrap();
        let b = fs.allocate_block(0).unwrap();
        assert_eq!(a.index(), 1);
        assert_eq!(b.index(), 2);

        // freeing the lower block makes it the next candidate again
        fs.free_block(a).unwrap();
        assert_eq!(fs.find_free_block().unwrap(), a);
        assert_eq!(fs.allocate_block(0).unwrap(), a);
    }

    #[test]
    fn test_allocation_spills_into_next_super_block() {
        let mut fs = small_fs();

        // block 0 is reserved; take the remaining 7 of super-block 0
        for _ in 0..7 {
            fs.allocate_block(0).unwrap();
        }
        assert!(fs.super_block(0).is_saturated());

        let spilled = fs.allocate_block(0).unwrap();
        assert_eq!(spilled.index(), 8);
    }

    #[test]
    fn test_out_of_space() {
        let mut fs = small_fs();

        for _ in 0..15 {
            fs.allocate_block(0).unwrap();
        }

        assert_eq!(fs.find_free_block(), Err(FsError::OutOfSpace));
        assert_eq!(fs.allocate_block(0), Err(FsError::OutOfSpace));
        assert_eq!(fs.payload(), 16);
    }

    #[test]
    fn test_free_rejects_free_block() {
        let mut fs = small_fs();

        let a = fs.allocate_block(0).unwrap();
        fs.free_block(a).unwrap();
        assert_eq!(fs.free_block(a), Err(FsError::DoubleFree));
        assert_eq!(
            fs.free_block(BlockId::from(1000)),
            Err(FsError::OutOfRange)
        );
    }

    #[test]
    fn test_zero_prefix_clears_recycled_block() {
        let mut fs = small_fs();

        let a = fs.allocate_block(0).unwrap();
        fs.block_mut(a).unwrap().fill(0xAB);
        fs.free_block(a).unwrap();

        let b = fs.allocate_block(64).unwrap();
        assert_eq!(a, b);
        assert!(fs.block(b).unwrap().iter().all(|byte| *byte == 0));

        fs.free_block(b).unwrap();
        let c = fs.allocate_block(0).unwrap();
        assert_eq!(
            fs.pointer_block(c).unwrap().len() as u64,
            fs.geometry().fan_out()
        );
    }

    #[test]
    fn test_user_words() {
        let mut fs = small_fs();

        fs.set_user_word(2, 0xDEAD).unwrap();
        assert_eq!(fs.user_word(2).unwrap(), 0xDEAD);
        assert_eq!(fs.user_word(0).unwrap(), 0);
        assert_eq!(fs.user_word(4), Err(FsError::OutOfRange));
        assert_eq!(fs.set_user_word(4, 1), Err(FsError::OutOfRange));
    }

    #[test]
    fn test_shared_wrapper() {
        let fs = small_fs().into_shared();

        let payload = fs.read().payload();
        assert_eq!(payload, 1);

        fs.write().allocate_block(0).unwrap();
        assert_eq!(fs.read().payload(), 2);
    }
}
