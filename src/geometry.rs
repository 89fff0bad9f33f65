//! Store geometry and offset computation.
//!
//! A store is parameterized at construction by four integers: the block
//! size, the number of blocks per super-block, the number of super-blocks
//! and the number of descriptors. [`FsGeometry`] validates those parameters
//! once and derives everything the rest of the crate needs from them: region
//! strides, byte offsets, the pointer-block fan-out and the indirection-tree
//! capacity.
//!
//! The region layout is not a wire format; offsets are computed from the
//! validated parameters and are only meaningful for the store instance that
//! carries them.

use crate::err::{CanFail, FsError, FsResult};
use crate::layout::{BlockId, DESCRIPTOR_SIZE, HEADER_SIZE, PTR_WIDTH};

/// Validated construction parameters of a store, plus derived layout
/// constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsGeometry {
    block_size: u64,
    super_block_size: u64,
    super_block_count: u64,
    descriptor_count: u64,
}

impl FsGeometry {
    /// Builds a geometry with the default descriptor count
    /// `super_block_size * super_block_count / 4`.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::BadGeometry`] if the parameters violate the
    /// constraints listed on [`FsGeometry::with_descriptor_count`].
    pub fn new(
        block_size: u64,
        super_block_size: u64,
        super_block_count: u64,
    ) -> FsResult<Self> {
        let descriptor_count = super_block_size
            .checked_mul(super_block_count)
            .ok_or(FsError::BadGeometry)?
            / 4;

        Self::with_descriptor_count(
            block_size,
            super_block_size,
            super_block_count,
            descriptor_count,
        )
    }

    /// Builds a geometry with an explicit descriptor count.
    ///
    /// The parameters must satisfy:
    ///
    /// - `block_size` is a positive multiple of the pointer width (8);
    /// - `super_block_size` is a positive multiple of 8;
    /// - `super_block_count >= 1` and `descriptor_count >= 1`;
    /// - the total region size fits in `usize`.
    ///
    /// # Errors
    ///
    /// Fails with [`FsError::BadGeometry`] on any violation.
    pub fn with_descriptor_count(
        block_size: u64,
        super_block_size: u64,
        super_block_count: u64,
        descriptor_count: u64,
    ) -> FsResult<Self> {
        let geometry = Self {
            block_size,
            super_block_size,
            super_block_count,
            descriptor_count,
        };

        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> CanFail<FsError> {
        if self.block_size == 0 || self.block_size % PTR_WIDTH != 0 {
            return Err(FsError::BadGeometry);
        }

        if self.super_block_size == 0 || self.super_block_size % 8 != 0 {
            return Err(FsError::BadGeometry);
        }

        if self.super_block_count == 0 || self.descriptor_count == 0 {
            return Err(FsError::BadGeometry);
        }

        let total = self.checked_total_size().ok_or(FsError::BadGeometry)?;
        if usize::try_from(total).is_err() {
            return Err(FsError::BadGeometry);
        }

        Ok(())
    }

    fn checked_total_size(&self) -> Option<u64> {
        let descriptors = self.descriptor_count.checked_mul(DESCRIPTOR_SIZE)?;
        let super_blocks = self
            .super_block_count
            .checked_mul(self.checked_super_block_stride()?)?;

        HEADER_SIZE
            .checked_add(descriptors)?
            .checked_add(super_blocks)
    }

    fn checked_super_block_stride(&self) -> Option<u64> {
        let blocks = self.super_block_size.checked_mul(self.block_size)?;
        8u64.checked_add(self.bitmap_reserved())?.checked_add(blocks)
    }

    /// Bytes per block.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Blocks per super-block.
    pub fn super_block_size(&self) -> u64 {
        self.super_block_size
    }

    /// Number of super-blocks.
    pub fn super_block_count(&self) -> u64 {
        self.super_block_count
    }

    /// Number of descriptor-table entries.
    pub fn descriptor_count(&self) -> u64 {
        self.descriptor_count
    }

    /// Number of pointer slots per pointer block.
    pub fn fan_out(&self) -> u64 {
        self.block_size / PTR_WIDTH
    }

    /// Total number of blocks in the store, including the reserved block 0.
    pub fn block_capacity(&self) -> u64 {
        self.super_block_size * self.super_block_count
    }

    /// Maximum number of data blocks addressable through one descriptor's
    /// indirection trees: `1 + F + F^2 + F^3` with `F` the fan-out.
    pub fn max_file_blocks(&self) -> u64 {
        let f = self.fan_out();
        let squared = f.saturating_mul(f);
        let cubed = squared.saturating_mul(f);

        1u64.saturating_add(f)
            .saturating_add(squared)
            .saturating_add(cubed)
    }

    /// Maximum file size in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_blocks().saturating_mul(self.block_size)
    }

    /// Total size of the backing region in bytes.
    pub fn total_size(&self) -> u64 {
        // validate() proved this cannot overflow
        HEADER_SIZE
            + self.descriptor_count * DESCRIPTOR_SIZE
            + self.super_block_count * self.super_block_stride()
    }

    /// Bytes of allocation bitmap per super-block.
    pub(crate) fn bitmap_bytes(&self) -> u64 {
        self.super_block_size / 8
    }

    /// Bitmap bytes rounded up so the block area stays 8-byte aligned.
    fn bitmap_reserved(&self) -> u64 {
        self.bitmap_bytes().next_multiple_of(8)
    }

    /// Byte stride from one super-block to the next.
    pub(crate) fn super_block_stride(&self) -> u64 {
        8 + self.bitmap_reserved() + self.super_block_size * self.block_size
    }

    /// Byte offset of the descriptor table.
    pub(crate) fn descriptors_offset(&self) -> u64 {
        HEADER_SIZE
    }

    /// Byte offset of descriptor `i`. The index must be in range.
    pub(crate) fn descriptor_offset(&self, i: u64) -> u64 {
        self.descriptors_offset() + i * DESCRIPTOR_SIZE
    }

    /// Byte offset of the super-block array.
    pub(crate) fn super_blocks_offset(&self) -> u64 {
        self.descriptors_offset() + self.descriptor_count * DESCRIPTOR_SIZE
    }

    /// Byte offset of super-block `j`. The index must be in range.
    pub(crate) fn super_block_offset(&self, j: u64) -> u64 {
        self.super_blocks_offset() + j * self.super_block_stride()
    }

    /// Byte offset of the data area of super-block `j`.
    pub(crate) fn block_area_offset(&self, j: u64) -> u64 {
        self.super_block_offset(j) + 8 + self.bitmap_reserved()
    }

    /// Byte offset of a block. The identifier must be in range.
    pub(crate) fn block_offset(&self, block: BlockId) -> u64 {
        let j = block.index() / self.super_block_size;
        let i = block.index() % self.super_block_size;

        self.block_area_offset(j) + i * self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_descriptor_count() {
        let geometry = FsGeometry::new(4096, 4096, 256).unwrap();
        assert_eq!(geometry.descriptor_count(), 4096 * 256 / 4);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert_eq!(FsGeometry::new(0, 64, 1), Err(FsError::BadGeometry));
        assert_eq!(FsGeometry::new(12, 64, 1), Err(FsError::BadGeometry));
        assert_eq!(FsGeometry::new(64, 0, 1), Err(FsError::BadGeometry));
        assert_eq!(FsGeometry::new(64, 12, 1), Err(FsError::BadGeometry));
        assert_eq!(FsGeometry::new(64, 64, 0), Err(FsError::BadGeometry));
        assert_eq!(
            FsGeometry::with_descriptor_count(64, 64, 1, 0),
            Err(FsError::BadGeometry)
        );
        assert_eq!(
            FsGeometry::new(u64::MAX, 64, 2),
            Err(FsError::BadGeometry)
        );
    }

    #[test]
    fn test_region_arithmetic() {
        let geometry = FsGeometry::with_descriptor_count(64, 8, 2, 4).unwrap();

        // header 64, descriptors 4 * 64, then two super-blocks of
        // 8 (taken count) + 8 (one bitmap byte, padded) + 8 * 64 (blocks)
        assert_eq!(geometry.super_blocks_offset(), 64 + 4 * 64);
        assert_eq!(geometry.super_block_stride(), 8 + 8 + 8 * 64);
        assert_eq!(
            geometry.total_size(),
            64 + 4 * 64 + 2 * geometry.super_block_stride()
        );

        // every typed view offset is 8-byte aligned
        assert_eq!(geometry.descriptor_offset(3) % 8, 0);
        assert_eq!(geometry.super_block_offset(1) % 8, 0);
        assert_eq!(geometry.block_offset(BlockId::from(9)) % 8, 0);

        // block 9 lives in super-block 1, slot 1
        assert_eq!(
            geometry.block_offset(BlockId::from(9)),
            geometry.block_area_offset(1) + 64
        );
    }

    #[test]
    fn test_tree_capacity() {
        let geometry = FsGeometry::new(64, 8, 2).unwrap();
        assert_eq!(geometry.fan_out(), 8);
        assert_eq!(geometry.max_file_blocks(), 1 + 8 + 64 + 512);
        assert_eq!(geometry.max_file_size(), 585 * 64);
    }
}
