//! On-region data structures.
//!
//! The backing region of a store is partitioned into a [`Header`], a fixed
//! array of [`Descriptor`] entries and a fixed array of super-blocks. The
//! types in this module are the in-place views over those byte ranges: all of
//! them are plain-old-data (`bytemuck::Pod`) and are reinterpreted directly
//! inside the region, never copied through an intermediate serialization
//! step.
//!
//! Super-blocks have no fixed-size Rust representation because their extent
//! depends on the store geometry; they are handled through
//! [`crate::superblock`] views instead.

use core::fmt::{Display, Formatter};
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

/// Width in bytes of a block pointer stored inside a pointer block.
pub const PTR_WIDTH: u64 = size_of::<BlockId>() as u64;

/// Size in bytes of the store [`Header`].
pub const HEADER_SIZE: u64 = size_of::<Header>() as u64;

/// Size in bytes of one [`Descriptor`] entry.
pub const DESCRIPTOR_SIZE: u64 = size_of::<Descriptor>() as u64;

/// A store-wide block identifier.
///
/// Block `i` of super-block `j` has the global identifier
/// `j * super_block_size + i`. The identifier 0 doubles as the null sentinel
/// inside pointer blocks: the block at global index 0 is permanently
/// allocated at store construction and never referenced from any pointer
/// slot, so a zero slot always means "unallocated".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockId(u64);

impl BlockId {
    /// The null pointer-slot sentinel.
    pub const NULL: Self = Self(0);

    /// Returns the raw global block index.
    pub fn index(self) -> u64 {
        self.0
    }

    /// Returns `true` for the null sentinel.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for BlockId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<BlockId> for u64 {
    fn from(value: BlockId) -> Self {
        value.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Index of a descriptor inside the store's descriptor table.
///
/// A `FileId` together with a store reference forms a file handle; see
/// [`crate::MemFs::file_at`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileId(u64);

impl FileId {
    /// Returns the raw descriptor index.
    pub fn index(self) -> u64 {
        self.0
    }
}

impl From<u64> for FileId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<FileId> for u64 {
    fn from(value: FileId) -> Self {
        value.0
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The flag byte of a descriptor's security attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileFlags(u8);

impl FileFlags {
    /// No flag set.
    pub const EMPTY: Self = Self(0);

    /// Group read.
    pub const RG: Self = Self(0x01);

    /// Group write.
    pub const WG: Self = Self(0x02);

    /// Group visible.
    pub const VG: Self = Self(0x04);

    /// Everyone read.
    pub const RE: Self = Self(0x08);

    /// Everyone write.
    pub const WE: Self = Self(0x10);

    /// Everyone visible.
    pub const VE: Self = Self(0x20);

    /// The file is a directory.
    pub const DR: Self = Self(0x40);

    /// The descriptor is live. This is the only bit the core consults; the
    /// others are stored opaquely.
    pub const EX: Self = Self(0x80);

    /// Returns `true` if every bit of `other` is set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for FileFlags {
    type Output = FileFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FileFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for FileFlags {
    type Output = FileFlags;

    fn bitand(self, rhs: Self) -> Self::Output {
        FileFlags(self.0 & rhs.0)
    }
}

impl core::ops::Not for FileFlags {
    type Output = FileFlags;

    fn not(self) -> Self::Output {
        FileFlags(!self.0)
    }
}

/// Ownership and permission record of a descriptor.
///
/// Only the [`FileFlags::EX`] bit of `flags` has meaning to the core; the
/// permission bits, the group id and the user id are carried opaquely for
/// outer layers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SecurityAttributes {
    pub flags: FileFlags,
    pub group_id: [u8; 3],
    pub user_id: u32,
}

/// Size and naming record of a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FileHeader {
    /// File size in bytes.
    pub size: u64,

    /// Opaque creation timestamp; the core never interprets it.
    pub creation_time: u64,

    /// First block of the file's name chain, or null for an unnamed file.
    pub name_ptr: BlockId,
}

/// The four indirection-tree roots of a descriptor.
///
/// `ptrs[d]` roots a pointer-block tree of depth `d`: `ptrs[0]` points
/// directly at a data block, `ptrs[1]` at a pointer block of data blocks,
/// and so on up to the triply-indirect tree under `ptrs[3]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FileData {
    pub ptrs: [BlockId; 4],
}

/// One entry of the descriptor table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Descriptor {
    pub attributes: SecurityAttributes,
    pub header: FileHeader,
    pub data: FileData,
}

impl Descriptor {
    /// Returns `true` if the descriptor is live (its EX bit is set).
    pub fn exists(&self) -> bool {
        self.attributes.flags.contains(FileFlags::EX)
    }

    /// Number of data blocks backing the descriptor's current size.
    pub fn block_count(&self, block_size: u64) -> u64 {
        self.header.size.div_ceil(block_size)
    }
}

/// The store header, written once at construction.
///
/// The geometry fields are immutable afterwards; the four user words are
/// free for outer layers (see [`crate::MemFs::set_user_word`]).
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Header {
    pub block_size: u64,
    pub super_block_size: u64,
    pub descriptor_count: u64,
    pub super_block_count: u64,
    pub user_data: [u64; 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(size_of::<SecurityAttributes>(), 8);
        assert_eq!(size_of::<FileHeader>(), 24);
        assert_eq!(size_of::<FileData>(), 32);
        assert_eq!(size_of::<Descriptor>(), 64);
        assert_eq!(size_of::<Header>(), 64);
    }

    #[test]
    fn test_flag_ops() {
        let flags = FileFlags::EX | FileFlags::DR;
        assert!(flags.contains(FileFlags::EX));
        assert!(flags.contains(FileFlags::DR));
        assert!(!flags.contains(FileFlags::RG));

        let cleared = flags & !FileFlags::EX;
        assert!(!cleared.contains(FileFlags::EX));
        assert!(cleared.contains(FileFlags::DR));
    }

    #[test]
    fn test_descriptor_block_count() {
        let mut desc = Descriptor::default();
        assert_eq!(desc.block_count(4096), 0);

        desc.header.size = 1;
        assert_eq!(desc.block_count(4096), 1);

        desc.header.size = 4096;
        assert_eq!(desc.block_count(4096), 1);

        desc.header.size = 4097;
        assert_eq!(desc.block_count(4096), 2);
    }
}
