//! An in-memory block-structured filesystem core.
//!
//! The store is a single contiguous byte region divided into three
//! substructures:
//!
//! - a header recording the construction parameters;
//! - a fixed table of file descriptors;
//! - a fixed array of super-blocks, each pairing an allocation bit-vector
//!   with a run of equal-sized data blocks.
//!
//! File content is addressed the way classical Unix inodes do it: every
//! descriptor roots a direct block pointer, a singly-indirect pointer
//! block, a doubly-indirect pointer tree and a triply-indirect pointer
//! tree, each tree overflowing into the next as the file grows. Since a
//! block pointer is 8 bytes, a file can span up to
//! `1 + n/8 + (n/8)^2 + (n/8)^3` blocks, where `n` is the block size.
//!
//! Blocks come from a first-fit bit-vector allocator that always returns
//! the lowest free block, so allocation patterns are deterministic and
//! reproducible. Block 0 is reserved at construction and serves as the
//! null sentinel inside pointer blocks.
//!
//! The core is single-threaded and synchronous: no operation blocks, and
//! the store performs no heap allocation after construction. Callers that
//! want to share a store across components can wrap it with
//! [`MemFs::into_shared`].
//!
//! # Example
//!
//! ```
//! use memfs::{FsGeometry, FileId, MemFs};
//!
//! let geometry = FsGeometry::new(4096, 64, 4).unwrap();
//! let mut fs = MemFs::new(geometry);
//!
//! let mut file = fs.file_at(FileId::from(0)).unwrap();
//! file.create().unwrap();
//! file.resize(10_000).unwrap();
//! assert_eq!(file.allocated_block_count(), 3);
//!
//! file.delete().unwrap();
//! assert_eq!(fs.payload(), 1); // only the reserved block remains
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod dir;
mod err;
mod file;
mod geometry;
mod indirect;
mod layout;
mod store;
mod superblock;

pub use err::{CanFail, FsError, FsResult};
pub use file::FileRef;
pub use geometry::FsGeometry;
pub use layout::{
    BlockId, Descriptor, FileData, FileFlags, FileHeader, FileId, Header, SecurityAttributes,
};
pub use store::{MemFs, SharedFs};
