//! Error types raised by the filesystem core.
//!
//! Every fallible operation of the crate reports one of the variants of
//! [`FsError`]. There is no internal recovery: errors surface synchronously at
//! the operation boundary, and the store is left in the state the partial
//! execution committed (see [`crate::FileRef::resize`] for the one operation
//! where that state is observable).

use core::fmt::{Display, Formatter};

/// `CanFail` is a return type for operations that are allowed to fail and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Result alias used throughout the filesystem core.
pub type FsResult<T> = Result<T, FsError>;

/// `FsError` defines the error conditions of the filesystem core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// An index argument exceeds the static bound of the target array or
    /// indirection tree.
    OutOfRange,

    /// No free block is available for a requested allocation: every
    /// super-block is saturated.
    OutOfSpace,

    /// Attempt to allocate a block already marked taken. This is an invariant
    /// violation: it cannot be produced through the public API and indicates
    /// a corrupted allocation bitmap.
    DoubleAlloc,

    /// Attempt to free a block not marked taken. Invariant violation, like
    /// [`FsError::DoubleAlloc`].
    DoubleFree,

    /// `create` was called on a descriptor that is already live.
    AlreadyExists,

    /// The operation targets a descriptor that is not live.
    NotFound,

    /// The store geometry is invalid (see [`crate::FsGeometry`] for the
    /// parameter constraints).
    BadGeometry,
}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfRange => f.write_str("index out of range"),
            Self::OutOfSpace => f.write_str("no free block available"),
            Self::DoubleAlloc => f.write_str("block is already allocated"),
            Self::DoubleFree => f.write_str("block is not allocated"),
            Self::AlreadyExists => f.write_str("file already exists"),
            Self::NotFound => f.write_str("no such file"),
            Self::BadGeometry => f.write_str("invalid store geometry"),
        }
    }
}
