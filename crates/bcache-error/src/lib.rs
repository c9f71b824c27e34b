#![forbid(unsafe_code)]
//! Error types for the bcache workspace.
//!
//! `CacheError` is the single user-facing error type returned by the cache
//! engine, the block layer, and the API surface. Every variant maps to
//! exactly one POSIX errno via [`CacheError::to_errno`]; the mapping is
//! exhaustive (no wildcard arms) so adding a variant is a compile error
//! until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `NoMemory` | `ENOMEM` |
//! | `OutOfSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Busy` | `EBUSY` |
//! | `Io` | raw os error, else `EIO` |
//! | `BadValue` | `EINVAL` |
//! | `ReadOnly` | `EROFS` |
//!
//! `bcache-error` depends on nothing else in the workspace, so every other
//! crate can return it without cyclic dependencies.

use thiserror::Error;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Allocation failed or the cache's byte budget is exhausted and no
    /// entry could be evicted to make room for an internal allocation.
    #[error("out of memory")]
    NoMemory,

    /// Inserting would exceed the byte budget and eviction could not free
    /// enough space (all candidates referenced or dirty-and-unwritable).
    #[error("cache budget exhausted: {0}")]
    OutOfSpace(String),

    /// Unknown id on discard or lookup.
    #[error("not found: {0}")]
    NotFound(String),

    /// The entry is still referenced or mid-write and cannot be discarded.
    #[error("resource busy: {0}")]
    Busy(String),

    /// Device read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed arguments, e.g. ending an unknown transaction id.
    #[error("bad value: {0}")]
    BadValue(String),

    /// The cache was created read-only and a write was attempted.
    #[error("read-only cache")]
    ReadOnly,
}

impl CacheError {
    /// Convert this error into a POSIX errno.
    ///
    /// `Io` preserves the underlying raw os error when one exists; synthetic
    /// I/O errors fall back to `EIO`.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NoMemory => libc::ENOMEM,
            Self::OutOfSpace(_) => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Busy(_) => libc::EBUSY,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::BadValue(_) => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;
