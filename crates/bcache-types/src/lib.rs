#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Block number on a block device (zero-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockNumber {
    /// The block immediately after this one, or `None` on overflow.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

/// Composite cache-entry identity.
///
/// For block caches this is the block number. For page caches it packs an
/// owner id and a page index, see [`EntryId::for_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Identity of a cached disk block.
    #[must_use]
    pub fn for_block(block: BlockNumber) -> Self {
        Self(block.0)
    }

    /// Composite identity `(owner_id << shift) | page_index`.
    ///
    /// The caller picks `shift` large enough that every page index of one
    /// owner fits below it; ids from different owners then never collide.
    #[must_use]
    pub fn for_page(owner_id: u64, page_index: u64, shift: u32) -> Self {
        Self((owner_id << shift) | page_index)
    }
}

/// Payload semantics of a cache entry. Never mixed for one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKind {
    Block,
    Page,
}

/// Transaction identifier, monotonically assigned per cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub i32);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, InvalidBlockSize> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(InvalidBlockSize(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of the given block, `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

/// Error for out-of-range block sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid block size {0}: must be a power of two in 512..=65536")]
pub struct InvalidBlockSize(pub u32);

/// A single transaction lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionEvent {
    /// All blocks of the closed transaction are durably written.
    Written,
    /// The transaction was aborted; its modifications were reverted.
    Aborted,
    /// The transaction was closed for new writes.
    Ended,
    /// No write activity for the configured idle interval.
    Idle,
}

impl TransactionEvent {
    #[must_use]
    pub fn as_mask(self) -> EventMask {
        match self {
            Self::Written => EventMask::WRITTEN,
            Self::Aborted => EventMask::ABORTED,
            Self::Ended => EventMask::ENDED,
            Self::Idle => EventMask::IDLE,
        }
    }
}

/// Bitmask of transaction events a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventMask(pub u8);

impl EventMask {
    pub const NONE: Self = Self(0);
    pub const WRITTEN: Self = Self(1);
    pub const ABORTED: Self = Self(1 << 1);
    pub const ENDED: Self = Self(1 << 2);
    pub const IDLE: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    #[must_use]
    pub fn contains(self, event: TransactionEvent) -> bool {
        self.0 & event.as_mask().0 != 0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}
