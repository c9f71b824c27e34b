#![forbid(unsafe_code)]
//! Transactional block cache with SIEVE-2 eviction and asynchronous
//! write-back.
//!
//! A [`BlockCache`] binds one [`BlockDevice`] to the unified cache engine
//! and layers transactional write grouping on top:
//!
//! - `get` / `get_writable` / `get_empty` hand out borrow guards; the
//!   entry's reference count pins it against eviction until every guard is
//!   dropped.
//! - writes attach blocks to an open transaction; ending the transaction
//!   makes its blocks eligible for asynchronous write-back as a unit, and
//!   listeners observe `Ended`/`Written`/`Aborted`/`Idle` events.
//! - the write-back engine coalesces dirty blocks into contiguous runs and
//!   issues scatter-writes with the cache lock released.
//!
//! One mutex per cache instance guards all metadata. Entry buffers live
//! behind `Arc<RwLock<Vec<u8>>>`, so device I/O and callers touch bytes
//! without holding the cache lock; a buffer's Arc identity doubles as the
//! snapshot marker that detects writes racing ahead of in-flight I/O.

use bcache_error::{CacheError, Result};
use bcache_sieve::{CacheStats, EntryKey, SieveCache};
use bcache_types::{BlockNumber, BlockSize, CacheKind, EntryId, TransactionId};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

mod device;
mod notifier;
mod transaction;
mod writer;

pub use device::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use notifier::{MemoryPressure, Notifier, NotifierConfig};
pub use transaction::{ListenerId, TransactionHook};

pub(crate) type Buffer = Arc<RwLock<Vec<u8>>>;

pub(crate) fn block_key(block: BlockNumber) -> EntryKey {
    EntryKey::new(EntryId::for_block(block), CacheKind::Block)
}

/// Copy-on-write: replace the buffer with a fresh copy of its bytes and
/// return the old `Arc` (which in-flight readers and writers keep).
pub(crate) fn detach_buffer(buf: &mut Buffer) -> Buffer {
    let copy = buf.read().clone();
    std::mem::replace(buf, Arc::new(RwLock::new(copy)))
}

/// Per-block state decorating a unified cache entry.
#[derive(Debug)]
pub(crate) struct BlockData {
    /// Current bytes. Replaced (never mutated through) when a snapshot of
    /// the old bytes must stay stable.
    pub data: Buffer,
    /// Bytes as they were before the current transaction first touched the
    /// block. Restored on abort; written back on behalf of the previous
    /// transaction while a newer one holds the current bytes.
    pub original: Option<Buffer>,
    /// Bytes at the start of the current sub-transaction.
    pub parent: Option<Buffer>,
    /// Open transaction this block currently belongs to.
    pub txn: Option<TransactionId>,
    /// Closed transaction whose write-back this block is still part of.
    pub prev_txn: Option<TransactionId>,
    pub busy_reading: bool,
    pub busy_writing: bool,
    pub read_waiters: bool,
    pub write_waiters: bool,
    /// Created by `get_empty` inside the current transaction; on abort the
    /// entry is dropped instead of restored (the device was never read).
    pub discard_on_abort: bool,
    /// The entry's transaction was aborted while references were live; the
    /// bytes never came from the device. Dropped as soon as the last
    /// reference goes away, and never served to a new fetch.
    pub discard_on_release: bool,
}

impl BlockData {
    fn new(block_size: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![0_u8; block_size])),
            original: None,
            parent: None,
            txn: None,
            prev_txn: None,
            busy_reading: false,
            busy_writing: false,
            read_waiters: false,
            write_waiters: false,
            discard_on_abort: false,
            discard_on_release: false,
        }
    }
}

pub(crate) struct Notification {
    pub txn: TransactionId,
    pub event: bcache_types::TransactionEvent,
    pub hooks: Vec<TransactionHook>,
}

pub(crate) struct CacheState {
    pub sieve: SieveCache<BlockData>,
    pub transactions: BTreeMap<TransactionId, transaction::Transaction>,
    pub next_transaction: i32,
    pub next_listener: u64,
    pub notifications: VecDeque<Notification>,
    pub last_write_activity: Instant,
    pub idle_notified: bool,
}

pub(crate) struct CacheInner {
    pub device: Arc<dyn BlockDevice>,
    pub block_size: BlockSize,
    pub block_count: u64,
    pub read_only: bool,
    pub state: Mutex<CacheState>,
    /// Woken when an in-flight load of a block completes.
    pub read_done: Condvar,
    /// Woken when a block's write submission completes.
    pub write_done: Condvar,
    pub waker: Mutex<Option<Weak<notifier::NotifierShared>>>,
}

/// Point-in-time counters of one cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCacheMetrics {
    pub cached_blocks: usize,
    pub cached_bytes: usize,
    pub dirty_blocks: usize,
    pub capacity_bytes: usize,
    pub transactions: usize,
}

/// Per-block-device cache façade.
///
/// Cloning is cheap and shares the instance.
#[derive(Clone)]
pub struct BlockCache {
    pub(crate) inner: Arc<CacheInner>,
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metrics = self.metrics();
        f.debug_struct("BlockCache")
            .field("block_size", &self.inner.block_size.get())
            .field("block_count", &self.inner.block_count)
            .field("read_only", &self.inner.read_only)
            .field("metrics", &metrics)
            .finish_non_exhaustive()
    }
}

enum Load {
    /// Read the block from the device on a miss.
    Read,
    /// Skip the read; the caller overwrites the whole block.
    Empty,
}

struct Fetched {
    buf: Buffer,
    created: bool,
}

impl BlockCache {
    /// Create a cache instance for `device` with the given byte budget.
    pub fn new(device: Arc<dyn BlockDevice>, capacity_bytes: usize, read_only: bool) -> Result<Self> {
        let block_size = device.block_size();
        let block_count = device.block_count();
        if block_count == 0 {
            return Err(CacheError::BadValue("device has zero blocks".to_owned()));
        }
        if capacity_bytes < block_size.as_usize() {
            return Err(CacheError::BadValue(format!(
                "capacity_bytes={capacity_bytes} is smaller than one block"
            )));
        }

        tracing::info!(
            target: "bcache::cache",
            block_size = block_size.get(),
            block_count,
            capacity_bytes,
            read_only,
            "block cache created"
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                device,
                block_size,
                block_count,
                read_only,
                state: Mutex::new(CacheState {
                    sieve: SieveCache::new(capacity_bytes),
                    transactions: BTreeMap::new(),
                    next_transaction: 1,
                    next_listener: 1,
                    notifications: VecDeque::new(),
                    last_write_activity: Instant::now(),
                    idle_notified: false,
                }),
                read_done: Condvar::new(),
                write_done: Condvar::new(),
                waker: Mutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.inner.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.inner.block_count
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Read-only view of a block. Loads from the device on a miss; blocks
    /// while another caller is mid-load of the same block.
    pub fn get(&self, block: BlockNumber) -> Result<BlockRef> {
        self.inner.check_range(block)?;
        let fetched = self.inner.fetch(block, Load::Read)?;
        Ok(BlockRef {
            inner: Arc::clone(&self.inner),
            block,
            buf: fetched.buf,
        })
    }

    /// Mutable view of a block, attached to `txn` when given.
    ///
    /// The block is marked dirty immediately. With `txn = None` the block
    /// must not belong to an open transaction.
    pub fn get_writable(
        &self,
        block: BlockNumber,
        txn: Option<TransactionId>,
    ) -> Result<BlockMut> {
        self.writable_view(block, txn, Load::Read)
    }

    /// Like [`get_writable`](Self::get_writable) but skips the device read:
    /// the caller will fully overwrite the block. The buffer is zeroed.
    pub fn get_empty(&self, block: BlockNumber, txn: Option<TransactionId>) -> Result<BlockMut> {
        self.writable_view(block, txn, Load::Empty)
    }

    fn writable_view(
        &self,
        block: BlockNumber,
        txn: Option<TransactionId>,
        load: Load,
    ) -> Result<BlockMut> {
        if self.inner.read_only {
            return Err(CacheError::ReadOnly);
        }
        self.inner.check_range(block)?;
        let zero_fill = matches!(load, Load::Empty);
        let fetched = self.inner.fetch(block, load)?;

        let mut state = self.inner.state.lock();
        let attach = transaction::attach_block(&mut state, block, txn, fetched.created);
        let buf = match attach {
            Ok(buf) => buf,
            Err(err) => {
                // Undo the fetch reference before surfacing the error. An
                // entry created by this call never held device bytes, so it
                // must not stay cached as clean content.
                let _ = state.sieve.release(block_key(block));
                if fetched.created {
                    let _ = state.sieve.discard(block_key(block));
                }
                return Err(err);
            }
        };
        drop(state);

        if zero_fill {
            buf.write().fill(0);
        }

        Ok(BlockMut {
            inner: Arc::clone(&self.inner),
            block,
            buf,
        })
    }

    /// Mark an already-cached block writable and dirty, attaching it to
    /// `txn` when given. `NotFound` if the block is not cached.
    pub fn make_writable(&self, block: BlockNumber, txn: Option<TransactionId>) -> Result<()> {
        if self.inner.read_only {
            return Err(CacheError::ReadOnly);
        }
        self.inner.check_range(block)?;
        let mut state = self.inner.state.lock();
        if !state.sieve.contains(block_key(block)) {
            return Err(CacheError::NotFound(format!("block {block}")));
        }
        transaction::attach_block(&mut state, block, txn, false).map(|_| ())
    }

    /// Set or clear a cached block's dirty flag.
    ///
    /// Setting behaves like [`make_writable`](Self::make_writable);
    /// clearing is the caller's statement that the current bytes are
    /// already durable.
    pub fn set_dirty(
        &self,
        block: BlockNumber,
        dirty: bool,
        txn: Option<TransactionId>,
    ) -> Result<()> {
        if dirty {
            return self.make_writable(block, txn);
        }
        self.inner.check_range(block)?;
        let mut state = self.inner.state.lock();
        let entry = state
            .sieve
            .peek_mut(block_key(block))
            .ok_or_else(|| CacheError::NotFound(format!("block {block}")))?;
        if entry.payload.txn.is_some() || entry.payload.prev_txn.is_some() {
            return Err(CacheError::Busy(format!(
                "block {block} belongs to a transaction"
            )));
        }
        entry.set_dirty(false);
        Ok(())
    }

    /// Remove `count` blocks starting at `block` from the cache,
    /// unconditionally dropping dirty data.
    ///
    /// All-or-nothing: fails with `Busy` if any block in the range is
    /// referenced or mid-I/O, and `NotFound` if any block in the range is
    /// not cached. Transaction membership of discarded blocks is severed;
    /// a previous transaction whose last pending block is discarded
    /// resolves as written.
    pub fn discard(&self, block: BlockNumber, count: u64) -> Result<()> {
        let mut state = self.inner.state.lock();

        for offset in 0..count {
            let b = BlockNumber(block.0 + offset);
            let entry = state
                .sieve
                .peek(block_key(b))
                .ok_or_else(|| CacheError::NotFound(format!("block {b}")))?;
            if entry.ref_count() > 0 {
                return Err(CacheError::Busy(format!(
                    "block {b} has {} references",
                    entry.ref_count()
                )));
            }
            if entry.payload.busy_reading || entry.payload.busy_writing {
                return Err(CacheError::Busy(format!("block {b} has I/O in flight")));
            }
        }

        for offset in 0..count {
            let b = BlockNumber(block.0 + offset);
            transaction::detach_discarded(&mut state, b);
            let _ = state.sieve.discard(block_key(b));
        }
        drop(state);

        self.inner.flush_notifications();
        Ok(())
    }

    /// Write back every eligible dirty block and sync the device.
    /// Surfaces the first write error; failed blocks stay dirty.
    pub fn sync(&self) -> Result<()> {
        self.inner.sync_where(|_| true)
    }

    /// Like [`sync`](Self::sync), restricted to `count` blocks starting at
    /// `block`.
    pub fn sync_range(&self, block: BlockNumber, count: u64) -> Result<()> {
        let end = block.0.saturating_add(count);
        self.inner.sync_where(move |b| b.0 >= block.0 && b.0 < end)
    }

    /// Walk unreferenced entries oldest-first, write back dirty ones, and
    /// drop up to `count` of them that have been idle for at least
    /// `min_age`. Returns the number removed.
    pub fn remove_unused_blocks(&self, count: usize, min_age: std::time::Duration) -> usize {
        let now = Instant::now();
        let old_enough = move |last_used: Instant| now.duration_since(last_used) >= min_age;

        // Flush dirty candidates first so they become droppable.
        let outcome = self.inner.write_back_where(count, |_, entry| {
            entry.ref_count() == 0 && old_enough(entry.last_used())
        });
        if let Some(err) = &outcome.first_error {
            tracing::warn!(
                target: "bcache::cache",
                %err,
                "write-back during low-memory pruning failed; dirty blocks retained"
            );
        }

        let mut removed = 0_usize;
        let mut state = self.inner.state.lock();
        for key in state.sieve.keys_oldest_first() {
            if removed >= count {
                break;
            }
            let Some(entry) = state.sieve.peek(key) else {
                continue;
            };
            let bd = &entry.payload;
            if entry.ref_count() > 0
                || entry.is_dirty()
                || bd.busy_reading
                || bd.busy_writing
                || bd.txn.is_some()
                || bd.prev_txn.is_some()
                || !old_enough(entry.last_used())
            {
                continue;
            }
            let _ = state.sieve.discard(key);
            removed += 1;
        }
        drop(state);

        if removed > 0 {
            tracing::info!(
                target: "bcache::cache",
                removed,
                min_age_secs = min_age.as_secs(),
                "removed unused blocks"
            );
        }
        removed
    }

    #[must_use]
    pub fn metrics(&self) -> BlockCacheMetrics {
        let state = self.inner.state.lock();
        let mut dirty = 0_usize;
        for key in state.sieve.keys_oldest_first() {
            if state.sieve.peek(key).is_some_and(bcache_sieve::Entry::is_dirty) {
                dirty += 1;
            }
        }
        BlockCacheMetrics {
            cached_blocks: state.sieve.len(),
            cached_bytes: state.sieve.current_bytes(),
            dirty_blocks: dirty,
            capacity_bytes: state.sieve.capacity_bytes(),
            transactions: state.transactions.len(),
        }
    }

    /// Number of dirty blocks currently cached.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.metrics().dirty_blocks
    }

    /// Engine counters (hits, misses, evictions, insertions).
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.state.lock().sieve.stats()
    }

    /// Detach from the background notifier and flush.
    ///
    /// With `allow_writes`, every eligible dirty block is written and the
    /// device synced; without it, dirty data is explicitly dropped.
    pub fn close(&self, allow_writes: bool) -> Result<()> {
        *self.inner.waker.lock() = None;
        if allow_writes && !self.inner.read_only {
            self.sync()
        } else {
            let mut state = self.inner.state.lock();
            for key in state.sieve.keys_oldest_first() {
                if let Some(entry) = state.sieve.peek_mut(key) {
                    entry.set_dirty(false);
                }
            }
            Ok(())
        }
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if self.read_only {
            return;
        }
        // Best-effort flush on the last handle going away. Errors are
        // logged; the data cannot be retained past this point.
        let outcome = self.write_back_where(usize::MAX, |_, _| true);
        if let Some(err) = outcome.first_error {
            tracing::error!(
                target: "bcache::cache",
                %err,
                "flush on drop failed; dirty blocks lost"
            );
        } else if let Err(err) = self.device.sync() {
            tracing::error!(target: "bcache::cache", %err, "device sync on drop failed");
        }
    }
}

impl CacheInner {
    pub(crate) fn check_range(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.block_count {
            return Err(CacheError::BadValue(format!(
                "block out of range: block={block} block_count={}",
                self.block_count
            )));
        }
        Ok(())
    }

    /// Get or load the entry for `block`, leaving it referenced once.
    fn fetch(&self, block: BlockNumber, load: Load) -> Result<Fetched> {
        let key = block_key(block);
        let mut wrote_back = false;

        enum Lookup {
            Miss,
            Wait,
            DiscardStale,
            Hit,
        }

        loop {
            let mut state = self.state.lock();

            loop {
                // Peek first so a spurious condvar wakeup cannot inflate
                // the hit count or reset the entry's visits.
                let lookup = match state.sieve.peek_mut(key) {
                    None => Lookup::Miss,
                    Some(entry) if entry.payload.busy_reading => {
                        entry.payload.read_waiters = true;
                        Lookup::Wait
                    }
                    Some(entry) if entry.payload.discard_on_release => {
                        // Aborted creation whose bytes never came from the
                        // device. Reload once the pinning guard lets go.
                        if entry.ref_count() == 0 {
                            Lookup::DiscardStale
                        } else {
                            entry.payload.read_waiters = true;
                            Lookup::Wait
                        }
                    }
                    Some(_) => Lookup::Hit,
                };
                match lookup {
                    Lookup::Miss => break,
                    Lookup::Wait => {
                        self.read_done.wait(&mut state);
                        continue;
                    }
                    Lookup::DiscardStale => {
                        let _ = state.sieve.discard(key);
                        break;
                    }
                    Lookup::Hit => {}
                }
                let Some(entry) = state.sieve.get(key) else {
                    break;
                };
                entry.retain();
                return Ok(Fetched {
                    buf: Arc::clone(&entry.payload.data),
                    created: false,
                });
            }

            // Miss. Make room; a failed eviction pass gets one shot at
            // forcing write-back of dirty candidates before we exceed the
            // budget (a read must not fail for lack of clean victims).
            let size = self.block_size.as_usize();
            let room = state.sieve.make_room(size, |entry| {
                let bd = &entry.payload;
                !entry.is_dirty()
                    && !bd.busy_reading
                    && !bd.busy_writing
                    && bd.txn.is_none()
                    && bd.prev_txn.is_none()
            });
            if room.is_err() && !wrote_back {
                wrote_back = true;
                drop(state);
                let outcome = self.write_back_where(16, |_, _| true);
                if outcome.written > 0 {
                    continue;
                }
                // Nothing writable either; fall through over budget.
                state = self.state.lock();
            } else if room.is_err() {
                tracing::warn!(
                    target: "bcache::cache",
                    block = block.0,
                    current_bytes = state.sieve.current_bytes(),
                    capacity_bytes = state.sieve.capacity_bytes(),
                    "no eviction victim; cache temporarily exceeds its budget"
                );
            }

            if state.sieve.contains(key) {
                // Raced with another loader while unlocked.
                continue;
            }

            let entry = state.sieve.insert(key, size, BlockData::new(size))?;
            entry.retain();
            match load {
                Load::Empty => {
                    return Ok(Fetched {
                        buf: Arc::clone(&entry.payload.data),
                        created: true,
                    });
                }
                Load::Read => {
                    entry.payload.busy_reading = true;
                    drop(state);

                    let read = self.device.read_block(block);

                    let mut state = self.state.lock();
                    let entry = state
                        .sieve
                        .peek_mut(key)
                        .unwrap_or_else(|| unreachable!("referenced entry vanished"));
                    let bd = &mut entry.payload;
                    bd.busy_reading = false;
                    if bd.read_waiters {
                        bd.read_waiters = false;
                        self.read_done.notify_all();
                    }
                    match read {
                        Ok(bytes) => {
                            *bd.data.write() = bytes;
                            return Ok(Fetched {
                                buf: Arc::clone(&bd.data),
                                created: false,
                            });
                        }
                        Err(err) => {
                            let _ = state.sieve.release(key);
                            let _ = state.sieve.discard(key);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Deliver queued transaction notifications, outside the cache lock.
    pub(crate) fn flush_notifications(&self) {
        loop {
            let next = self.state.lock().notifications.pop_front();
            let Some(notification) = next else {
                break;
            };
            tracing::trace!(
                target: "bcache::txn",
                txn = notification.txn.0,
                event = ?notification.event,
                listeners = notification.hooks.len(),
                "delivering transaction event"
            );
            for hook in &notification.hooks {
                hook(notification.txn, notification.event);
            }
        }
    }

    /// Nudge the background notifier, when one is registered.
    pub(crate) fn wake_notifier(&self) {
        let waker = self.waker.lock().clone();
        if let Some(shared) = waker.and_then(|weak| weak.upgrade()) {
            shared.signal();
        }
    }

    pub(crate) fn release_block(&self, block: BlockNumber) {
        let key = block_key(block);
        let mut state = self.state.lock();
        match state.sieve.release(key) {
            Ok(0) => {
                let stale = state.sieve.peek(key).is_some_and(|entry| {
                    let bd = &entry.payload;
                    bd.discard_on_release && !bd.busy_reading && !bd.busy_writing
                });
                if stale {
                    let _ = state.sieve.discard(key);
                    // Fetches parked on the stale entry re-check and reload.
                    self.read_done.notify_all();
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(
                    target: "bcache::cache",
                    block = block.0,
                    %err,
                    "release on guard drop failed"
                );
            }
        }
    }
}

/// Read-only borrow of a cached block.
///
/// The entry stays resident while the guard lives; dropping it releases
/// the reference.
pub struct BlockRef {
    inner: Arc<CacheInner>,
    block: BlockNumber,
    buf: Buffer,
}

impl BlockRef {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// The block's bytes. This snapshot stays stable even if a newer
    /// transaction replaces the block's current buffer.
    #[must_use]
    pub fn data(&self) -> &RwLock<Vec<u8>> {
        &self.buf
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRef").field("block", &self.block.0).finish()
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        self.inner.release_block(self.block);
    }
}

/// Mutable borrow of a cached block, already marked dirty.
///
/// Mutate through [`data`](Self::data) without any cache lock held. The
/// dirty flag was set when the guard was created.
pub struct BlockMut {
    inner: Arc<CacheInner>,
    block: BlockNumber,
    buf: Buffer,
}

impl BlockMut {
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    #[must_use]
    pub fn data(&self) -> &RwLock<Vec<u8>> {
        &self.buf
    }
}

impl fmt::Debug for BlockMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMut").field("block", &self.block.0).finish()
    }
}

impl Drop for BlockMut {
    fn drop(&mut self) {
        self.inner.release_block(self.block);
    }
}
