//! Transaction lifecycle and event delivery.
//!
//! A transaction groups dirty blocks so they reach the device together.
//! While it is open its blocks never write back; ending it hands the
//! blocks to the write-back engine as the block's *previous transaction*,
//! and a newer transaction may immediately start modifying the same
//! blocks against a frozen snapshot of the committed bytes.

use crate::{block_key, detach_buffer, Buffer, CacheState, Notification};
use bcache_error::{CacheError, Result};
use bcache_types::{BlockNumber, EventMask, TransactionEvent, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Callback invoked outside all cache locks when a subscribed event fires.
pub type TransactionHook = Arc<dyn Fn(TransactionId, TransactionEvent) + Send + Sync>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

pub(crate) struct Listener {
    pub id: ListenerId,
    pub mask: EventMask,
    pub hook: TransactionHook,
    pub once: bool,
}

pub(crate) struct Transaction {
    pub open: bool,
    pub has_sub: bool,
    /// Members while open.
    pub blocks: BTreeSet<BlockNumber>,
    /// Members as of `start_sub_transaction`.
    pub main_blocks: BTreeSet<BlockNumber>,
    /// Members still awaiting write-back after the transaction ended.
    pub pending: BTreeSet<BlockNumber>,
    pub listeners: Vec<Listener>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            open: true,
            has_sub: false,
            blocks: BTreeSet::new(),
            main_blocks: BTreeSet::new(),
            pending: BTreeSet::new(),
            listeners: Vec::new(),
        }
    }
}

/// Frozen byte copy of a buffer. The live `Arc` keeps its identity so
/// existing guards still observe later mutations.
fn freeze(buf: &Buffer) -> Buffer {
    Arc::new(parking_lot::RwLock::new(buf.read().clone()))
}

fn unknown_txn(id: TransactionId) -> CacheError {
    CacheError::BadValue(format!("unknown transaction {}", id.0))
}

fn closed_txn(id: TransactionId) -> CacheError {
    CacheError::BadValue(format!("transaction {} already ended", id.0))
}

/// Attach a cached block to `txn` (or to no transaction) and mark it
/// dirty. The entry must already be present.
pub(crate) fn attach_block(
    state: &mut CacheState,
    block: BlockNumber,
    txn: Option<TransactionId>,
    created: bool,
) -> Result<Buffer> {
    let CacheState {
        sieve, transactions, ..
    } = state;

    let entry = sieve
        .peek_mut(block_key(block))
        .ok_or_else(|| CacheError::NotFound(format!("block {block}")))?;
    let bd = &mut entry.payload;
    if bd.busy_reading {
        return Err(CacheError::Busy(format!("block {block} is being loaded")));
    }
    if bd.discard_on_release {
        // Pinned leftover of an aborted creation; it drops with its last
        // reference and cannot be rejoined.
        return Err(CacheError::Busy(format!("block {block} is being dropped")));
    }

    let Some(id) = txn else {
        if let Some(owner) = bd.txn {
            return Err(CacheError::Busy(format!(
                "block {block} belongs to transaction {}",
                owner.0
            )));
        }
        if bd.busy_writing {
            // The in-flight write keeps the old buffer as its image.
            let _ = detach_buffer(&mut bd.data);
        }
        let data = Arc::clone(&bd.data);
        entry.set_dirty(true);
        return Ok(data);
    };

    let txn_state = transactions.get_mut(&id).ok_or_else(|| unknown_txn(id))?;
    if !txn_state.open {
        return Err(closed_txn(id));
    }

    match bd.txn {
        Some(owner) if owner != id => {
            return Err(CacheError::Busy(format!(
                "block {block} belongs to transaction {}",
                owner.0
            )));
        }
        Some(_) => {
            // Already a member. First touch inside a sub-transaction
            // snapshots the sub-start bytes of pre-sub members.
            if txn_state.has_sub && bd.parent.is_none() && txn_state.main_blocks.contains(&block) {
                bd.parent = Some(freeze(&bd.data));
            }
        }
        None => {
            if bd.busy_writing {
                let _ = detach_buffer(&mut bd.data);
            }
            if bd.original.is_none() {
                // Pre-transaction bytes, restored on abort. When the block
                // still carries a previous transaction this snapshot is
                // also its write-back image.
                bd.original = Some(freeze(&bd.data));
            }
            bd.txn = Some(id);
            bd.discard_on_abort = created;
            txn_state.blocks.insert(block);
            tracing::trace!(
                target: "bcache::txn",
                txn = id.0,
                block = block.0,
                "block joined transaction"
            );
        }
    }

    let data = Arc::clone(&bd.data);
    entry.set_dirty(true);
    Ok(data)
}

/// Queue `event` to every listener of `txn_id` whose mask matches.
/// `once` listeners are dropped at queue time.
pub(crate) fn queue_event(state: &mut CacheState, txn_id: TransactionId, event: TransactionEvent) {
    let CacheState {
        transactions,
        notifications,
        ..
    } = state;
    let Some(txn) = transactions.get_mut(&txn_id) else {
        return;
    };
    let mut hooks = Vec::new();
    txn.listeners.retain(|listener| {
        if listener.mask.contains(event) {
            hooks.push(Arc::clone(&listener.hook));
            !listener.once
        } else {
            true
        }
    });
    if !hooks.is_empty() {
        notifications.push_back(Notification {
            txn: txn_id,
            event,
            hooks,
        });
    }
}

/// Destroy a closed transaction once its last pending block is durable,
/// queueing `Written`.
pub(crate) fn resolve_if_complete(state: &mut CacheState, txn_id: TransactionId) {
    let done = state
        .transactions
        .get(&txn_id)
        .is_some_and(|txn| !txn.open && txn.pending.is_empty());
    if !done {
        return;
    }
    queue_event(state, txn_id, TransactionEvent::Written);
    state.transactions.remove(&txn_id);
    tracing::debug!(target: "bcache::txn", txn = txn_id.0, "transaction fully written");
}

/// A block of `prev_txn` reached the device (or was discarded).
pub(crate) fn note_block_written(
    state: &mut CacheState,
    txn_id: TransactionId,
    block: BlockNumber,
) {
    if let Some(txn) = state.transactions.get_mut(&txn_id) {
        txn.pending.remove(&block);
    }
    resolve_if_complete(state, txn_id);
}

/// Sever a block being discarded from its transactions.
pub(crate) fn detach_discarded(state: &mut CacheState, block: BlockNumber) {
    let (owner, prev) = match state.sieve.peek(block_key(block)) {
        Some(entry) => (entry.payload.txn, entry.payload.prev_txn),
        None => return,
    };
    if let Some(id) = owner {
        if let Some(txn) = state.transactions.get_mut(&id) {
            txn.blocks.remove(&block);
            txn.main_blocks.remove(&block);
        }
    }
    if let Some(id) = prev {
        note_block_written(state, id, block);
    }
}

impl crate::BlockCache {
    /// Open a new transaction.
    pub fn start_transaction(&self) -> Result<TransactionId> {
        if self.inner.read_only {
            return Err(CacheError::ReadOnly);
        }
        let mut state = self.inner.state.lock();
        let id = TransactionId(state.next_transaction);
        state.next_transaction += 1;
        state.transactions.insert(id, Transaction::new());
        tracing::debug!(target: "bcache::txn", txn = id.0, "transaction started");
        Ok(id)
    }

    /// Close a transaction: its blocks become eligible for write-back as
    /// this transaction's pending set, and `Ended` fires.
    ///
    /// `hook` is a convenience one-shot listener registered atomically
    /// with the close. Blocks still pending an older transaction are
    /// flushed synchronously first, then re-linked to this one.
    pub fn end_transaction(
        &self,
        id: TransactionId,
        hook: Option<(EventMask, TransactionHook)>,
    ) -> Result<()> {
        if self.inner.read_only {
            return Err(CacheError::ReadOnly);
        }
        self.settle_previous(id)?;

        let mut state = self.inner.state.lock();
        let st = &mut *state;
        {
            let txn = st.transactions.get_mut(&id).ok_or_else(|| unknown_txn(id))?;
            if !txn.open {
                return Err(closed_txn(id));
            }
            if let Some((mask, hook)) = hook {
                let listener_id = ListenerId(st.next_listener);
                st.next_listener += 1;
                txn.listeners.push(Listener {
                    id: listener_id,
                    mask,
                    hook,
                    once: true,
                });
            }
            txn.open = false;
            txn.has_sub = false;
            txn.main_blocks.clear();
        }

        let members = {
            let txn = st
                .transactions
                .get_mut(&id)
                .unwrap_or_else(|| unreachable!("transaction checked above"));
            std::mem::take(&mut txn.blocks)
        };
        for &block in &members {
            if let Some(entry) = st.sieve.peek_mut(block_key(block)) {
                let bd = &mut entry.payload;
                bd.txn = None;
                bd.prev_txn = Some(id);
                bd.original = None;
                bd.parent = None;
                bd.discard_on_abort = false;
            }
        }
        let block_count = members.len();
        if let Some(txn) = st.transactions.get_mut(&id) {
            txn.pending = members;
        }

        queue_event(st, id, TransactionEvent::Ended);
        resolve_if_complete(st, id);
        drop(state);

        tracing::debug!(target: "bcache::txn", txn = id.0, blocks = block_count, "transaction ended");
        self.inner.flush_notifications();
        self.inner.wake_notifier();
        Ok(())
    }

    /// Abort an open transaction, restoring every member block to its
    /// pre-transaction bytes. Blocks created inside the transaction are
    /// dropped from the cache entirely. `Aborted` fires.
    pub fn abort_transaction(&self, id: TransactionId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let st = &mut *state;
        let members = {
            let txn = st.transactions.get_mut(&id).ok_or_else(|| unknown_txn(id))?;
            if !txn.open {
                return Err(closed_txn(id));
            }
            std::mem::take(&mut txn.blocks)
        };

        let mut drop_entries = Vec::new();
        for &block in &members {
            let Some(entry) = st.sieve.peek_mut(block_key(block)) else {
                continue;
            };
            entry.payload.txn = None;
            entry.payload.parent = None;
            let droppable = entry.payload.discard_on_abort
                && entry.ref_count() == 0
                && !entry.payload.busy_reading
                && !entry.payload.busy_writing;
            if droppable {
                drop_entries.push(block);
                continue;
            }
            let bd = &mut entry.payload;
            if bd.discard_on_abort {
                // A guard or in-flight I/O still pins the entry. Its bytes
                // never came from the device; drop it when the pin goes
                // away instead of keeping them as clean content.
                bd.discard_on_abort = false;
                bd.discard_on_release = true;
                bd.original = None;
                entry.set_dirty(false);
                continue;
            }
            if let Some(original) = bd.original.take() {
                bd.data = original;
            }
            if bd.prev_txn.is_none() {
                entry.set_dirty(false);
            }
        }
        for block in drop_entries {
            let _ = st.sieve.discard(block_key(block));
        }

        queue_event(st, id, TransactionEvent::Aborted);
        st.transactions.remove(&id);
        drop(state);

        tracing::debug!(target: "bcache::txn", txn = id.0, blocks = members.len(), "transaction aborted");
        self.inner.flush_notifications();
        Ok(())
    }

    /// Begin a sub-transaction inside an open transaction. Pre-sub member
    /// bytes are snapshotted lazily on the first sub modification.
    /// `Ended` fires so outer code can observe the checkpoint.
    pub fn start_sub_transaction(&self, id: TransactionId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let st = &mut *state;
        {
            let txn = st.transactions.get_mut(&id).ok_or_else(|| unknown_txn(id))?;
            if !txn.open {
                return Err(closed_txn(id));
            }
            if txn.has_sub {
                return Err(CacheError::BadValue(format!(
                    "transaction {} already has a sub-transaction",
                    id.0
                )));
            }
            txn.has_sub = true;
            txn.main_blocks = txn.blocks.clone();
        }
        queue_event(st, id, TransactionEvent::Ended);
        drop(state);

        tracing::debug!(target: "bcache::txn", txn = id.0, "sub-transaction started");
        self.inner.flush_notifications();
        Ok(())
    }

    /// Revert the current sub-transaction: pre-sub members return to their
    /// sub-start bytes, blocks that joined during the sub are detached as
    /// by an abort. The main transaction stays open with a fresh
    /// sub-transaction in place. `Aborted` fires.
    pub fn abort_sub_transaction(&self, id: TransactionId) -> Result<()> {
        let mut state = self.inner.state.lock();
        let st = &mut *state;
        let (members, main_blocks) = {
            let txn = st.transactions.get_mut(&id).ok_or_else(|| unknown_txn(id))?;
            if !txn.open {
                return Err(closed_txn(id));
            }
            if !txn.has_sub {
                return Err(CacheError::BadValue(format!(
                    "transaction {} has no sub-transaction",
                    id.0
                )));
            }
            (txn.blocks.clone(), txn.main_blocks.clone())
        };

        let mut detached = Vec::new();
        let mut drop_entries = Vec::new();
        for &block in &members {
            let Some(entry) = st.sieve.peek_mut(block_key(block)) else {
                continue;
            };
            if main_blocks.contains(&block) {
                let bd = &mut entry.payload;
                if let Some(parent) = bd.parent.take() {
                    bd.data = parent;
                }
                continue;
            }
            // Joined during the sub: undo the join entirely.
            entry.payload.txn = None;
            entry.payload.parent = None;
            detached.push(block);
            let droppable = entry.payload.discard_on_abort
                && entry.ref_count() == 0
                && !entry.payload.busy_reading
                && !entry.payload.busy_writing;
            if droppable {
                drop_entries.push(block);
                continue;
            }
            let bd = &mut entry.payload;
            if bd.discard_on_abort {
                bd.discard_on_abort = false;
                bd.discard_on_release = true;
                bd.original = None;
                entry.set_dirty(false);
                continue;
            }
            if let Some(original) = bd.original.take() {
                bd.data = original;
            }
            if bd.prev_txn.is_none() {
                entry.set_dirty(false);
            }
        }
        for block in drop_entries {
            let _ = st.sieve.discard(block_key(block));
        }
        if let Some(txn) = st.transactions.get_mut(&id) {
            for block in &detached {
                txn.blocks.remove(block);
            }
        }

        queue_event(st, id, TransactionEvent::Aborted);
        drop(state);

        tracing::debug!(target: "bcache::txn", txn = id.0, "sub-transaction aborted");
        self.inner.flush_notifications();
        Ok(())
    }

    /// Split off the current sub-transaction into a fresh open
    /// transaction and close the main one.
    ///
    /// Blocks modified only before the sub stay with the closing main
    /// transaction. Blocks the sub touched move to the new transaction;
    /// where both modified a block, the sub-start snapshot becomes the
    /// closing transaction's write-back image and the block carries it as
    /// its previous transaction. Returns the new transaction's id.
    pub fn detach_sub_transaction(&self, id: TransactionId) -> Result<TransactionId> {
        if self.inner.read_only {
            return Err(CacheError::ReadOnly);
        }
        // Older previous transactions must clear out first so the
        // previous-transaction slot is free for the re-link.
        self.settle_previous(id)?;

        let mut state = self.inner.state.lock();
        let st = &mut *state;
        let (members, main_blocks) = {
            let txn = st.transactions.get_mut(&id).ok_or_else(|| unknown_txn(id))?;
            if !txn.open {
                return Err(closed_txn(id));
            }
            if !txn.has_sub {
                return Err(CacheError::BadValue(format!(
                    "transaction {} has no sub-transaction",
                    id.0
                )));
            }
            (std::mem::take(&mut txn.blocks), std::mem::take(&mut txn.main_blocks))
        };

        let new_id = TransactionId(st.next_transaction);
        st.next_transaction += 1;
        let mut new_txn = Transaction::new();

        let mut main_pending = BTreeSet::new();
        for &block in &members {
            let Some(entry) = st.sieve.peek_mut(block_key(block)) else {
                continue;
            };
            let bd = &mut entry.payload;
            let pre_sub = main_blocks.contains(&block);
            let sub_modified = !pre_sub || bd.parent.is_some();

            if !sub_modified {
                // Main-only: behaves as in end_transaction.
                bd.txn = None;
                bd.prev_txn = Some(id);
                bd.original = None;
                bd.discard_on_abort = false;
                main_pending.insert(block);
                continue;
            }

            if pre_sub {
                // Shared: the sub-start snapshot is what the closing
                // transaction commits; the live bytes belong to the new
                // transaction.
                bd.original = bd.parent.take();
                bd.prev_txn = Some(id);
                main_pending.insert(block);
            } else {
                bd.parent = None;
            }
            bd.txn = Some(new_id);
            new_txn.blocks.insert(block);
        }

        let new_block_count = new_txn.blocks.len();
        st.transactions.insert(new_id, new_txn);
        {
            let txn = st
                .transactions
                .get_mut(&id)
                .unwrap_or_else(|| unreachable!("transaction checked above"));
            txn.open = false;
            txn.has_sub = false;
            txn.pending = main_pending;
        }
        queue_event(st, id, TransactionEvent::Ended);
        resolve_if_complete(st, id);
        drop(state);

        tracing::debug!(
            target: "bcache::txn",
            txn = id.0,
            new_txn = new_id.0,
            blocks = new_block_count,
            "sub-transaction detached"
        );
        self.inner.flush_notifications();
        self.inner.wake_notifier();
        Ok(new_id)
    }

    /// Subscribe `hook` to `events` of transaction `id`. With `once`, the
    /// listener is removed after its first matching event.
    pub fn add_transaction_listener(
        &self,
        id: TransactionId,
        events: EventMask,
        once: bool,
        hook: TransactionHook,
    ) -> Result<ListenerId> {
        let mut state = self.inner.state.lock();
        let listener_id = ListenerId(state.next_listener);
        state.next_listener += 1;
        let txn = state.transactions.get_mut(&id).ok_or_else(|| unknown_txn(id))?;
        txn.listeners.push(Listener {
            id: listener_id,
            mask: events,
            hook,
            once,
        });
        Ok(listener_id)
    }

    pub fn remove_transaction_listener(
        &self,
        id: TransactionId,
        listener: ListenerId,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        let txn = state.transactions.get_mut(&id).ok_or_else(|| unknown_txn(id))?;
        let before = txn.listeners.len();
        txn.listeners.retain(|l| l.id != listener);
        if txn.listeners.len() == before {
            return Err(CacheError::NotFound(format!(
                "listener {} on transaction {}",
                listener.0, id.0
            )));
        }
        Ok(())
    }

    /// Number of member blocks (pending blocks, once ended).
    pub fn blocks_in_transaction(&self, id: TransactionId) -> Result<usize> {
        let state = self.inner.state.lock();
        let txn = state.transactions.get(&id).ok_or_else(|| unknown_txn(id))?;
        Ok(if txn.open {
            txn.blocks.len()
        } else {
            txn.pending.len()
        })
    }

    pub fn has_block_in_transaction(&self, id: TransactionId, block: BlockNumber) -> Result<bool> {
        let state = self.inner.state.lock();
        let txn = state.transactions.get(&id).ok_or_else(|| unknown_txn(id))?;
        Ok(if txn.open {
            txn.blocks.contains(&block)
        } else {
            txn.pending.contains(&block)
        })
    }

    /// Snapshot of the transaction's member blocks, in ascending order.
    pub fn transaction_blocks(&self, id: TransactionId) -> Result<Vec<BlockNumber>> {
        let state = self.inner.state.lock();
        let txn = state.transactions.get(&id).ok_or_else(|| unknown_txn(id))?;
        let set = if txn.open { &txn.blocks } else { &txn.pending };
        Ok(set.iter().copied().collect())
    }

    /// Synchronously flush members of `id` that still carry an older
    /// previous transaction, waiting out writes already in flight.
    fn settle_previous(&self, id: TransactionId) -> Result<()> {
        loop {
            let conflicts: BTreeSet<BlockNumber> = {
                let mut state = self.inner.state.lock();
                let st = &mut *state;
                let txn = st.transactions.get(&id).ok_or_else(|| unknown_txn(id))?;
                if !txn.open {
                    return Err(closed_txn(id));
                }
                let mut conflicts = BTreeSet::new();
                let mut any_in_flight = false;
                for &block in &txn.blocks {
                    if let Some(entry) = st.sieve.peek_mut(block_key(block)) {
                        if entry.payload.busy_writing {
                            // Any in-flight write on a member must finish
                            // before the block can be re-linked.
                            entry.payload.write_waiters = true;
                            any_in_flight = true;
                        } else if entry.payload.prev_txn.is_some() {
                            conflicts.insert(block);
                        }
                    }
                }
                if conflicts.is_empty() {
                    if !any_in_flight {
                        return Ok(());
                    }
                    self.inner.write_done.wait(&mut state);
                    continue;
                }
                conflicts
            };

            tracing::debug!(
                target: "bcache::txn",
                txn = id.0,
                blocks = conflicts.len(),
                "flushing previous transactions before re-link"
            );
            let outcome = self
                .inner
                .write_back_where(usize::MAX, move |block, _| conflicts.contains(&block));
            if let Some(err) = outcome.first_error {
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockCache, BlockDevice, MemBlockDevice};
    use bcache_types::BlockSize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn new_cache(blocks: u64) -> (BlockCache, Arc<MemBlockDevice>) {
        let bs = BlockSize::new(512).expect("block size");
        let device = Arc::new(MemBlockDevice::new(bs, blocks));
        let cache = BlockCache::new(Arc::clone(&device) as Arc<dyn crate::BlockDevice>, 64 * 512, false)
            .expect("cache");
        (cache, device)
    }

    fn fill(cache: &BlockCache, block: BlockNumber, txn: TransactionId, byte: u8) {
        let guard = cache.get_writable(block, Some(txn)).expect("writable");
        guard.data().write().fill(byte);
    }

    #[test]
    fn open_transaction_blocks_do_not_write_back() {
        let (cache, device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        fill(&cache, BlockNumber(1), txn, 0x11);

        cache.sync().expect("sync");
        assert_eq!(
            device.read_block(BlockNumber(1)).expect("read"),
            vec![0_u8; 512],
            "open-transaction block must not reach the device"
        );
        assert_eq!(cache.dirty_count(), 1);

        cache.end_transaction(txn, None).expect("end");
        cache.sync().expect("sync after end");
        assert_eq!(
            device.read_block(BlockNumber(1)).expect("read"),
            vec![0x11_u8; 512]
        );
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn abort_restores_pre_transaction_bytes() {
        let (cache, device) = new_cache(8);
        let seed = vec![0x42_u8; 512];
        device
            .write_blocks(BlockNumber(2), &[seed.as_slice()])
            .expect("seed");

        let txn = cache.start_transaction().expect("start");
        fill(&cache, BlockNumber(2), txn, 0x99);
        cache.abort_transaction(txn).expect("abort");

        let block = cache.get(BlockNumber(2)).expect("get");
        assert_eq!(&*block.data().read(), &seed);
        assert_eq!(cache.dirty_count(), 0);
        drop(block);

        cache.sync().expect("sync");
        assert_eq!(device.read_block(BlockNumber(2)).expect("read"), seed);
    }

    #[test]
    fn abort_drops_blocks_created_in_the_transaction() {
        let (cache, _device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        {
            let guard = cache.get_empty(BlockNumber(5), Some(txn)).expect("empty");
            guard.data().write().fill(0x77);
        }
        cache.abort_transaction(txn).expect("abort");

        let state = cache.inner.state.lock();
        assert!(!state.sieve.contains(crate::block_key(BlockNumber(5))));
    }

    #[test]
    fn abort_with_a_pinned_created_block_reloads_from_the_device() {
        let (cache, device) = new_cache(8);
        let payload = vec![0x42_u8; 512];
        device
            .write_blocks(BlockNumber(2), &[payload.as_slice()])
            .expect("seed device");

        let txn = cache.start_transaction().expect("start");
        let guard = cache.get_empty(BlockNumber(2), Some(txn)).expect("empty");
        cache.abort_transaction(txn).expect("abort");

        // The pinned entry's bytes never came from the device; it must be
        // dropped once the guard lets go, not kept as clean content.
        drop(guard);
        let block = cache.get(BlockNumber(2)).expect("get");
        assert_eq!(&*block.data().read(), &payload);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn block_in_open_transaction_rejects_other_owners() {
        let (cache, _device) = new_cache(8);
        let t1 = cache.start_transaction().expect("t1");
        let t2 = cache.start_transaction().expect("t2");
        fill(&cache, BlockNumber(3), t1, 1);

        assert!(matches!(
            cache.get_writable(BlockNumber(3), Some(t2)),
            Err(CacheError::Busy(_))
        ));
        assert!(matches!(
            cache.get_writable(BlockNumber(3), None),
            Err(CacheError::Busy(_))
        ));
        // Reads stay possible.
        let block = cache.get(BlockNumber(3)).expect("get");
        assert_eq!(&*block.data().read(), &vec![1_u8; 512]);
    }

    #[test]
    fn unknown_and_closed_transactions_are_bad_values() {
        let (cache, _device) = new_cache(8);
        assert!(matches!(
            cache.end_transaction(TransactionId(99), None),
            Err(CacheError::BadValue(_))
        ));
        let txn = cache.start_transaction().expect("start");
        cache.end_transaction(txn, None).expect("end");
        assert!(matches!(
            cache.abort_transaction(txn),
            Err(CacheError::BadValue(_))
        ));
    }

    #[test]
    fn events_fire_in_order_outside_the_lock() {
        let (cache, _device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        fill(&cache, BlockNumber(0), txn, 0xAA);

        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        cache
            .add_transaction_listener(
                txn,
                EventMask::ENDED | EventMask::WRITTEN,
                false,
                Arc::new(move |id, event| {
                    sink.lock().expect("sink").push((id, event));
                }),
            )
            .expect("listener");

        cache.end_transaction(txn, None).expect("end");
        cache.sync().expect("sync");

        let seen = events.lock().expect("events");
        assert_eq!(
            seen.as_slice(),
            &[
                (txn, TransactionEvent::Ended),
                (txn, TransactionEvent::Written)
            ]
        );
    }

    #[test]
    fn written_fires_for_empty_transaction_at_end() {
        let (cache, _device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        let written = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&written);
        cache
            .end_transaction(
                txn,
                Some((
                    EventMask::WRITTEN,
                    Arc::new(move |_, event| {
                        assert_eq!(event, TransactionEvent::Written);
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )),
            )
            .expect("end");
        assert_eq!(written.load(Ordering::SeqCst), 1);
        // The transaction is gone.
        assert!(matches!(
            cache.blocks_in_transaction(txn),
            Err(CacheError::BadValue(_))
        ));
    }

    #[test]
    fn once_listener_fires_exactly_once() {
        let (cache, _device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        fill(&cache, BlockNumber(0), txn, 1);

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        cache
            .add_transaction_listener(
                txn,
                EventMask::ALL,
                true,
                Arc::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("listener");

        cache.end_transaction(txn, None).expect("end");
        cache.sync().expect("sync");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_removal() {
        let (cache, _device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let listener = cache
            .add_transaction_listener(
                txn,
                EventMask::ALL,
                false,
                Arc::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("listener");
        cache
            .remove_transaction_listener(txn, listener)
            .expect("remove");
        assert!(matches!(
            cache.remove_transaction_listener(txn, listener),
            Err(CacheError::NotFound(_))
        ));
        cache.end_transaction(txn, None).expect("end");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn new_transaction_reuses_ended_blocks_with_snapshots() {
        let (cache, device) = new_cache(8);
        let t1 = cache.start_transaction().expect("t1");
        fill(&cache, BlockNumber(4), t1, 0x01);
        cache.end_transaction(t1, None).expect("end t1");

        // T2 modifies the same block before T1's write-back ran.
        let t2 = cache.start_transaction().expect("t2");
        fill(&cache, BlockNumber(4), t2, 0x02);

        cache.sync().expect("sync");
        // T1's committed bytes reached the device; T2's stay cached.
        assert_eq!(
            device.read_block(BlockNumber(4)).expect("read"),
            vec![0x01_u8; 512]
        );
        assert_eq!(cache.dirty_count(), 1);
        assert!(cache
            .has_block_in_transaction(t2, BlockNumber(4))
            .expect("membership"));
        // T1 resolved once its image was durable.
        assert!(matches!(
            cache.blocks_in_transaction(t1),
            Err(CacheError::BadValue(_))
        ));

        cache.end_transaction(t2, None).expect("end t2");
        cache.sync().expect("sync 2");
        assert_eq!(
            device.read_block(BlockNumber(4)).expect("read"),
            vec![0x02_u8; 512]
        );
    }

    #[test]
    fn ending_over_an_unwritten_previous_flushes_it_first() {
        let (cache, device) = new_cache(8);
        let t1 = cache.start_transaction().expect("t1");
        fill(&cache, BlockNumber(1), t1, 0x10);
        cache.end_transaction(t1, None).expect("end t1");

        let t2 = cache.start_transaction().expect("t2");
        fill(&cache, BlockNumber(1), t2, 0x20);
        // No sync in between: ending T2 must push T1's image out itself.
        cache.end_transaction(t2, None).expect("end t2");

        assert_eq!(
            device.read_block(BlockNumber(1)).expect("read"),
            vec![0x10_u8; 512]
        );
        cache.sync().expect("sync");
        assert_eq!(
            device.read_block(BlockNumber(1)).expect("read"),
            vec![0x20_u8; 512]
        );
    }

    #[test]
    fn sub_transaction_abort_reverts_to_sub_start() {
        let (cache, _device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        fill(&cache, BlockNumber(0), txn, 0x0A);
        cache.start_sub_transaction(txn).expect("sub");

        // Pre-sub member modified during the sub, plus a new member.
        fill(&cache, BlockNumber(0), txn, 0x0B);
        fill(&cache, BlockNumber(1), txn, 0x0C);

        cache.abort_sub_transaction(txn).expect("abort sub");

        let b0 = cache.get(BlockNumber(0)).expect("get 0");
        assert_eq!(&*b0.data().read(), &vec![0x0A_u8; 512]);
        assert!(!cache
            .has_block_in_transaction(txn, BlockNumber(1))
            .expect("membership"));
        assert_eq!(cache.blocks_in_transaction(txn).expect("count"), 1);
    }

    #[test]
    fn sub_transaction_requires_one_level() {
        let (cache, _device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        assert!(matches!(
            cache.abort_sub_transaction(txn),
            Err(CacheError::BadValue(_))
        ));
        cache.start_sub_transaction(txn).expect("sub");
        assert!(matches!(
            cache.start_sub_transaction(txn),
            Err(CacheError::BadValue(_))
        ));
    }

    #[test]
    fn detach_splits_shared_and_sub_only_blocks() {
        let (cache, device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        fill(&cache, BlockNumber(0), txn, 0xA0); // main only
        fill(&cache, BlockNumber(1), txn, 0xB0); // shared
        cache.start_sub_transaction(txn).expect("sub");
        fill(&cache, BlockNumber(1), txn, 0xB1);
        fill(&cache, BlockNumber(2), txn, 0xC1); // sub only

        let detached = cache.detach_sub_transaction(txn).expect("detach");

        // The closed main transaction owns blocks 0 and 1 as pending.
        assert_eq!(cache.blocks_in_transaction(txn).expect("main count"), 2);
        // The new open transaction owns the sub-modified blocks.
        let new_blocks = cache.transaction_blocks(detached).expect("new blocks");
        assert_eq!(new_blocks, vec![BlockNumber(1), BlockNumber(2)]);

        cache.sync().expect("sync");
        // The shared block's device image is the sub-start snapshot.
        assert_eq!(
            device.read_block(BlockNumber(0)).expect("read"),
            vec![0xA0_u8; 512]
        );
        assert_eq!(
            device.read_block(BlockNumber(1)).expect("read"),
            vec![0xB0_u8; 512]
        );
        assert_eq!(
            device.read_block(BlockNumber(2)).expect("read"),
            vec![0_u8; 512],
            "sub-only block stays with the open transaction"
        );

        cache.end_transaction(detached, None).expect("end detached");
        cache.sync().expect("sync 2");
        assert_eq!(
            device.read_block(BlockNumber(1)).expect("read"),
            vec![0xB1_u8; 512]
        );
        assert_eq!(
            device.read_block(BlockNumber(2)).expect("read"),
            vec![0xC1_u8; 512]
        );
    }

    #[test]
    fn transaction_introspection() {
        let (cache, _device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        fill(&cache, BlockNumber(6), txn, 1);
        fill(&cache, BlockNumber(2), txn, 1);

        assert_eq!(cache.blocks_in_transaction(txn).expect("count"), 2);
        assert!(cache
            .has_block_in_transaction(txn, BlockNumber(6))
            .expect("has"));
        assert!(!cache
            .has_block_in_transaction(txn, BlockNumber(3))
            .expect("has not"));
        assert_eq!(
            cache.transaction_blocks(txn).expect("blocks"),
            vec![BlockNumber(2), BlockNumber(6)]
        );
    }

    #[test]
    fn discarding_a_pending_block_resolves_its_transaction() {
        let (cache, device) = new_cache(8);
        let txn = cache.start_transaction().expect("start");
        fill(&cache, BlockNumber(3), txn, 0xEE);
        cache.end_transaction(txn, None).expect("end");

        cache.discard(BlockNumber(3), 1).expect("discard");
        assert!(matches!(
            cache.blocks_in_transaction(txn),
            Err(CacheError::BadValue(_))
        ));
        cache.sync().expect("sync");
        assert_eq!(
            device.read_block(BlockNumber(3)).expect("read"),
            vec![0_u8; 512],
            "discarded block never reached the device"
        );
    }
}
