//! Write-back engine: candidate selection, run coalescing, submission.
//!
//! Candidates are picked under the cache lock and marked `busy_writing`;
//! the device I/O itself runs with the lock released, against `Arc`
//! clones of the buffers captured at selection time. Completion re-takes
//! the lock and clears the dirty flag only when the written buffer is
//! still the block's live buffer and no open transaction holds it.

use crate::{block_key, transaction, BlockData, Buffer, CacheInner, CacheState};
use bcache_error::{CacheError, Result};
use bcache_sieve::Entry;
use bcache_types::BlockNumber;
use std::sync::Arc;
use std::time::Instant;

/// Largest number of blocks submitted as one scatter-write.
const MAX_RUN_BLOCKS: usize = 64;

pub(crate) struct WriteOutcome {
    pub written: usize,
    pub first_error: Option<CacheError>,
}

struct Candidate {
    block: BlockNumber,
    /// Buffer captured at selection; for a previous-transaction block this
    /// is its frozen pre-modification snapshot.
    image: Buffer,
}

fn collect_candidates<F>(state: &mut CacheState, limit: usize, pred: &F) -> Vec<Candidate>
where
    F: Fn(BlockNumber, &Entry<BlockData>) -> bool,
{
    let mut out = Vec::new();
    for key in state.sieve.keys_oldest_first() {
        if out.len() >= limit {
            break;
        }
        let Some(entry) = state.sieve.peek_mut(key) else {
            continue;
        };
        if !entry.is_dirty()
            || entry.payload.busy_writing
            || entry.payload.busy_reading
            || (entry.payload.prev_txn.is_none() && entry.payload.txn.is_some())
        {
            continue;
        }
        let block = BlockNumber(key.id.0);
        if !pred(block, &*entry) {
            continue;
        }
        let bd = &mut entry.payload;
        bd.busy_writing = true;
        let image = match (&bd.prev_txn, &bd.original) {
            (Some(_), Some(original)) => Arc::clone(original),
            _ => Arc::clone(&bd.data),
        };
        out.push(Candidate { block, image });
    }
    out
}

impl CacheInner {
    /// Write back up to `limit` eligible dirty blocks matching `pred`.
    /// Failed runs are logged and left dirty; the first error is returned
    /// in the outcome.
    pub(crate) fn write_back_where<F>(&self, limit: usize, pred: F) -> WriteOutcome
    where
        F: Fn(BlockNumber, &Entry<BlockData>) -> bool,
    {
        let mut state = self.state.lock();
        let candidates = collect_candidates(&mut state, limit, &pred);
        drop(state);
        self.submit(candidates)
    }

    /// Like [`write_back_where`] over all blocks, but gives up instead of
    /// blocking when the cache lock is contended. Used by the daemon.
    pub(crate) fn try_write_back(&self, limit: usize) -> Option<WriteOutcome> {
        let mut state = self.state.try_lock()?;
        let candidates = collect_candidates(&mut state, limit, &|_, _| true);
        drop(state);
        Some(self.submit(candidates))
    }

    fn submit(&self, mut candidates: Vec<Candidate>) -> WriteOutcome {
        let mut outcome = WriteOutcome {
            written: 0,
            first_error: None,
        };
        if candidates.is_empty() {
            return outcome;
        }
        candidates.sort_by_key(|c| c.block);

        let mut start = 0;
        while start < candidates.len() {
            let mut end = start + 1;
            while end < candidates.len()
                && end - start < MAX_RUN_BLOCKS
                && candidates[end].block.0 == candidates[end - 1].block.0 + 1
            {
                end += 1;
            }
            let run = &candidates[start..end];
            let first = run[0].block;

            let result = {
                let guards: Vec<_> = run.iter().map(|c| c.image.read()).collect();
                let buffers: Vec<&[u8]> = guards.iter().map(|g| g.as_slice()).collect();
                self.device.write_blocks(first, &buffers)
            };

            let success = result.is_ok();
            if let Err(err) = result {
                tracing::error!(
                    target: "bcache::writer",
                    first = first.0,
                    blocks = run.len(),
                    %err,
                    "write-back run failed; blocks stay dirty"
                );
                if outcome.first_error.is_none() {
                    outcome.first_error = Some(err);
                }
            } else {
                tracing::trace!(
                    target: "bcache::writer",
                    first = first.0,
                    blocks = run.len(),
                    "write-back run completed"
                );
                outcome.written += run.len();
            }

            let mut state = self.state.lock();
            for candidate in run {
                self.complete_write(&mut state, candidate, success);
            }
            if success {
                state.last_write_activity = Instant::now();
                state.idle_notified = false;
            }
            drop(state);

            start = end;
        }

        // Transactions resolved by these writes get their events on the
        // writing thread.
        self.flush_notifications();
        outcome
    }

    fn complete_write(&self, state: &mut CacheState, candidate: &Candidate, success: bool) {
        let mut resolved = None;
        if let Some(entry) = state.sieve.peek_mut(block_key(candidate.block)) {
            let still_live = Arc::ptr_eq(&candidate.image, &entry.payload.data);
            let bd = &mut entry.payload;
            bd.busy_writing = false;
            if bd.write_waiters {
                bd.write_waiters = false;
                self.write_done.notify_all();
            }
            if success {
                let in_txn = bd.txn.is_some();
                if !in_txn {
                    bd.original = None;
                }
                resolved = bd.prev_txn.take();
                if !in_txn && still_live {
                    entry.set_dirty(false);
                }
            }
        }
        if let Some(prev) = resolved {
            transaction::note_block_written(state, prev, candidate.block);
        }
    }

    /// Repeatedly flush and wait until no block matching `pred` is dirty
    /// outside an open transaction, then sync the device.
    pub(crate) fn sync_where<F>(&self, pred: F) -> Result<()>
    where
        F: Fn(BlockNumber) -> bool + Copy,
    {
        loop {
            let outcome = self.write_back_where(usize::MAX, |block, _| pred(block));
            if let Some(err) = outcome.first_error {
                return Err(err);
            }

            let mut state = self.state.lock();
            let mut in_flight = false;
            let mut dirty_left = false;
            for key in state.sieve.keys_oldest_first() {
                let block = BlockNumber(key.id.0);
                if !pred(block) {
                    continue;
                }
                let Some(entry) = state.sieve.peek_mut(key) else {
                    continue;
                };
                if entry.payload.busy_writing {
                    entry.payload.write_waiters = true;
                    in_flight = true;
                } else if entry.is_dirty()
                    && (entry.payload.prev_txn.is_some() || entry.payload.txn.is_none())
                {
                    dirty_left = true;
                }
            }
            if in_flight {
                self.write_done.wait(&mut state);
                continue;
            }
            if !dirty_left {
                break;
            }
            // Re-dirtied while unlocked; go around again.
        }
        self.device.sync()
    }
}
