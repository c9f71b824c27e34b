//! Thread-safe façade over the SIEVE-2 engine.
//!
//! One mutex guards all index/list mutations; entry buffers sit behind their
//! own `Arc<RwLock<Vec<u8>>>` so byte access never holds the cache lock.
//! [`EntryRef`] is the borrow guard: its destructor drops the reference
//! count, at which point the entry becomes eviction-eligible (it is not
//! freed immediately).
//!
//! Loads are coordinated with a per-id marker and a condvar: at most one
//! caller populates a given id, everyone else waits for the load to finish
//! and then hits the fresh entry.

use crate::{CacheStats, EntryKey, SieveCache};
use bcache_error::{CacheError, Result};
use bcache_types::{CacheKind, EntryId};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

type Buffer = Arc<RwLock<Vec<u8>>>;

struct State {
    sieve: SieveCache<Buffer>,
    /// Ids currently being populated by a loader.
    loading: HashSet<EntryKey>,
}

struct Inner {
    state: Mutex<State>,
    load_done: Condvar,
}

/// Generic reference-counted cache of byte buffers with a byte budget.
#[derive(Clone)]
pub struct UnifiedCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for UnifiedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("UnifiedCache")
            .field("entries", &state.sieve.len())
            .field("current_bytes", &state.sieve.current_bytes())
            .field("capacity_bytes", &state.sieve.capacity_bytes())
            .finish_non_exhaustive()
    }
}

impl UnifiedCache {
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    sieve: SieveCache::new(capacity_bytes),
                    loading: HashSet::new(),
                }),
                load_done: Condvar::new(),
            }),
        }
    }

    /// Look up an entry, taking a reference on a hit.
    ///
    /// Blocks while another caller is mid-load for the same id. Returns
    /// `None` on a miss; the caller loads the data and calls
    /// [`put`](Self::put), or uses [`get_or_load`](Self::get_or_load) to do
    /// both with single-loader coordination.
    pub fn get(&self, id: EntryId, kind: CacheKind) -> Option<EntryRef> {
        let key = EntryKey::new(id, kind);
        let mut state = self.inner.state.lock();
        while state.loading.contains(&key) {
            self.inner.load_done.wait(&mut state);
        }
        let entry = state.sieve.get(key)?;
        entry.retain();
        let buf = Arc::clone(&entry.payload);
        Some(EntryRef {
            inner: Arc::clone(&self.inner),
            key,
            buf,
        })
    }

    /// Look up an entry, running `loader` to populate it on a miss.
    ///
    /// At most one concurrent caller runs the loader for a given id; the
    /// rest block and then hit the freshly inserted entry. A loader error is
    /// returned to the loading caller, and waiting callers retry the load
    /// themselves.
    pub fn get_or_load<F>(&self, id: EntryId, kind: CacheKind, loader: F) -> Result<EntryRef>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        let key = EntryKey::new(id, kind);
        let mut state = self.inner.state.lock();
        loop {
            if let Some(entry) = state.sieve.get(key) {
                entry.retain();
                let buf = Arc::clone(&entry.payload);
                return Ok(EntryRef {
                    inner: Arc::clone(&self.inner),
                    key,
                    buf,
                });
            }
            if !state.loading.contains(&key) {
                break;
            }
            self.inner.load_done.wait(&mut state);
        }

        state.loading.insert(key);
        drop(state);

        let loaded = loader();

        let mut state = self.inner.state.lock();
        state.loading.remove(&key);
        self.inner.load_done.notify_all();

        match loaded {
            Ok(bytes) => self.put_locked(state, key, bytes, false),
            Err(err) => Err(err),
        }
    }

    /// Insert a new entry or update an existing one, taking a reference.
    ///
    /// Eviction runs first when the insert would exceed the byte budget;
    /// if no clean, unreferenced victim can be found the insert fails with
    /// `OutOfSpace`.
    pub fn put(&self, id: EntryId, kind: CacheKind, data: Vec<u8>, dirty: bool) -> Result<EntryRef> {
        let key = EntryKey::new(id, kind);
        let state = self.inner.state.lock();
        self.put_locked(state, key, data, dirty)
    }

    fn put_locked(
        &self,
        mut state: MutexGuard<'_, State>,
        key: EntryKey,
        data: Vec<u8>,
        dirty: bool,
    ) -> Result<EntryRef> {
        let size = data.len();

        if state.sieve.contains(key) {
            state.sieve.resize(key, size)?;
            let entry = state
                .sieve
                .get(key)
                .unwrap_or_else(|| unreachable!("entry vanished under the lock"));
            // Updates replace the buffer so an in-flight reader of the old
            // bytes keeps its snapshot.
            entry.payload = Arc::new(RwLock::new(data));
            if dirty {
                entry.set_dirty(true);
            }
            entry.retain();
            let buf = Arc::clone(&entry.payload);
            return Ok(EntryRef {
                inner: Arc::clone(&self.inner),
                key,
                buf,
            });
        }

        state
            .sieve
            .make_room(size, |entry| !entry.is_dirty())
            .map_err(|_| {
                CacheError::OutOfSpace(format!(
                    "cannot free {size} bytes: every candidate is referenced or dirty"
                ))
            })?;

        let entry = state
            .sieve
            .insert(key, size, Arc::new(RwLock::new(data)))?;
        entry.set_dirty(dirty);
        entry.retain();
        let buf = Arc::clone(&entry.payload);
        Ok(EntryRef {
            inner: Arc::clone(&self.inner),
            key,
            buf,
        })
    }

    /// Mark an entry dirty (or clean after the caller wrote it back).
    /// Marking dirty counts as an access for eviction purposes.
    pub fn set_dirty(&self, entry: &EntryRef, dirty: bool) {
        let mut state = self.inner.state.lock();
        if dirty {
            if let Some(e) = state.sieve.get(entry.key) {
                e.set_dirty(true);
            }
        } else if let Some(e) = state.sieve.peek_mut(entry.key) {
            e.set_dirty(false);
        }
    }

    /// Mark an entry about to be modified: dirty when `mark_dirty`, and an
    /// access either way.
    pub fn make_writable(&self, entry: &EntryRef, mark_dirty: bool) {
        let mut state = self.inner.state.lock();
        if let Some(e) = state.sieve.get(entry.key) {
            if mark_dirty {
                e.set_dirty(true);
            }
        }
    }

    /// Remove an entry unconditionally. `Busy` while references exist,
    /// `NotFound` for unknown ids.
    pub fn discard(&self, id: EntryId, kind: CacheKind) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.sieve.discard(EntryKey::new(id, kind)).map(|_| ())
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.state.lock().sieve.stats()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().sieve.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().sieve.is_empty()
    }

    #[must_use]
    pub fn current_bytes(&self) -> usize {
        self.inner.state.lock().sieve.current_bytes()
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.inner.state.lock().sieve.capacity_bytes()
    }
}

/// Borrow guard for one cache entry.
///
/// The underlying buffer stays alive while any guard exists; dropping the
/// guard releases the reference and makes the entry eviction-eligible.
pub struct EntryRef {
    inner: Arc<Inner>,
    key: EntryKey,
    buf: Buffer,
}

impl EntryRef {
    #[must_use]
    pub fn id(&self) -> EntryId {
        self.key.id
    }

    #[must_use]
    pub fn kind(&self) -> CacheKind {
        self.key.kind
    }

    /// The entry's buffer. Lock it read or write; neither takes the cache
    /// lock. Callers mutating the bytes mark the entry dirty via
    /// [`UnifiedCache::make_writable`] before dropping the guard.
    #[must_use]
    pub fn data(&self) -> &RwLock<Vec<u8>> {
        &self.buf
    }
}

impl fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("id", &self.key.id.0)
            .field("kind", &self.key.kind)
            .finish_non_exhaustive()
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Err(err) = state.sieve.release(self.key) {
            tracing::error!(
                target: "bcache::sieve",
                id = self.key.id.0,
                kind = ?self.key.kind,
                %err,
                "release on guard drop failed"
            );
        }
    }
}
