#![forbid(unsafe_code)]
//! Reference-counted unified cache with SIEVE-2 second-chance eviction.
//!
//! The engine keeps every entry in two structures at once:
//!
//! - a hash index `(kind, id) → arena slot` for O(1) lookup, and
//! - a single circular eviction list in insertion order, threaded through
//!   arena-relative slot indices (no raw pointers).
//!
//! Eviction advances a persistent hand pointer around the list. At each
//! position: referenced entries are skipped, a positive visit counter is
//! decremented (the second chance), and an unreferenced entry with zero
//! visits becomes the victim. A hit resets `visits` to 2 rather than
//! incrementing it, so twice-accessed entries survive two extra scan passes.
//! There is no per-access list reordering; a hit costs one hash probe.
//!
//! [`SieveCache`] is the single-threaded core (`&mut self` everywhere).
//! [`UnifiedCache`] wraps it in a mutex and hands out borrow guards whose
//! destructor releases the reference count.

use bcache_error::{CacheError, Result};
use bcache_types::{CacheKind, EntryId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

mod unified;

pub use unified::{EntryRef, UnifiedCache};

/// Visit counter value assigned on access.
const HOT_VISITS: u8 = 2;

/// Composite key of one cache entry. An id is unique within its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub id: EntryId,
    pub kind: CacheKind,
}

impl EntryKey {
    #[must_use]
    pub fn new(id: EntryId, kind: CacheKind) -> Self {
        Self { id, kind }
    }
}

/// Per-cache counters. Monotonic over the cache's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
}

/// An eviction pass completed a full revolution without making progress:
/// every entry is either referenced or refused by the caller's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoVictim;

/// One cached unit: identity, size, dirty flag, reference count, visit
/// counter, eviction-list links, and a caller-defined payload.
#[derive(Debug)]
pub struct Entry<T> {
    key: EntryKey,
    size: usize,
    dirty: bool,
    ref_count: u32,
    visits: u8,
    last_used: Instant,
    prev: u32,
    next: u32,
    pub payload: T,
}

impl<T> Entry<T> {
    #[must_use]
    pub fn key(&self) -> EntryKey {
        self.key
    }

    #[must_use]
    pub fn id(&self) -> EntryId {
        self.key.id
    }

    #[must_use]
    pub fn kind(&self) -> CacheKind {
        self.key.kind
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    #[must_use]
    pub fn visits(&self) -> u8 {
        self.visits
    }

    /// Instant of the last access, used for minimum-age pruning.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Take an additional reference. The entry cannot be evicted or
    /// discarded until a matching release.
    pub fn retain(&mut self) {
        self.ref_count += 1;
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied(Entry<T>),
    Free { next_free: Option<u32> },
}

/// The SIEVE-2 cache engine.
///
/// Byte accounting invariant: `current_bytes()` equals the sum of the sizes
/// of all live entries, at every return from a public method.
#[derive(Debug)]
pub struct SieveCache<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    index: HashMap<EntryKey, u32>,
    /// Oldest entry; the list tail is `entry(head).prev`.
    head: Option<u32>,
    /// Persistent eviction cursor. `None` iff the list is empty or the hand
    /// has not started scanning yet.
    hand: Option<u32>,
    capacity_bytes: usize,
    current_bytes: usize,
    stats: CacheStats,
}

impl<T> SieveCache<T> {
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            index: HashMap::new(),
            head: None,
            hand: None,
            capacity_bytes,
            current_bytes: 0,
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[must_use]
    pub fn contains(&self, key: EntryKey) -> bool {
        self.index.contains_key(&key)
    }

    /// Insert a new entry at the eviction list's tail with `visits = 0`.
    ///
    /// Does not evict; callers run [`make_room`](Self::make_room) first when
    /// they enforce the byte budget.
    pub fn insert(&mut self, key: EntryKey, size: usize, payload: T) -> Result<&mut Entry<T>> {
        if self.index.contains_key(&key) {
            return Err(CacheError::BadValue(format!(
                "entry {:?}/{} is already cached",
                key.kind, key.id.0
            )));
        }

        let entry = Entry {
            key,
            size,
            dirty: false,
            ref_count: 0,
            visits: 0,
            last_used: Instant::now(),
            prev: 0,
            next: 0,
            payload,
        };
        let idx = self.alloc_slot(entry);
        self.link_tail(idx);
        self.index.insert(key, idx);
        self.current_bytes += size;
        self.stats.insertions += 1;

        tracing::trace!(
            target: "bcache::sieve",
            id = key.id.0,
            kind = ?key.kind,
            size,
            current_bytes = self.current_bytes,
            "insert"
        );

        Ok(self.entry_mut(idx))
    }

    /// Look up an entry, counting a hit or miss and resetting its visit
    /// counter to hot on a hit.
    pub fn get(&mut self, key: EntryKey) -> Option<&mut Entry<T>> {
        match self.index.get(&key).copied() {
            Some(idx) => {
                self.stats.hits += 1;
                let entry = self.entry_mut(idx);
                entry.visits = HOT_VISITS;
                entry.last_used = Instant::now();
                Some(entry)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Look up without touching visit counters or statistics.
    #[must_use]
    pub fn peek(&self, key: EntryKey) -> Option<&Entry<T>> {
        self.index.get(&key).map(|&idx| self.entry(idx))
    }

    /// Mutable lookup without touching visit counters or statistics.
    ///
    /// Used by callers that maintain entry metadata (dirty flags, payload
    /// state) without this counting as a cache access.
    pub fn peek_mut(&mut self, key: EntryKey) -> Option<&mut Entry<T>> {
        self.index.get(&key).copied().map(|idx| self.entry_mut(idx))
    }

    /// Drop one reference. Rejects a release that would take the count
    /// negative.
    pub fn release(&mut self, key: EntryKey) -> Result<u32> {
        let idx = self.index.get(&key).copied().ok_or_else(|| {
            CacheError::NotFound(format!("entry {:?}/{}", key.kind, key.id.0))
        })?;
        let entry = self.entry_mut(idx);
        if entry.ref_count == 0 {
            return Err(CacheError::BadValue(format!(
                "release of unreferenced entry {:?}/{}",
                key.kind, key.id.0
            )));
        }
        entry.ref_count -= 1;
        Ok(entry.ref_count)
    }

    /// Remove an entry unconditionally, returning its payload.
    ///
    /// Fails with `Busy` while references exist and `NotFound` for unknown
    /// ids (repeatably: a second discard of the same id is `NotFound` again).
    pub fn discard(&mut self, key: EntryKey) -> Result<T> {
        let idx = self.index.get(&key).copied().ok_or_else(|| {
            CacheError::NotFound(format!("entry {:?}/{}", key.kind, key.id.0))
        })?;
        if self.entry(idx).ref_count > 0 {
            return Err(CacheError::Busy(format!(
                "entry {:?}/{} has {} references",
                key.kind,
                key.id.0,
                self.entry(idx).ref_count
            )));
        }

        self.unlink(idx);
        self.index.remove(&key);
        let entry = self.free_slot(idx);
        self.current_bytes -= entry.size;
        Ok(entry.payload)
    }

    /// Adjust an entry's size, fixing the byte accounting.
    pub fn resize(&mut self, key: EntryKey, new_size: usize) -> Result<()> {
        let idx = self.index.get(&key).copied().ok_or_else(|| {
            CacheError::NotFound(format!("entry {:?}/{}", key.kind, key.id.0))
        })?;
        let entry = self.entry_mut(idx);
        let old = entry.size;
        entry.size = new_size;
        self.current_bytes = self.current_bytes - old + new_size;
        Ok(())
    }

    /// Run one SIEVE-2 eviction scan and remove the chosen victim.
    ///
    /// `can_evict` is consulted only for unreferenced entries with zero
    /// visits; it is where callers veto dirty-and-unwritable or mid-I/O
    /// entries. Returns `None` after a full revolution without a decrement
    /// or an eviction.
    pub fn evict_one<F>(&mut self, mut can_evict: F) -> Option<(EntryKey, T)>
    where
        F: FnMut(&Entry<T>) -> bool,
    {
        let mut pos = self.hand.or(self.head)?;
        let len = self.index.len();
        let mut idle_steps = 0_usize;

        loop {
            enum Step {
                Skip,
                Decrement,
                Victim,
            }

            let step = {
                let entry = self.entry(pos);
                if entry.ref_count > 0 {
                    Step::Skip
                } else if entry.visits > 0 {
                    Step::Decrement
                } else if can_evict(entry) {
                    Step::Victim
                } else {
                    Step::Skip
                }
            };

            match step {
                Step::Victim => {
                    // Leave the hand on the victim's successor.
                    self.hand = Some(pos);
                    self.unlink(pos);
                    let entry = self.free_slot(pos);
                    self.index.remove(&entry.key);
                    self.current_bytes -= entry.size;
                    self.stats.evictions += 1;

                    tracing::debug!(
                        target: "bcache::sieve",
                        id = entry.key.id.0,
                        kind = ?entry.key.kind,
                        size = entry.size,
                        current_bytes = self.current_bytes,
                        "evict"
                    );

                    return Some((entry.key, entry.payload));
                }
                Step::Decrement => {
                    let entry = self.entry_mut(pos);
                    entry.visits -= 1;
                    idle_steps = 0;
                    pos = entry.next;
                }
                Step::Skip => {
                    idle_steps += 1;
                    if idle_steps >= len {
                        self.hand = Some(pos);
                        return None;
                    }
                    pos = self.entry(pos).next;
                }
            }
        }
    }

    /// Evict until `needed` more bytes fit in the budget.
    ///
    /// Returns the evicted entries, or `NoVictim` when a revolution of the
    /// hand cannot free enough space.
    pub fn make_room<F>(
        &mut self,
        needed: usize,
        mut can_evict: F,
    ) -> std::result::Result<Vec<(EntryKey, T)>, NoVictim>
    where
        F: FnMut(&Entry<T>) -> bool,
    {
        let mut evicted = Vec::new();
        while self.current_bytes.saturating_add(needed) > self.capacity_bytes {
            match self.evict_one(&mut can_evict) {
                Some(victim) => evicted.push(victim),
                None => return Err(NoVictim),
            }
        }
        Ok(evicted)
    }

    /// Entry keys in insertion order, oldest first. A snapshot; the caller
    /// may mutate the cache while walking it.
    #[must_use]
    pub fn keys_oldest_first(&self) -> Vec<EntryKey> {
        let mut keys = Vec::with_capacity(self.index.len());
        let Some(head) = self.head else {
            return keys;
        };
        let mut pos = head;
        loop {
            let entry = self.entry(pos);
            keys.push(entry.key);
            pos = entry.next;
            if pos == head {
                break;
            }
        }
        keys
    }

    // ── internal ───────────────────────────────────────────────────────

    fn entry(&self, idx: u32) -> &Entry<T> {
        match &self.slots[idx as usize] {
            Slot::Occupied(entry) => entry,
            Slot::Free { .. } => unreachable!("eviction list references a free slot"),
        }
    }

    fn entry_mut(&mut self, idx: u32) -> &mut Entry<T> {
        match &mut self.slots[idx as usize] {
            Slot::Occupied(entry) => entry,
            Slot::Free { .. } => unreachable!("eviction list references a free slot"),
        }
    }

    fn alloc_slot(&mut self, entry: Entry<T>) -> u32 {
        match self.free_head {
            Some(idx) => {
                let next_free = match &self.slots[idx as usize] {
                    Slot::Free { next_free } => *next_free,
                    Slot::Occupied(_) => unreachable!("free list references an occupied slot"),
                };
                self.free_head = next_free;
                self.slots[idx as usize] = Slot::Occupied(entry);
                idx
            }
            None => {
                let idx = u32::try_from(self.slots.len())
                    .unwrap_or_else(|_| panic!("cache arena exceeds u32 slots"));
                self.slots.push(Slot::Occupied(entry));
                idx
            }
        }
    }

    fn free_slot(&mut self, idx: u32) -> Entry<T> {
        let slot = std::mem::replace(
            &mut self.slots[idx as usize],
            Slot::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(idx);
        match slot {
            Slot::Occupied(entry) => entry,
            Slot::Free { .. } => unreachable!("double free of cache slot"),
        }
    }

    fn link_tail(&mut self, idx: u32) {
        match self.head {
            None => {
                let entry = self.entry_mut(idx);
                entry.prev = idx;
                entry.next = idx;
                self.head = Some(idx);
            }
            Some(head) => {
                let tail = self.entry(head).prev;
                {
                    let entry = self.entry_mut(idx);
                    entry.prev = tail;
                    entry.next = head;
                }
                self.entry_mut(tail).next = idx;
                self.entry_mut(head).prev = idx;
            }
        }
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let entry = self.entry(idx);
            (entry.prev, entry.next)
        };
        if next == idx {
            self.head = None;
            self.hand = None;
        } else {
            self.entry_mut(prev).next = next;
            self.entry_mut(next).prev = prev;
            if self.head == Some(idx) {
                self.head = Some(next);
            }
            if self.hand == Some(idx) {
                self.hand = Some(next);
            }
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let mut listed = 0_usize;
        let mut bytes = 0_usize;
        if let Some(head) = self.head {
            let mut pos = head;
            loop {
                let entry = self.entry(pos);
                assert_eq!(
                    self.index.get(&entry.key).copied(),
                    Some(pos),
                    "list entry missing from index"
                );
                assert_eq!(self.entry(entry.next).prev, pos, "broken list link");
                listed += 1;
                bytes += entry.size;
                pos = entry.next;
                if pos == head {
                    break;
                }
            }
        }
        assert_eq!(listed, self.index.len(), "index and list disagree");
        assert_eq!(bytes, self.current_bytes, "byte accounting drifted");
        if let Some(hand) = self.hand {
            assert!(
                matches!(self.slots[hand as usize], Slot::Occupied(_)),
                "hand points at a free slot"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(id: u64) -> EntryKey {
        EntryKey::new(EntryId(id), CacheKind::Block)
    }

    fn cache(capacity: usize) -> SieveCache<u64> {
        SieveCache::new(capacity)
    }

    #[test]
    fn byte_accounting_tracks_inserts_and_discards() {
        let mut c = cache(1000);
        c.insert(key(1), 100, 1).expect("insert");
        c.insert(key(2), 250, 2).expect("insert");
        assert_eq!(c.current_bytes(), 350);
        c.discard(key(1)).expect("discard");
        assert_eq!(c.current_bytes(), 250);
        c.assert_consistent();
    }

    #[test]
    fn insert_of_cached_id_is_rejected() {
        let mut c = cache(1000);
        c.insert(key(1), 10, 1).expect("insert");
        assert!(matches!(
            c.insert(key(1), 10, 1),
            Err(CacheError::BadValue(_))
        ));
        // Same id under the other kind is a distinct entry.
        c.insert(EntryKey::new(EntryId(1), CacheKind::Page), 10, 1)
            .expect("insert page");
        c.assert_consistent();
    }

    #[test]
    fn release_of_unreferenced_entry_is_rejected() {
        let mut c = cache(1000);
        c.insert(key(1), 10, 1).expect("insert");
        c.get(key(1)).expect("hit").retain();
        assert_eq!(c.release(key(1)).expect("release"), 0);
        assert!(matches!(c.release(key(1)), Err(CacheError::BadValue(_))));
    }

    #[test]
    fn discard_of_absent_id_is_not_found_repeatably() {
        let mut c = cache(1000);
        assert!(matches!(c.discard(key(9)), Err(CacheError::NotFound(_))));
        assert!(matches!(c.discard(key(9)), Err(CacheError::NotFound(_))));
    }

    #[test]
    fn discard_of_referenced_entry_is_busy() {
        let mut c = cache(1000);
        c.insert(key(1), 10, 1).expect("insert");
        c.get(key(1)).expect("hit").retain();
        assert!(matches!(c.discard(key(1)), Err(CacheError::Busy(_))));
        c.release(key(1)).expect("release");
        c.discard(key(1)).expect("discard after release");
    }

    #[test]
    fn second_chance_prefers_cold_entries() {
        // Capacity 4 blocks of size 1; insert 1..=4, access 1, insert 5.
        // The victim must be 2 (first unreferenced entry with visits == 0),
        // not the freshly accessed 1.
        let mut c = cache(4);
        for id in 1..=4 {
            c.insert(key(id), 1, id).expect("insert");
        }
        c.get(key(1)).expect("touch 1");

        let evicted = c.make_room(1, |_| true).expect("room");
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, key(2));
        c.insert(key(5), 1, 5).expect("insert 5");
        assert!(c.contains(key(1)));
        c.assert_consistent();
    }

    #[test]
    fn referenced_entries_are_never_evicted() {
        let mut c = cache(2);
        c.insert(key(1), 1, 1).expect("insert");
        c.insert(key(2), 1, 2).expect("insert");
        c.get(key(1)).expect("hit").retain();
        c.get(key(2)).expect("hit").retain();
        assert_eq!(c.evict_one(|_| true), None, "all entries are pinned");
        c.release(key(2)).expect("release");
        // Entry 2 was just accessed, so it takes two decrement passes.
        let (victim, _) = c.evict_one(|_| true).expect("victim");
        assert_eq!(victim, key(2));
        c.assert_consistent();
    }

    #[test]
    fn can_evict_veto_reports_no_victim() {
        let mut c = cache(2);
        c.insert(key(1), 1, 1).expect("insert");
        c.insert(key(2), 1, 2).expect("insert");
        // Dirty-and-unwritable veto on everything.
        assert_eq!(c.evict_one(|_| false), None);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn fresh_entry_survives_one_pass_with_a_colder_candidate() {
        let mut c = cache(3);
        c.insert(key(1), 1, 1).expect("insert");
        c.insert(key(2), 1, 2).expect("insert");
        c.get(key(2)).expect("touch 2");
        c.insert(key(3), 1, 3).expect("insert");

        // Hand starts at 1 (visits 0, cold) and must pick it over the
        // fresh tail entry only because it comes first; now pin 1 so the
        // scan has to choose between hot 2 and fresh 3.
        c.get(key(1)).expect("hit").retain();
        let (victim, _) = c.evict_one(|_| true).expect("victim");
        assert_eq!(victim, key(3), "fresh cold tail entry is chosen before a hot one");
        c.assert_consistent();
    }

    #[test]
    fn hand_survives_unlink_of_its_entry() {
        let mut c = cache(10);
        for id in 1..=3 {
            c.insert(key(id), 1, id).expect("insert");
        }
        // Park the hand on entry 2 by evicting entry 1.
        let (victim, _) = c.evict_one(|_| true).expect("victim");
        assert_eq!(victim, key(1));
        c.discard(key(2)).expect("discard under the hand");
        // The hand moved to 3; the next eviction still works.
        let (victim, _) = c.evict_one(|_| true).expect("victim");
        assert_eq!(victim, key(3));
        assert!(c.is_empty());
        c.assert_consistent();
    }

    #[test]
    fn make_room_frees_enough_bytes() {
        let mut c = cache(100);
        for id in 0..10 {
            c.insert(key(id), 10, id).expect("insert");
        }
        let evicted = c.make_room(35, |_| true).expect("room");
        assert_eq!(evicted.len(), 4);
        assert!(c.current_bytes() + 35 <= c.capacity_bytes());
        c.assert_consistent();
    }

    #[test]
    fn stats_count_hits_misses_evictions() {
        let mut c = cache(2);
        c.insert(key(1), 1, 1).expect("insert");
        assert!(c.get(key(1)).is_some());
        assert!(c.get(key(2)).is_none());
        c.insert(key(2), 1, 2).expect("insert");
        c.make_room(1, |_| true).expect("room");
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.insertions, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn slot_reuse_after_discard() {
        let mut c = cache(1000);
        for round in 0..4 {
            for id in 0..8_u64 {
                c.insert(key(round * 8 + id), 1, id).expect("insert");
            }
            for id in 0..8_u64 {
                c.discard(key(round * 8 + id)).expect("discard");
            }
        }
        // Four rounds of eight entries reuse the same eight slots.
        assert!(c.slots.len() <= 8);
        c.assert_consistent();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u64, usize),
        Get(u64),
        Retain(u64),
        Release(u64),
        Discard(u64),
        Evict,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u64..24, 1_usize..64).prop_map(|(id, size)| Op::Insert(id, size)),
            (0_u64..24).prop_map(Op::Get),
            (0_u64..24).prop_map(Op::Retain),
            (0_u64..24).prop_map(Op::Release),
            (0_u64..24).prop_map(Op::Discard),
            Just(Op::Evict),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn random_ops_preserve_invariants(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let mut c: SieveCache<u64> = SieveCache::new(512);
            let mut refs: HashMap<u64, u32> = HashMap::new();

            for op in ops {
                match op {
                    Op::Insert(id, size) => {
                        let _ = c.insert(key(id), size, id);
                    }
                    Op::Get(id) => {
                        let _ = c.get(key(id));
                    }
                    Op::Retain(id) => {
                        if let Some(entry) = c.peek_mut(key(id)) {
                            entry.retain();
                            *refs.entry(id).or_insert(0) += 1;
                        }
                    }
                    Op::Release(id) => {
                        if refs.get(&id).copied().unwrap_or(0) > 0 {
                            c.release(key(id)).expect("tracked reference");
                            *refs.get_mut(&id).expect("tracked") -= 1;
                        } else {
                            prop_assert!(c.release(key(id)).is_err());
                        }
                    }
                    Op::Discard(id) => {
                        let outcome = c.discard(key(id));
                        if refs.get(&id).copied().unwrap_or(0) > 0 {
                            prop_assert!(matches!(outcome, Err(CacheError::Busy(_))));
                        } else if outcome.is_ok() {
                            refs.remove(&id);
                        }
                    }
                    Op::Evict => {
                        if let Some((victim, _)) = c.evict_one(|_| true) {
                            prop_assert_eq!(
                                refs.get(&victim.id.0).copied().unwrap_or(0),
                                0,
                                "evicted a referenced entry"
                            );
                        }
                    }
                }
                c.assert_consistent();
            }
        }
    }
}
