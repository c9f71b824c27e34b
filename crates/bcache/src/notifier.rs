//! Background notifier/writer daemon.
//!
//! One thread serves every registered cache: it delivers queued
//! transaction events, trickles dirty blocks out in bounded batches, and
//! raises `Idle` once a cache has seen no write activity for the idle
//! interval. Caches are held weakly; dropping the last cache handle
//! unregisters it. Shutdown performs a final full write-back pass.

use crate::{transaction, BlockCache, CacheInner};
use bcache_types::TransactionEvent;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// System memory pressure level, mapped to how aggressively
/// [`Notifier::low_memory`] prunes unreferenced blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryPressure {
    Note,
    Warning,
    Critical,
}

impl MemoryPressure {
    /// Minimum idle age a block must have before this level removes it.
    #[must_use]
    pub fn min_age(self) -> Duration {
        match self {
            Self::Note => Duration::from_secs(120),
            Self::Warning => Duration::from_secs(10),
            Self::Critical => Duration::ZERO,
        }
    }

    fn prune_count(self, cached_blocks: usize) -> usize {
        match self {
            Self::Note => cached_blocks / 4,
            Self::Warning => cached_blocks / 2,
            Self::Critical => cached_blocks,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// A cache with no write activity for this long gets `Idle`.
    pub idle_interval: Duration,
    /// Dirty blocks written per cache per daemon pass.
    pub max_blocks_per_cache: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(2),
            max_blocks_per_cache: 64,
        }
    }
}

struct Registry {
    caches: Vec<Weak<CacheInner>>,
    signalled: bool,
    shutdown: bool,
}

pub(crate) struct NotifierShared {
    registry: Mutex<Registry>,
    wake: Condvar,
    config: NotifierConfig,
}

impl NotifierShared {
    /// Wake the daemon out of its timed wait.
    pub(crate) fn signal(&self) {
        let mut registry = self.registry.lock();
        registry.signalled = true;
        self.wake.notify_one();
    }

    fn live_caches(registry: &mut Registry) -> Vec<Arc<CacheInner>> {
        registry.caches.retain(|weak| weak.strong_count() > 0);
        registry.caches.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Handle to the daemon thread. Dropping it (or calling
/// [`shutdown`](Self::shutdown)) stops the thread after a final flush.
pub struct Notifier {
    shared: Arc<NotifierShared>,
    thread: Option<JoinHandle<()>>,
}

impl Notifier {
    #[must_use]
    pub fn start(config: NotifierConfig) -> Self {
        let shared = Arc::new(NotifierShared {
            registry: Mutex::new(Registry {
                caches: Vec::new(),
                signalled: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
            config,
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("bcache-notifier".to_owned())
            .spawn(move || run(&thread_shared));
        match thread {
            Ok(handle) => {
                tracing::info!(target: "bcache::notifier", "notifier daemon started");
                Self {
                    shared,
                    thread: Some(handle),
                }
            }
            Err(err) => {
                // Without the thread the notifier degrades to a no-op
                // handle; caches still flush synchronously.
                tracing::error!(target: "bcache::notifier", %err, "failed to spawn notifier thread");
                Self {
                    shared,
                    thread: None,
                }
            }
        }
    }

    /// Put `cache` under daemon management. The daemon keeps only a weak
    /// reference. Registering the same cache again is a no-op.
    pub fn register(&self, cache: &BlockCache) {
        let mut registry = self.shared.registry.lock();
        let known = registry.caches.iter().any(|weak| {
            weak.upgrade()
                .is_some_and(|inner| Arc::ptr_eq(&inner, &cache.inner))
        });
        if !known {
            registry.caches.push(Arc::downgrade(&cache.inner));
        }
        drop(registry);
        *cache.inner.waker.lock() = Some(Arc::downgrade(&self.shared));
        tracing::debug!(target: "bcache::notifier", "cache registered with notifier");
    }

    /// React to memory pressure by pruning unreferenced blocks across all
    /// registered caches. Returns the total number of blocks removed.
    pub fn low_memory(&self, pressure: MemoryPressure) -> usize {
        let caches = {
            let mut registry = self.shared.registry.lock();
            NotifierShared::live_caches(&mut registry)
        };
        let min_age = pressure.min_age();
        let mut removed = 0_usize;
        for inner in caches {
            let cache = BlockCache { inner };
            let count = pressure.prune_count(cache.metrics().cached_blocks);
            if count > 0 {
                removed += cache.remove_unused_blocks(count, min_age);
            }
        }
        tracing::info!(
            target: "bcache::notifier",
            ?pressure,
            removed,
            "low memory pass finished"
        );
        removed
    }

    /// Stop the daemon: final write-back pass, then join.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        {
            let mut registry = self.shared.registry.lock();
            registry.shutdown = true;
            self.shared.wake.notify_one();
        }
        if handle.join().is_err() {
            tracing::error!(target: "bcache::notifier", "notifier thread panicked");
        } else {
            tracing::info!(target: "bcache::notifier", "notifier daemon stopped");
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Arc<NotifierShared>) {
    loop {
        let caches = {
            let mut registry = shared.registry.lock();
            if !registry.shutdown && !registry.signalled {
                let _ = shared
                    .wake
                    .wait_for(&mut registry, shared.config.idle_interval);
            }
            if registry.shutdown {
                break;
            }
            registry.signalled = false;
            NotifierShared::live_caches(&mut registry)
        };

        for inner in caches {
            inner.flush_notifications();
            if !inner.read_only {
                service_cache(&inner, &shared.config);
            }
            raise_idle(&inner, shared.config.idle_interval);
            inner.flush_notifications();
        }
    }

    // Shutdown: drain everything that is still registered.
    let caches = {
        let mut registry = shared.registry.lock();
        NotifierShared::live_caches(&mut registry)
    };
    for inner in caches {
        if !inner.read_only {
            let outcome = inner.write_back_where(usize::MAX, |_, _| true);
            if let Some(err) = outcome.first_error {
                tracing::error!(
                    target: "bcache::notifier",
                    %err,
                    "final write-back on shutdown failed"
                );
            } else if let Err(err) = inner.device.sync() {
                tracing::error!(target: "bcache::notifier", %err, "device sync on shutdown failed");
            }
        }
        inner.flush_notifications();
    }
}

fn service_cache(inner: &Arc<CacheInner>, config: &NotifierConfig) {
    // A contended cache is skipped this pass rather than blocking the
    // daemon on it.
    let Some(outcome) = inner.try_write_back(config.max_blocks_per_cache) else {
        tracing::trace!(target: "bcache::notifier", "cache busy; skipping this pass");
        return;
    };
    if let Some(err) = outcome.first_error {
        tracing::error!(
            target: "bcache::notifier",
            %err,
            "background write-back failed; blocks stay dirty for retry"
        );
    } else if outcome.written > 0 {
        tracing::debug!(
            target: "bcache::notifier",
            written = outcome.written,
            "background write-back pass"
        );
    }
}

/// Queue `Idle` to every transaction once the cache has been quiet for
/// the idle interval, at most once per quiet period.
fn raise_idle(inner: &Arc<CacheInner>, idle_interval: Duration) {
    let Some(mut state) = inner.state.try_lock() else {
        return;
    };
    if state.idle_notified || state.last_write_activity.elapsed() < idle_interval {
        return;
    }
    state.idle_notified = true;
    let ids: Vec<_> = state.transactions.keys().copied().collect();
    for id in ids {
        transaction::queue_event(&mut state, id, TransactionEvent::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockDevice, MemBlockDevice};
    use bcache_types::{BlockNumber, BlockSize, EventMask};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn new_cache() -> (BlockCache, Arc<MemBlockDevice>) {
        let bs = BlockSize::new(512).expect("block size");
        let device = Arc::new(MemBlockDevice::new(bs, 32));
        let cache = BlockCache::new(
            Arc::clone(&device) as Arc<dyn crate::BlockDevice>,
            32 * 512,
            false,
        )
        .expect("cache");
        (cache, device)
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn daemon_drains_dirty_blocks() {
        let (cache, device) = new_cache();
        let notifier = Notifier::start(NotifierConfig {
            idle_interval: Duration::from_millis(20),
            max_blocks_per_cache: 8,
        });
        notifier.register(&cache);

        {
            let guard = cache.get_writable(BlockNumber(2), None).expect("writable");
            guard.data().write().fill(0x5A);
        }
        assert!(
            wait_until(Duration::from_secs(5), || cache.dirty_count() == 0),
            "daemon should write the block out"
        );
        assert_eq!(
            device.read_block(BlockNumber(2)).expect("read"),
            vec![0x5A_u8; 512]
        );
        notifier.shutdown();
    }

    #[test]
    fn ending_a_transaction_wakes_the_daemon() {
        let (cache, device) = new_cache();
        let notifier = Notifier::start(NotifierConfig {
            idle_interval: Duration::from_secs(3600),
            max_blocks_per_cache: 8,
        });
        notifier.register(&cache);

        let txn = cache.start_transaction().expect("start");
        {
            let guard = cache
                .get_writable(BlockNumber(1), Some(txn))
                .expect("writable");
            guard.data().write().fill(0x77);
        }
        cache.end_transaction(txn, None).expect("end");

        // With an hour-long timer only the end-of-transaction signal can
        // get this block written.
        assert!(
            wait_until(Duration::from_secs(5), || {
                device
                    .read_block(BlockNumber(1))
                    .is_ok_and(|data| data == vec![0x77_u8; 512])
            }),
            "signal should wake the daemon"
        );
        notifier.shutdown();
    }

    #[test]
    fn shutdown_flushes_registered_caches() {
        let (cache, device) = new_cache();
        let notifier = Notifier::start(NotifierConfig {
            idle_interval: Duration::from_secs(3600),
            max_blocks_per_cache: 64,
        });
        notifier.register(&cache);

        {
            let guard = cache.get_writable(BlockNumber(7), None).expect("writable");
            guard.data().write().fill(0x07);
        }
        notifier.shutdown();

        assert_eq!(
            device.read_block(BlockNumber(7)).expect("read"),
            vec![0x07_u8; 512]
        );
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn idle_event_fires_after_quiet_period() {
        let (cache, _device) = new_cache();
        let notifier = Notifier::start(NotifierConfig {
            idle_interval: Duration::from_millis(20),
            max_blocks_per_cache: 64,
        });
        notifier.register(&cache);

        let txn = cache.start_transaction().expect("start");
        let idles = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&idles);
        cache
            .add_transaction_listener(
                txn,
                EventMask::IDLE,
                false,
                Arc::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("listener");

        assert!(
            wait_until(Duration::from_secs(5), || idles.load(Ordering::SeqCst) > 0),
            "idle event should fire"
        );
        notifier.shutdown();
    }

    #[test]
    fn low_memory_prunes_old_blocks() {
        let (cache, _device) = new_cache();
        let notifier = Notifier::start(NotifierConfig::default());
        notifier.register(&cache);

        for block in 0..8 {
            drop(cache.get(BlockNumber(block)).expect("get"));
        }
        assert_eq!(cache.metrics().cached_blocks, 8);

        let removed = notifier.low_memory(MemoryPressure::Critical);
        assert_eq!(removed, 8);
        assert_eq!(cache.metrics().cached_blocks, 0);
        notifier.shutdown();
    }

    #[test]
    fn dropped_caches_unregister() {
        let notifier = Notifier::start(NotifierConfig::default());
        {
            let (cache, _device) = new_cache();
            notifier.register(&cache);
        }
        assert_eq!(notifier.low_memory(MemoryPressure::Critical), 0);
        notifier.shutdown();
    }

    #[test]
    fn double_registration_keeps_one_entry() {
        let notifier = Notifier::start(NotifierConfig::default());
        let (cache, _device) = new_cache();
        notifier.register(&cache);
        notifier.register(&cache);
        assert_eq!(notifier.shared.registry.lock().caches.len(), 1);

        // A different cache still gets its own slot.
        let (other, _device2) = new_cache();
        notifier.register(&other);
        assert_eq!(notifier.shared.registry.lock().caches.len(), 2);
        notifier.shutdown();
    }

    #[test]
    fn handles_are_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<Notifier>();
        check::<BlockCache>();
    }
}
