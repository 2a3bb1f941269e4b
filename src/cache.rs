//! In-memory TTL cache with per-key single-flight loading.
//!
//! [`TtlCache::get_or_load`] guarantees that while a load for a key is in
//! flight, every concurrent caller awaits the same shared future: the loader
//! runs at most once per flight. Loader errors fan out to every waiter and
//! are never cached. Entries expire after the configured TTL, evicted by a
//! background sweep and by a lazy check on read.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Interval between background eviction passes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Error delivered to every waiter of a failed load.
///
/// Cloneable so a single loader failure can fan out through the shared
/// future. The timeout case is kept distinct for telemetry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheLoadError {
    /// The loader timed out against its upstream.
    #[error("cache loader timed out")]
    Timeout,
    /// Any other loader failure.
    #[error("cache loader failed: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

type SharedLoad<V> = Shared<BoxFuture<'static, Result<V, CacheLoadError>>>;

struct Flight<V> {
    id: u64,
    load: SharedLoad<V>,
}

impl<V> Clone for Flight<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            load: self.load.clone(),
        }
    }
}

/// Keyed TTL cache with single-flight loads.
pub struct TtlCache<V: Clone> {
    entries: DashMap<String, CacheEntry<V>>,
    inflight: DashMap<String, Flight<V>>,
    flight_counter: AtomicU64,
    ttl: Duration,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            flight_counter: AtomicU64::new(0),
            ttl,
        }
    }

    /// Returns the cached value for `key` if present and fresh.
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Returns the cached value, or runs `loader` to populate it.
    ///
    /// The boolean reports whether the value was served from cache. While a
    /// load is in flight, concurrent callers for the same key await the same
    /// result; a loader error reaches all of them and nothing is cached.
    pub async fn get_or_load<F>(&self, key: &str, loader: F) -> (Result<V, CacheLoadError>, bool)
    where
        F: Future<Output = Result<V, CacheLoadError>> + Send + 'static,
    {
        if let Some(value) = self.get(key) {
            return (Ok(value), true);
        }

        let flight = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let flight = Flight {
                    id: self.flight_counter.fetch_add(1, Ordering::Relaxed),
                    load: loader.boxed().shared(),
                };
                vacant.insert(flight.clone());
                flight
            }
        };

        let result = flight.load.clone().await;
        // Every waiter races to retire the flight; the id guard prevents a
        // newer flight for the same key from being removed by a slow waiter.
        self.inflight.remove_if(key, |_, current| current.id == flight.id);

        if let Ok(value) = &result {
            self.entries.insert(
                key.to_string(),
                CacheEntry {
                    value: value.clone(),
                    inserted_at: Instant::now(),
                },
            );
        }
        (result, false)
    }

    /// Drops entries older than the TTL.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
    }

    /// Number of live entries, without freshness filtering.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawns the periodic sweeper, stopping when `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => cache.sweep(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn caches_loaded_values() {
        let cache: TtlCache<u64> = TtlCache::new(Duration::from_secs(60));
        let (value, hit) = cache.get_or_load("k", async { Ok(7) }).await;
        assert_eq!(value, Ok(7));
        assert!(!hit);

        let (value, hit) = cache
            .get_or_load("k", async { panic!("loader must not run on a hit") })
            .await;
        assert_eq!(value, Ok(7));
        assert!(hit);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: TtlCache<u64> = TtlCache::new(Duration::from_secs(60));
        let (value, _) = cache
            .get_or_load("k", async { Err(CacheLoadError::Upstream("boom".into())) })
            .await;
        assert!(value.is_err());

        let (value, hit) = cache.get_or_load("k", async { Ok(42) }).await;
        assert_eq!(value, Ok(42));
        assert!(!hit);
    }

    #[tokio::test]
    async fn concurrent_loads_run_loader_once() {
        let cache: Arc<TtlCache<u64>> = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("k", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(11)
                    })
                    .await
                    .0
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join"), Ok(11));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_error_reaches_all_waiters() {
        let cache: Arc<TtlCache<u64>> = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("k", async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(CacheLoadError::Timeout)
                    })
                    .await
                    .0
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join"), Err(CacheLoadError::Timeout));
        }
    }

    #[tokio::test]
    async fn expired_entries_are_reloaded() {
        let cache: TtlCache<u64> = TtlCache::new(Duration::from_millis(10));
        let (_, _) = cache.get_or_load("k", async { Ok(1) }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").is_none());
        let (value, hit) = cache.get_or_load("k", async { Ok(2) }).await;
        assert_eq!(value, Ok(2));
        assert!(!hit);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let cache: TtlCache<u64> = TtlCache::new(Duration::from_millis(10));
        let (_, _) = cache.get_or_load("k", async { Ok(1) }).await;
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.sweep();
        assert!(cache.is_empty());
    }
}
