//! Per-pool listing cache
//!
//! Listings are computed on the blocking pool and cached per key. Callers
//! asking for the same key while a computation runs share it, and wait at
//! most `timeout` for it before answering with what is cached. A failed
//! computation reaches every caller waiting on it and is not remembered.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Computed within the stale period, or just now
    Fresh,
    /// An older value, while a refresh is running
    Stale,
    /// Nothing cached yet
    Computing,
}

/// One pool's listing as returned to API callers
#[derive(Debug, Clone, Serialize)]
pub struct PoolListing<T> {
    pub status: CacheStatus,
    pub value: Vec<T>,
    pub pool_name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Values younger than this are served without recomputing
    pub stale_period: Duration,
    /// Longest a caller waits for an in-flight computation
    pub timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_period: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        }
    }
}

struct Cached<T> {
    value: Vec<T>,
    fetched_at: Instant,
    expired: bool,
}

/// Outcome of one computation, `None` while it runs
type Fetched = Option<Result<()>>;

struct Slot<T> {
    cached: Option<Cached<T>>,
    inflight: Option<watch::Receiver<Fetched>>,
    epoch: u64,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            cached: None,
            inflight: None,
            epoch: 0,
        }
    }
}

impl<T> Slot<T> {
    fn fresh(&self, stale_period: Duration) -> bool {
        self.cached
            .as_ref()
            .is_some_and(|c| !c.expired && c.fetched_at.elapsed() < stale_period)
    }
}

/// Cache of listings keyed by pool
pub struct ListingCache<T> {
    slots: Arc<Mutex<HashMap<String, Slot<T>>>>,
    config: CacheConfig,
}

impl<T> Clone for ListingCache<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            config: self.config,
        }
    }
}

impl<T: Clone + Send + 'static> ListingCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Listing for `key`, computing it with `fetch` when needed
    ///
    /// Every caller waiting on a computation that fails gets its error.
    pub async fn get<F>(&self, key: &str, fetch: F) -> Result<PoolListing<T>>
    where
        F: FnOnce() -> Result<Vec<T>> + Send + 'static,
    {
        let mut rx = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();
            if slot.fresh(self.config.stale_period) {
                return Ok(self.listing(key, Some(slot), CacheStatus::Fresh));
            }
            match &slot.inflight {
                Some(rx) => rx.clone(),
                None => {
                    let rx = self.spawn_fetch(key, slot.epoch, fetch);
                    slot.inflight = Some(rx.clone());
                    rx
                }
            }
        };

        let waited = tokio::time::timeout(self.config.timeout, rx.wait_for(Option::is_some)).await;
        let outcome = match waited {
            Ok(Ok(done)) => done.clone(),
            Ok(Err(_)) => Some(Err(Error::Internal("listing computation was dropped".into()))),
            Err(_) => None,
        };

        let slots = self.slots.lock();
        let slot = slots.get(key);
        match outcome {
            Some(Err(err)) => Err(err),
            Some(Ok(())) => Ok(self.listing(key, slot, CacheStatus::Fresh)),
            None => {
                let status = if slot.is_some_and(|s| s.cached.is_some()) {
                    CacheStatus::Stale
                } else {
                    CacheStatus::Computing
                };
                Ok(self.listing(key, slot, status))
            }
        }
    }

    /// Forget the freshness of `key`; the next caller recomputes
    pub fn invalidate(&self, key: &str) {
        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.epoch += 1;
            if let Some(cached) = slot.cached.as_mut() {
                cached.expired = true;
            }
        }
    }

    pub fn invalidate_all(&self) {
        let keys: Vec<String> = self.slots.lock().keys().cloned().collect();
        for key in keys {
            self.invalidate(&key);
        }
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn listing(&self, key: &str, slot: Option<&Slot<T>>, status: CacheStatus) -> PoolListing<T> {
        PoolListing {
            status,
            value: slot
                .and_then(|s| s.cached.as_ref())
                .map(|c| c.value.clone())
                .unwrap_or_default(),
            pool_name: key.to_string(),
        }
    }

    fn spawn_fetch<F>(&self, key: &str, epoch: u64, fetch: F) -> watch::Receiver<Fetched>
    where
        F: FnOnce() -> Result<Vec<T>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let slots = self.slots.clone();
        let key = key.to_string();
        tracing::debug!(key = %key, "computing listing");
        tokio::task::spawn_blocking(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(fetch))
                .unwrap_or_else(|_| Err(Error::Internal("listing computation panicked".into())));
            let mut slots = slots.lock();
            let slot = slots.entry(key.clone()).or_default();
            slot.inflight = None;
            let reported = match outcome {
                Ok(value) => {
                    slot.cached = Some(Cached {
                        value,
                        fetched_at: Instant::now(),
                        expired: slot.epoch != epoch,
                    });
                    Ok(())
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "listing computation failed");
                    // Keys that never produced a listing are not kept around
                    if slot.cached.is_none() {
                        slots.remove(&key);
                    }
                    Err(err)
                }
            };
            drop(slots);
            tx.send_replace(Some(reported));
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(stale_period: Duration, timeout: Duration) -> ListingCache<u32> {
        ListingCache::new(CacheConfig {
            stale_period,
            timeout,
        })
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        value: Vec<u32>,
    ) -> impl FnOnce() -> Result<Vec<u32>> + Send + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(delay);
            Ok(value)
        }
    }

    #[tokio::test]
    async fn test_fresh_value_is_reused() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let first = cache.get("rbd", counting(&calls, Duration::ZERO, vec![1, 2])).await.unwrap();
        assert_eq!(first.status, CacheStatus::Fresh);
        assert_eq!(first.value, vec![1, 2]);
        assert_eq!(first.pool_name, "rbd");
        let second = cache.get("rbd", counting(&calls, Duration::ZERO, vec![9])).await.unwrap();
        assert_eq!(second.value, vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let (a, b) = tokio::join!(
            cache.get("rbd", counting(&calls, Duration::from_millis(100), vec![1])),
            cache.get("rbd", counting(&calls, Duration::from_millis(100), vec![2])),
        );
        assert_eq!(a.unwrap().value, vec![1]);
        assert_eq!(b.unwrap().value, vec![1]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_computing_then_fresh() {
        let cache = cache(Duration::from_secs(60), Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let listing = cache
            .get("rbd", counting(&calls, Duration::from_millis(200), vec![7]))
            .await
            .unwrap();
        assert_eq!(listing.status, CacheStatus::Computing);
        assert!(listing.value.is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let listing = cache
            .get("rbd", counting(&calls, Duration::ZERO, vec![8]))
            .await
            .unwrap();
        assert_eq!(listing.status, CacheStatus::Fresh);
        assert_eq!(listing.value, vec![7]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_value_served_while_refreshing() {
        let cache = cache(Duration::ZERO, Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get("rbd", counting(&calls, Duration::ZERO, vec![1]))
            .await
            .unwrap();
        let listing = cache
            .get("rbd", counting(&calls, Duration::from_millis(200), vec![2]))
            .await
            .unwrap();
        assert_eq!(listing.status, CacheStatus::Stale);
        assert_eq!(listing.value, vec![1]);
    }

    #[tokio::test]
    async fn test_failure_is_not_sticky() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(5));
        let err = cache
            .get("rbd", || Err(Error::PoolNotFound("rbd".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolNotFound(_)));
        let listing = cache.get("rbd", || Ok(vec![3])).await.unwrap();
        assert_eq!(listing.value, vec![3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_waiter_sees_a_shared_failure() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(5));
        let failing = || -> Result<Vec<u32>> {
            std::thread::sleep(Duration::from_millis(100));
            Err(Error::PoolNotFound("ghost".into()))
        };
        let (a, b) = tokio::join!(cache.get("ghost", failing), cache.get("ghost", failing));
        assert!(matches!(a, Err(Error::PoolNotFound(_))), "{a:?}");
        assert!(matches!(b, Err(Error::PoolNotFound(_))), "{b:?}");
    }

    #[tokio::test]
    async fn test_failure_does_not_mark_old_value_fresh() {
        let cache = cache(Duration::ZERO, Duration::from_secs(5));
        cache.get("rbd", || Ok(vec![1])).await.unwrap();
        let err = cache
            .get("rbd", || Err(Error::Internal("boom".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        // The older listing survives the failed refresh
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_unknown_keys_are_forgotten() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(5));
        for i in 0..20 {
            let key = format!("missing-{i}");
            let name = key.clone();
            let err = cache
                .get(&key, move || Err(Error::PoolNotFound(name)))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::PoolNotFound(_)));
        }
        assert!(cache.is_empty());

        cache.get("rbd", || Ok(vec![1])).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidate_during_fetch_forces_recompute() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let pending = {
            let cache = cache.clone();
            let fetch = counting(&calls, Duration::from_millis(200), vec![1]);
            tokio::spawn(async move { cache.get("rbd", fetch).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.invalidate("rbd");

        // The waiter still gets what it asked for
        let first = pending.await.unwrap().unwrap();
        assert_eq!(first.value, vec![1]);

        // but the result predates the invalidation and is not reused
        let second = cache
            .get("rbd", counting(&calls, Duration::ZERO, vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(second.value, vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get("rbd", counting(&calls, Duration::ZERO, vec![1]))
            .await
            .unwrap();
        cache.invalidate("rbd");
        let listing = cache
            .get("rbd", counting(&calls, Duration::ZERO, vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(listing.value, vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
