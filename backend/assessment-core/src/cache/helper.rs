use serde::{de::DeserializeOwned, Serialize};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use super::{CacheError, CacheKeys, CacheStore, CacheTtl};
use crate::config::CacheSettings;
use crate::error::CoreResult;
use crate::metrics::{
    record_cache_hit, record_cache_miss, record_cache_unavailable, track_cache_operation,
    CACHE_POPULATE_JOBS_TOTAL,
};

/// Outcome of a cache read. `Unavailable` is not a miss: the value may exist.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Hit(T),
    Miss,
    Unavailable,
}

struct PopulateJob {
    key: String,
    value: Vec<u8>,
    ttl: Duration,
    /// Invalidation generation observed before the value was fetched.
    generation: u64,
}

/// Cache-aside operations shared by every service.
///
/// Constructed once and injected; holds no business state. With no store
/// configured (or an unreachable one) reads report `Unavailable`, writes and
/// deletes are silent no-ops, and `cache_or_execute` degrades to a plain fetch.
///
/// Every delete or pattern invalidation advances a generation counter. A
/// background population fetched under an older generation is discarded, so
/// a value read before a write cannot be written back after that write's
/// invalidation.
pub struct CacheHelper {
    store: Option<Arc<dyn CacheStore>>,
    keys: CacheKeys,
    settings: CacheSettings,
    populate_tx: Option<mpsc::Sender<PopulateJob>>,
    generation: Arc<AtomicU64>,
}

impl CacheHelper {
    /// Starts the population dispatcher, so it must run inside a tokio runtime.
    pub fn new(store: Option<Arc<dyn CacheStore>>, settings: CacheSettings) -> Self {
        let store = if settings.enabled { store } else { None };
        let generation = Arc::new(AtomicU64::new(0));
        let populate_tx = store.as_ref().map(|store| {
            let (tx, rx) = mpsc::channel(settings.populate_queue_capacity.max(1));
            spawn_populator(
                store.clone(),
                rx,
                generation.clone(),
                settings.populate_concurrency.max(1),
                settings.populate_timeout(),
            );
            tx
        });

        Self {
            store,
            keys: CacheKeys::new(settings.namespace.clone()),
            settings,
            populate_tx,
            generation,
        }
    }

    /// A helper with no backing store.
    pub fn disabled(settings: CacheSettings) -> Self {
        Self::new(None, settings)
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    pub fn ttl(&self, class: CacheTtl) -> Duration {
        self.settings.ttl_for(class)
    }

    /// Marks every population fetched so far as stale. Runs before the
    /// delete it guards.
    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn store(&self) -> Result<&Arc<dyn CacheStore>, CacheError> {
        self.store
            .as_ref()
            .ok_or_else(|| CacheError::Unavailable("cache disabled".to_string()))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheLookup<T> {
        let store = match self.store() {
            Ok(store) => store,
            Err(_) => {
                record_cache_unavailable();
                return CacheLookup::Unavailable;
            }
        };

        match track_cache_operation("get", store.get(key)).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    record_cache_hit();
                    CacheLookup::Hit(value)
                }
                Err(e) => {
                    warn!(key, error = %e, "Dropping undecodable cache entry");
                    self.delete(&[key.to_string()]).await;
                    record_cache_miss();
                    CacheLookup::Miss
                }
            },
            Ok(None) => {
                record_cache_miss();
                CacheLookup::Miss
            }
            Err(e) => {
                debug!(key, error = %e, "Cache read failed");
                record_cache_unavailable();
                CacheLookup::Unavailable
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let store = self.store()?;
        track_cache_operation("exists", store.exists(key)).await
    }

    /// Synchronous write; failures are logged and swallowed.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: CacheTtl) {
        let Ok(store) = self.store() else {
            return;
        };
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) =
            track_cache_operation("set", store.set(key, &bytes, self.ttl(ttl))).await
        {
            debug!(key, error = %e, "Cache write failed");
        }
    }

    /// Deletes specific keys; failures are logged and swallowed.
    pub async fn delete(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let Ok(store) = self.store() else {
            return;
        };
        self.bump_generation();
        if let Err(e) = track_cache_operation("del", store.delete(keys)).await {
            warn!(?keys, error = %e, "Cache invalidation failed");
        }
    }

    /// Deletes every key matching `pattern`, scanning incrementally and
    /// deleting batch by batch. Returns the number of keys removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let Ok(store) = self.store() else {
            return 0;
        };
        self.bump_generation();
        let batch = self.settings.scan_batch.max(1);
        let mut cursor = 0u64;
        let mut removed = 0u64;

        loop {
            let (next, keys) =
                match track_cache_operation("scan", store.scan(cursor, pattern, batch)).await {
                    Ok(step) => step,
                    Err(e) => {
                        warn!(pattern, error = %e, "Pattern invalidation aborted");
                        return removed;
                    }
                };

            if !keys.is_empty() {
                match track_cache_operation("del", store.delete(&keys)).await {
                    Ok(n) => removed += n,
                    Err(e) => {
                        warn!(pattern, error = %e, "Pattern invalidation aborted");
                        return removed;
                    }
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern, removed, "Invalidated cache pattern");
        removed
    }

    /// Invalidates several patterns in turn.
    pub async fn invalidate_patterns(&self, patterns: &[String]) {
        for pattern in patterns {
            self.invalidate_pattern(pattern).await;
        }
    }

    /// Serves `key` from cache, or runs `fetch` and hands the encoded result to
    /// the background populator.
    ///
    /// `fetch` runs on the caller's task, so cancelling the caller cancels it and
    /// its errors propagate. The population write is detached and bounded by its
    /// own timeout, and is dropped if any invalidation ran after `fetch` started.
    /// A fetched value is returned after the same encode/decode the cache
    /// applies, so callers see identical shapes either way.
    pub async fn cache_or_execute<T, F, Fut>(
        &self,
        key: &str,
        ttl: CacheTtl,
        fetch: F,
    ) -> CoreResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        if let CacheLookup::Hit(value) = self.get::<T>(key).await {
            return Ok(value);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let fresh = fetch().await?;

        let bytes = match serde_json::to_vec(&fresh) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode fetched value; skipping cache");
                return Ok(fresh);
            }
        };
        let value = match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Fetched value does not survive encoding; skipping cache");
                return Ok(fresh);
            }
        };

        self.enqueue_populate(key, bytes, ttl, generation);
        Ok(value)
    }

    fn enqueue_populate(&self, key: &str, value: Vec<u8>, ttl: CacheTtl, generation: u64) {
        let Some(tx) = &self.populate_tx else {
            return;
        };
        let job = PopulateJob {
            key: key.to_string(),
            value,
            ttl: self.ttl(ttl),
            generation,
        };
        if let Err(e) = tx.try_send(job) {
            CACHE_POPULATE_JOBS_TOTAL
                .with_label_values(&["dropped"])
                .inc();
            match e {
                mpsc::error::TrySendError::Full(job) => {
                    warn!(key = %job.key, "Cache population queue full; dropping write")
                }
                mpsc::error::TrySendError::Closed(job) => {
                    warn!(key = %job.key, "Cache populator stopped; dropping write")
                }
            }
        }
    }
}

/// Drains population jobs with at most `concurrency` writes in flight, each
/// under its own timeout and outside any request's cancellation scope.
///
/// The generation is checked before the write and again after it. An
/// invalidation that lands in between either deletes after the write or is
/// seen by the second check, which then removes the entry itself.
fn spawn_populator(
    store: Arc<dyn CacheStore>,
    mut rx: mpsc::Receiver<PopulateJob>,
    generation: Arc<AtomicU64>,
    concurrency: usize,
    write_timeout: Duration,
) {
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(concurrency));
        while let Some(job) = rx.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let store = store.clone();
            let generation = generation.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let is_stale = || generation.load(Ordering::SeqCst) != job.generation;
                if is_stale() {
                    CACHE_POPULATE_JOBS_TOTAL.with_label_values(&["stale"]).inc();
                    return;
                }
                let status = match tokio::time::timeout(
                    write_timeout,
                    track_cache_operation("populate", store.set(&job.key, &job.value, job.ttl)),
                )
                .await
                {
                    Ok(Ok(())) if is_stale() => {
                        if let Err(e) = store.delete(std::slice::from_ref(&job.key)).await {
                            warn!(key = %job.key, error = %e, "Failed to drop stale cache entry");
                        }
                        "stale"
                    }
                    Ok(Ok(())) => "written",
                    Ok(Err(e)) => {
                        warn!(key = %job.key, error = %e, "Background cache population failed");
                        "failed"
                    }
                    Err(_) => {
                        warn!(
                            key = %job.key,
                            timeout_ms = write_timeout.as_millis() as u64,
                            "Background cache population timed out"
                        );
                        "timeout"
                    }
                };
                CACHE_POPULATE_JOBS_TOTAL.with_label_values(&[status]).inc();
            });
        }
        debug!("Cache populator stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::error::CoreError;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
        n: u32,
    }

    fn helper_with(store: Arc<MemoryCacheStore>) -> CacheHelper {
        CacheHelper::new(
            Some(store as Arc<dyn CacheStore>),
            CacheSettings::default(),
        )
    }

    async fn wait_for_key(store: &MemoryCacheStore, key: &str) {
        for _ in 0..100 {
            if store.get(key).await.ok().flatten().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("key {key} was never populated");
    }

    #[tokio::test]
    async fn miss_fetches_then_hit_skips_fetch() {
        let store = Arc::new(MemoryCacheStore::new());
        let helper = helper_with(store.clone());
        let calls = AtomicUsize::new(0);

        let first: Row = helper
            .cache_or_execute("k", CacheTtl::Fast, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Row { id: "a".into(), n: 1 })
            })
            .await
            .unwrap();
        wait_for_key(&store, "k").await;

        let second: Row = helper
            .cache_or_execute("k", CacheTtl::Fast, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Row { id: "b".into(), n: 2 })
            })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_errors_propagate_and_are_not_cached() {
        let store = Arc::new(MemoryCacheStore::new());
        let helper = helper_with(store.clone());

        let result: CoreResult<Row> = helper
            .cache_or_execute("missing", CacheTtl::Fast, || async {
                Err(CoreError::not_found("row", "missing"))
            })
            .await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_fetch() {
        let store = Arc::new(MemoryCacheStore::new());
        store.set_available(false);
        let helper = helper_with(store.clone());

        assert_eq!(helper.get::<Row>("k").await, CacheLookup::Unavailable);
        assert!(helper.exists("k").await.unwrap_err().is_unavailable());
        helper.delete(&["k".to_string()]).await;
        assert_eq!(helper.invalidate_pattern("*").await, 0);

        let row: Row = helper
            .cache_or_execute("k", CacheTtl::Fast, || async {
                Ok(Row { id: "live".into(), n: 7 })
            })
            .await
            .unwrap();
        assert_eq!(row.id, "live");
    }

    #[tokio::test]
    async fn disabled_helper_never_hits() {
        let helper = CacheHelper::disabled(CacheSettings::default());
        assert_eq!(helper.get::<Row>("k").await, CacheLookup::Unavailable);
        let row: Row = helper
            .cache_or_execute("k", CacheTtl::Stats, || async {
                Ok(Row { id: "x".into(), n: 1 })
            })
            .await
            .unwrap();
        assert_eq!(row.n, 1);
    }

    #[tokio::test]
    async fn pattern_invalidation_spans_scan_batches() {
        let store = Arc::new(MemoryCacheStore::new());
        let settings = CacheSettings {
            scan_batch: 3,
            ..CacheSettings::default()
        };
        let helper = CacheHelper::new(Some(store.clone() as Arc<dyn CacheStore>), settings);
        for i in 0..10 {
            helper
                .set(&format!("assess:attempt:student:s1:{i}"), &i, CacheTtl::Fast)
                .await;
        }
        helper.set("assess:attempt:student:s2:0", &0, CacheTtl::Fast).await;

        let removed = helper
            .invalidate_pattern("assess:attempt:student:s1:*")
            .await;
        assert_eq!(removed, 10);
        assert_eq!(store.keys().await, vec!["assess:attempt:student:s2:0".to_string()]);
    }

    #[tokio::test]
    async fn population_fetched_before_invalidation_is_discarded() {
        let store = Arc::new(MemoryCacheStore::new());
        let helper = helper_with(store.clone());

        let _: Row = helper
            .cache_or_execute("k", CacheTtl::Fast, || async {
                Ok(Row { id: "old".into(), n: 1 })
            })
            .await
            .unwrap();
        // The write path invalidates before the queued population runs.
        helper.delete(&["k".to_string()]).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get("k").await.unwrap().is_none());

        let fresh: Row = helper
            .cache_or_execute("k", CacheTtl::Fast, || async {
                Ok(Row { id: "new".into(), n: 2 })
            })
            .await
            .unwrap();
        assert_eq!(fresh.id, "new");
        wait_for_key(&store, "k").await;
        assert_eq!(helper.get::<Row>("k").await, CacheLookup::Hit(fresh));
    }

    #[tokio::test]
    async fn undecodable_entry_is_treated_as_miss() {
        let store = Arc::new(MemoryCacheStore::new());
        store
            .set("k", b"not json", Duration::from_secs(60))
            .await
            .unwrap();
        let helper = helper_with(store.clone());
        assert_eq!(helper.get::<Row>("k").await, CacheLookup::Miss);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
