use crate::error::Error;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::Shared;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;

/// Configuration for the request cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Freshness window used when a call does not override the TTL, and the
    /// backstop age limit applied by the periodic sweep.
    pub default_ttl: Duration,
    /// Grace delay before a settled in-flight entry is removed, so duplicate
    /// calls issued around settlement still coalesce onto it.
    pub cleanup_delay: StdDuration,
    /// Period of the background sweep.
    pub sweep_interval: StdDuration,
    /// Whether caching/deduplication is enabled.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::seconds(30),
            cleanup_delay: StdDuration::from_secs(1),
            sweep_interval: StdDuration::from_secs(60),
            enabled: true,
        }
    }
}

/// Per-call options for [`RequestCache::execute`].
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Evict any cached response for the key and always run the request.
    pub force_refresh: bool,
    /// Freshness window for cached responses observed by this call.
    pub cache_ttl: Duration,
    /// If true, the full URL (including query string) is the cache key and
    /// pending requests for the same base resource are coalesced; if false,
    /// the query-stripped URL is the key.
    pub strict_mode: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            cache_ttl: Duration::seconds(30),
            strict_mode: true,
        }
    }
}

impl CacheOptions {
    pub fn with_ttl(cache_ttl: Duration) -> Self {
        Self {
            cache_ttl,
            ..Self::default()
        }
    }

    pub fn force() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }
}

/// Statistics about the cache contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub active_requests: usize,
    pub cached_responses: usize,
    pub cached_urls: Vec<String>,
}

type SharedResult<T> = Shared<Pin<Box<dyn Future<Output = Result<T, Error>> + Send>>>;

struct PendingEntry<T> {
    generation: u64,
    future: SharedResult<T>,
}

struct CachedEntry<T> {
    value: T,
    stored_at: DateTime<Utc>,
}

struct CacheInner<T> {
    pending: DashMap<String, PendingEntry<T>>,
    responses: DashMap<String, CachedEntry<T>>,
    cleanups: DashMap<String, (u64, JoinHandle<()>)>,
    generation: AtomicU64,
    config: CacheConfig,
}

/// Keyed request deduplication and response cache.
///
/// Guarantees at most one in-flight execution per key: concurrent callers for
/// the same key join a single [`Shared`] future and observe the same outcome,
/// success or failure. Successful results are retained for a per-call TTL;
/// failures are never cached.
pub struct RequestCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for RequestCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> RequestCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                pending: DashMap::new(),
                responses: DashMap::new(),
                cleanups: DashMap::new(),
                generation: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Execute `request_fn` for `url`, deduplicating against in-flight
    /// requests and serving fresh cached responses.
    pub async fn execute<F, Fut>(
        &self,
        url: &str,
        request_fn: F,
        options: CacheOptions,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        if !self.inner.config.enabled {
            return request_fn().await;
        }

        let base = utils::query::strip_query(url).to_string();
        let key = if options.strict_mode {
            url.to_string()
        } else {
            base.clone()
        };

        if options.force_refresh {
            log::debug!("Forced refresh for {}", url);
            self.inner.responses.remove(&key);
            return self.launch(&key, request_fn, true).await;
        }

        if let Some(pending) = self.inner.pending.get(&key) {
            log::debug!("Joining in-flight request for {}", url);
            let future = pending.future.clone();
            drop(pending);
            return future.await;
        }

        if options.strict_mode {
            // Coalesce onto a pending request for the same base resource that
            // differs only by query parameters (e.g. a cache buster).
            let similar = self.inner.pending.iter().find_map(|entry| {
                entry
                    .key()
                    .starts_with(&base)
                    .then(|| entry.value().future.clone())
            });
            if let Some(future) = similar {
                log::debug!("Joining in-flight request for base resource {}", base);
                return future.await;
            }
        }

        if let Some(cached) = self.inner.responses.get(&key) {
            let age = Utc::now() - cached.stored_at;
            if age < options.cache_ttl {
                log::debug!("Cache hit for {} (age {}ms)", url, age.num_milliseconds());
                return Ok(cached.value.clone());
            }
            log::debug!("Cache expired for {}", url);
        }

        log::debug!("New request for {}", url);
        self.launch(&key, request_fn, false).await
    }

    /// Register a new in-flight entry for `key` and return its shared future.
    ///
    /// With `replace` set the entry is installed unconditionally; otherwise a
    /// concurrently installed entry wins and is joined instead (the freshly
    /// built future is dropped unpolled, so its request never runs).
    fn launch<F, Fut>(&self, key: &str, request_fn: F, replace: bool) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let request = request_fn();

        let driven = async move {
            let result = request.await;
            match &result {
                Ok(value) => {
                    inner.responses.insert(
                        owned_key.clone(),
                        CachedEntry {
                            value: value.clone(),
                            stored_at: Utc::now(),
                        },
                    );
                }
                Err(err) => {
                    log::warn!("Request failed for {}: {}", owned_key, err);
                    inner.responses.remove(&owned_key);
                }
            }
            CacheInner::schedule_cleanup(&inner, owned_key, generation);
            result
        };
        let shared: SharedResult<T> = driven.boxed().shared();

        let entry = PendingEntry {
            generation,
            future: shared.clone(),
        };
        if replace {
            self.inner.pending.insert(key.to_string(), entry);
            return shared;
        }
        match self.inner.pending.entry(key.to_string()) {
            Entry::Occupied(existing) => existing.get().future.clone(),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                shared
            }
        }
    }

    /// Remove the entries for one URL, or everything if no URL is given.
    pub fn clear(&self, url: Option<&str>) {
        match url {
            Some(url) => {
                log::debug!("Clearing cache for {}", url);
                self.inner.pending.remove(url);
                self.inner.responses.remove(url);
                if let Some((_, (_, timer))) = self.inner.cleanups.remove(url) {
                    timer.abort();
                }
            }
            None => {
                log::info!("Clearing entire request cache");
                self.inner.pending.clear();
                self.inner.responses.clear();
                for entry in self.inner.cleanups.iter() {
                    entry.value().1.abort();
                }
                self.inner.cleanups.clear();
            }
        }
    }

    /// Whether an in-flight or cached entry exists for `url`.
    pub fn has(&self, url: &str) -> bool {
        self.inner.responses.contains_key(url) || self.inner.pending.contains_key(url)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            active_requests: self.inner.pending.len(),
            cached_responses: self.inner.responses.len(),
            cached_urls: self
                .inner
                .responses
                .iter()
                .map(|entry| entry.key().clone())
                .collect(),
        }
    }

    /// Remove cached responses older than the default TTL. Returns the number
    /// of evicted entries.
    pub fn evict_expired(&self) -> usize {
        self.inner.evict_expired()
    }

    /// Spawn the periodic sweep. The task holds only a weak reference, so it
    /// stops once the owning cache is dropped; the returned handle allows an
    /// earlier explicit teardown.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.evict_expired();
            }
        })
    }
}

impl<T> CacheInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Schedule removal of the pending entry for `key` after the grace delay.
    /// The removal only fires if the entry still belongs to `generation`, so a
    /// newer request that replaced the entry is left untouched.
    fn schedule_cleanup(inner: &Arc<Self>, key: String, generation: u64) {
        let weak = Arc::downgrade(inner);
        let delay = inner.config.cleanup_delay;
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let removed = inner
                    .pending
                    .remove_if(&timer_key, |_, entry| entry.generation == generation);
                if removed.is_some() {
                    log::debug!("Removed settled in-flight entry for {}", timer_key);
                }
                inner
                    .cleanups
                    .remove_if(&timer_key, |_, (timer_gen, _)| *timer_gen == generation);
            }
        });
        if let Some((_, previous)) = inner.cleanups.insert(key, (generation, timer)) {
            previous.abort();
        }
    }

    fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .responses
            .iter()
            .filter(|entry| now - entry.value().stored_at > self.config.default_ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let count = expired.len();
        for key in expired {
            self.responses.remove(&key);
        }
        if count > 0 {
            log::debug!("Evicted {} expired cache entries", count);
        }
        count
    }
}
