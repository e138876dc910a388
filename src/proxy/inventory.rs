//! Cached proxy inventory
//!
//! The inventory keeps an immutable snapshot of usable proxies. The snapshot
//! is filled lazily on first use, from the shared cache if it has a copy and
//! from the provider otherwise, and is only ever replaced wholesale. Loads
//! are single-flight: concurrent callers that find the snapshot empty share
//! one in-flight load instead of each hitting the cache and provider. A
//! forced refresh never settles for a cache copy: it waits out any load in
//! flight and then asks the provider itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheStore;
use crate::config::InventoryConfig;
use crate::error::{DispatchError, Result};
use crate::models::{decode_proxies, encode_proxies, Proxy};
use crate::proxy::provider::ProxyProvider;
use crate::proxy::rotation::Rotation;

/// Where the current snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventorySource {
    Empty,
    Cache,
    Provider,
}

/// Immutable view of the proxy set
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    proxies: Vec<Proxy>,
    refreshed_at: Option<Instant>,
    /// Expiry carried over from the cache entry the snapshot was read from
    expires_at: Option<Instant>,
    source: InventorySource,
}

impl InventorySnapshot {
    fn empty() -> Self {
        Self {
            proxies: Vec::new(),
            refreshed_at: None,
            expires_at: None,
            source: InventorySource::Empty,
        }
    }

    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    pub fn source(&self) -> InventorySource {
        self.source
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }

    /// Older than `ttl`, past the expiry of the cache entry it came from,
    /// or never loaded
    pub fn is_stale(&self, ttl: Duration) -> bool {
        let Some(refreshed_at) = self.refreshed_at else {
            return true;
        };
        let expired = self
            .expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false);
        expired || refreshed_at.elapsed() >= ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// Cache first, provider on a miss
    CacheThenProvider,
    /// Provider only, used to refresh a live snapshot
    ProviderOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadOutcome {
    Loaded(usize),
    Empty,
}

type InFlightLoad = Shared<BoxFuture<'static, LoadOutcome>>;

struct InventoryInner {
    snapshot: ArcSwap<InventorySnapshot>,
    cache: Arc<dyn CacheStore>,
    provider: Arc<dyn ProxyProvider>,
    config: InventoryConfig,
    in_flight: Mutex<Option<(LoadMode, InFlightLoad)>>,
}

/// Process-wide proxy inventory. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProxyInventory {
    inner: Arc<InventoryInner>,
}

impl ProxyInventory {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        provider: Arc<dyn ProxyProvider>,
        config: InventoryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(InventoryInner {
                snapshot: ArcSwap::from_pointee(InventorySnapshot::empty()),
                cache,
                provider,
                config,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Make sure there is at least one proxy to select from.
    ///
    /// Returns immediately when the snapshot is already populated. Otherwise
    /// loads from the cache, then the provider, and fails with
    /// [`DispatchError::ProxyUnavailable`] if both come back empty.
    pub async fn ensure_loaded(&self) -> Result<()> {
        if !self.is_empty() {
            return Ok(());
        }

        self.load(LoadMode::CacheThenProvider).await;

        if self.is_empty() {
            Err(DispatchError::ProxyUnavailable)
        } else {
            Ok(())
        }
    }

    /// Reload from the provider. An empty result keeps the current snapshot.
    pub async fn refresh(&self) -> Result<usize> {
        match self.load(LoadMode::ProviderOnly).await {
            LoadOutcome::Loaded(count) => Ok(count),
            LoadOutcome::Empty if !self.is_empty() => Ok(self.len()),
            LoadOutcome::Empty => Err(DispatchError::ProxyUnavailable),
        }
    }

    /// Pick a proxy: sticky when `key` is given, random otherwise
    pub fn select(&self, key: Option<&str>) -> Option<Proxy> {
        let snapshot = self.inner.snapshot.load();
        Rotation::from_key(key).pick(&snapshot.proxies).cloned()
    }

    pub fn snapshot(&self) -> Arc<InventorySnapshot> {
        self.inner.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.inner.snapshot.load().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot is older than the configured cache expiry
    pub fn is_stale(&self) -> bool {
        self.inner.snapshot.load().is_stale(self.inner.config.cache_ttl)
    }

    pub fn config(&self) -> &InventoryConfig {
        &self.inner.config
    }

    /// Join the load in flight, or start one.
    ///
    /// Any load satisfies a cache-first caller. A provider-only caller only
    /// joins another provider-only load; otherwise it waits for the running
    /// load to finish and tries again.
    async fn load(&self, mode: LoadMode) -> LoadOutcome {
        loop {
            let (load, joinable) = {
                let mut slot = self.inner.in_flight.lock();
                match slot.as_ref() {
                    Some((running, load)) => {
                        let joinable = *running == mode || mode == LoadMode::CacheThenProvider;
                        (load.clone(), joinable)
                    }
                    None => {
                        let load = self.start_load(mode);
                        *slot = Some((mode, load.clone()));
                        (load, true)
                    }
                }
            };

            if joinable {
                return load.await;
            }

            debug!("Waiting for in-flight cache load before refreshing");
            load.await;
        }
    }

    fn start_load(&self, mode: LoadMode) -> InFlightLoad {
        let inner = Arc::clone(&self.inner);
        async move {
            let outcome = inner.run_load(mode).await;
            *inner.in_flight.lock() = None;
            outcome
        }
        .boxed()
        .shared()
    }
}

impl InventoryInner {
    #[instrument(skip(self), fields(cache_key = %self.config.cache_key))]
    async fn run_load(&self, mode: LoadMode) -> LoadOutcome {
        if mode == LoadMode::CacheThenProvider {
            if let Some((proxies, remaining)) = self.read_cache().await {
                let count = proxies.len();
                self.replace(proxies, InventorySource::Cache, remaining);
                info!(count, "Loaded proxies from cache");
                return LoadOutcome::Loaded(count);
            }
        }

        let proxies = match self.provider.fetch().await {
            Ok(proxies) => proxies,
            Err(e) => {
                warn!(provider = self.provider.name(), "Proxy provider failed: {}", e);
                Vec::new()
            }
        };
        let proxies: Vec<Proxy> = proxies.into_iter().filter(Proxy::is_online).collect();

        if proxies.is_empty() {
            warn!(
                provider = self.provider.name(),
                "Provider returned no usable proxies; keeping current snapshot"
            );
            return LoadOutcome::Empty;
        }

        let count = proxies.len();
        self.write_back(&proxies);
        self.replace(proxies, InventorySource::Provider, None);
        info!(count, provider = self.provider.name(), "Loaded proxies from provider");
        LoadOutcome::Loaded(count)
    }

    /// Cached list and the time left on its cache entry
    async fn read_cache(&self) -> Option<(Vec<Proxy>, Option<Duration>)> {
        let bytes = match self.cache.get(&self.config.cache_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("Proxy cache miss");
                return None;
            }
            Err(e) => {
                warn!("Proxy cache read failed: {}", e);
                return None;
            }
        };

        let proxies = match decode_proxies(&bytes) {
            Ok(proxies) if !proxies.is_empty() => proxies,
            Ok(_) => {
                debug!("Cached proxy list is empty");
                return None;
            }
            Err(e) => {
                warn!("Cached proxy list could not be decoded: {}", e);
                return None;
            }
        };

        let remaining = match self.cache.remaining_ttl(&self.config.cache_key).await {
            Ok(remaining) => remaining,
            Err(e) => {
                debug!("Could not read proxy cache expiry: {}", e);
                None
            }
        };
        Some((proxies, remaining))
    }

    /// Persist the list to the shared cache without blocking the caller
    fn write_back(&self, proxies: &[Proxy]) {
        let bytes = match encode_proxies(proxies) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode proxy list for cache: {}", e);
                return;
            }
        };

        let cache = Arc::clone(&self.cache);
        let key = self.config.cache_key.clone();
        let ttl = self.config.cache_ttl;
        tokio::spawn(async move {
            if let Err(e) = cache.set(&key, bytes, ttl).await {
                warn!(cache_key = %key, "Failed to write proxy list to cache: {}", e);
            }
        });
    }

    fn replace(&self, proxies: Vec<Proxy>, source: InventorySource, expires_in: Option<Duration>) {
        let now = Instant::now();
        self.snapshot.store(Arc::new(InventorySnapshot {
            proxies,
            refreshed_at: Some(now),
            expires_at: expires_in.map(|ttl| now + ttl),
            source,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::proxy::provider::StaticProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        proxies: Mutex<Vec<Proxy>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingProvider {
        fn new(proxies: Vec<Proxy>) -> Arc<Self> {
            Self::with_delay(proxies, Duration::ZERO)
        }

        fn with_delay(proxies: Vec<Proxy>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                proxies: Mutex::new(proxies),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn set(&self, proxies: Vec<Proxy>) {
            *self.proxies.lock() = proxies;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProxyProvider for CountingProvider {
        fn name(&self) -> &str {
            "BP"
        }

        async fn fetch(&self) -> Result<Vec<Proxy>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.proxies.lock().clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ProxyProvider for FailingProvider {
        fn name(&self) -> &str {
            "BP"
        }

        async fn fetch(&self) -> Result<Vec<Proxy>> {
            Err(DispatchError::Provider("connection refused".to_string()))
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl CacheStore for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(DispatchError::Cache("unreachable".to_string()))
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<()> {
            Err(DispatchError::Cache("unreachable".to_string()))
        }
    }

    /// Memory cache whose reads take `delay`
    struct SlowCache {
        store: MemoryCacheStore,
        delay: Duration,
    }

    #[async_trait]
    impl CacheStore for SlowCache {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            tokio::time::sleep(self.delay).await;
            self.store.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
            self.store.set(key, value, ttl).await
        }
    }

    fn bp_proxy(host: &str) -> Proxy {
        Proxy::new(host, 8080, "BP").with_credentials("user", "pass")
    }

    async fn wait_for_cache(store: &MemoryCacheStore, key: &str) -> Option<Vec<u8>> {
        for _ in 0..100 {
            if let Some(bytes) = store.get(key).await.unwrap() {
                return Some(bytes);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_provider_load_populates_snapshot_and_cache() {
        let cache = Arc::new(MemoryCacheStore::new());
        let provider = Arc::new(StaticProvider::new(vec![Proxy::parse(
            "1.2.3.4:8080:user:pass",
            "BP",
        )
        .unwrap()]));
        let inventory = ProxyInventory::new(cache.clone(), provider, InventoryConfig::default());

        inventory.ensure_loaded().await.unwrap();

        let proxy = inventory.select(None).unwrap();
        assert_eq!(proxy.host, "1.2.3.4");
        assert_eq!(proxy.port, 8080);
        assert_eq!(proxy.provider, "BP");
        assert_eq!(proxy.credentials(), Some(("user", "pass")));
        assert_eq!(inventory.snapshot().source(), InventorySource::Provider);

        let cached = wait_for_cache(&cache, "proxies").await.expect("cache write-back");
        assert_eq!(decode_proxies(&cached).unwrap(), vec![proxy]);
        let ttl = cache.ttl("proxies").unwrap();
        assert!(ttl > Duration::from_secs(3590) && ttl <= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider() {
        let cache = Arc::new(MemoryCacheStore::new());
        let cached = vec![bp_proxy("5.6.7.8")];
        cache
            .set("proxies", encode_proxies(&cached).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        let provider = CountingProvider::new(vec![bp_proxy("1.2.3.4")]);
        let inventory = ProxyInventory::new(cache, provider.clone(), InventoryConfig::default());

        inventory.ensure_loaded().await.unwrap();

        assert_eq!(provider.calls(), 0);
        assert_eq!(inventory.select(None).unwrap().host, "5.6.7.8");
        assert_eq!(inventory.snapshot().source(), InventorySource::Cache);
    }

    #[tokio::test]
    async fn test_refresh_during_cache_load_still_asks_provider() {
        let store = MemoryCacheStore::new();
        store
            .set("proxies", encode_proxies(&[bp_proxy("1.1.1.1")]).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        let cache = Arc::new(SlowCache {
            store,
            delay: Duration::from_millis(50),
        });
        let provider = CountingProvider::new(vec![bp_proxy("9.9.9.9")]);
        let inventory = ProxyInventory::new(cache, provider.clone(), InventoryConfig::default());

        let loading = {
            let inventory = inventory.clone();
            tokio::spawn(async move { inventory.ensure_loaded().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(inventory.refresh().await.unwrap(), 1);
        assert_eq!(provider.calls(), 1);
        assert_eq!(inventory.select(None).unwrap().host, "9.9.9.9");
        assert_eq!(inventory.snapshot().source(), InventorySource::Provider);
        loading.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cache_load_inherits_cache_entry_expiry() {
        let cache = Arc::new(MemoryCacheStore::new());
        cache
            .set("proxies", encode_proxies(&[bp_proxy("5.6.7.8")]).unwrap(), Duration::from_millis(50))
            .await
            .unwrap();
        let inventory = ProxyInventory::new(
            cache,
            CountingProvider::new(vec![bp_proxy("1.2.3.4")]),
            InventoryConfig::default(),
        );

        inventory.ensure_loaded().await.unwrap();
        assert_eq!(inventory.snapshot().source(), InventorySource::Cache);
        assert!(!inventory.is_stale());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(inventory.is_stale());
    }

    #[tokio::test]
    async fn test_undecodable_cache_falls_back_to_provider() {
        let cache = Arc::new(MemoryCacheStore::new());
        cache
            .set("proxies", b"{not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let provider = CountingProvider::new(vec![bp_proxy("1.2.3.4")]);
        let inventory = ProxyInventory::new(cache, provider.clone(), InventoryConfig::default());

        inventory.ensure_loaded().await.unwrap();
        assert_eq!(provider.calls(), 1);
        assert_eq!(inventory.len(), 1);
    }

    #[tokio::test]
    async fn test_loaded_snapshot_does_no_io() {
        let provider = CountingProvider::new(vec![bp_proxy("1.2.3.4")]);
        let inventory = ProxyInventory::new(
            Arc::new(MemoryCacheStore::new()),
            provider.clone(),
            InventoryConfig::default(),
        );

        inventory.ensure_loaded().await.unwrap();
        inventory.ensure_loaded().await.unwrap();
        inventory.ensure_loaded().await.unwrap();
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_proxies_anywhere_is_an_error() {
        let inventory = ProxyInventory::new(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(FailingProvider),
            InventoryConfig::default(),
        );

        assert!(matches!(
            inventory.ensure_loaded().await,
            Err(DispatchError::ProxyUnavailable)
        ));
        assert_eq!(inventory.select(Some("key")), None);
        assert_eq!(inventory.select(None), None);
    }

    #[tokio::test]
    async fn test_cache_failures_are_not_fatal() {
        let inventory = ProxyInventory::new(
            Arc::new(BrokenCache),
            CountingProvider::new(vec![bp_proxy("1.2.3.4")]),
            InventoryConfig::default(),
        );

        inventory.ensure_loaded().await.unwrap();
        assert_eq!(inventory.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_proxies_are_filtered() {
        let mut offline = bp_proxy("9.9.9.9");
        offline.status = "offline".to_string();
        let inventory = ProxyInventory::new(
            Arc::new(MemoryCacheStore::new()),
            CountingProvider::new(vec![offline, bp_proxy("1.2.3.4")]),
            InventoryConfig::default(),
        );

        inventory.ensure_loaded().await.unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory.select(None).unwrap().host, "1.2.3.4");
    }

    #[tokio::test]
    async fn test_empty_refresh_preserves_snapshot() {
        let provider = CountingProvider::new(vec![bp_proxy("1.2.3.4"), bp_proxy("5.6.7.8")]);
        let inventory = ProxyInventory::new(
            Arc::new(MemoryCacheStore::new()),
            provider.clone(),
            InventoryConfig::default(),
        );
        inventory.ensure_loaded().await.unwrap();

        provider.set(Vec::new());
        assert_eq!(inventory.refresh().await.unwrap(), 2);
        assert_eq!(inventory.len(), 2);

        provider.set(vec![bp_proxy("7.7.7.7")]);
        assert_eq!(inventory.refresh().await.unwrap(), 1);
        assert_eq!(inventory.select(None).unwrap().host, "7.7.7.7");
    }

    #[tokio::test]
    async fn test_concurrent_loads_are_single_flight() {
        let provider =
            CountingProvider::with_delay(vec![bp_proxy("1.2.3.4")], Duration::from_millis(20));
        let inventory = ProxyInventory::new(
            Arc::new(MemoryCacheStore::new()),
            provider.clone(),
            InventoryConfig::default(),
        );

        let loads = (0..10).map(|_| {
            let inventory = inventory.clone();
            async move { inventory.ensure_loaded().await }
        });
        for result in futures::future::join_all(loads).await {
            result.unwrap();
        }

        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_sticky_selection_is_stable_for_unchanged_snapshot() {
        let proxies: Vec<Proxy> = (1..=5).map(|i| bp_proxy(&format!("10.0.0.{}", i))).collect();
        let inventory = ProxyInventory::new(
            Arc::new(MemoryCacheStore::new()),
            CountingProvider::new(proxies.clone()),
            InventoryConfig::default(),
        );
        inventory.ensure_loaded().await.unwrap();

        let first = inventory.select(Some("customer-42")).unwrap();
        for _ in 0..20 {
            assert_eq!(inventory.select(Some("customer-42")).unwrap(), first);
        }

        let index = (crate::proxy::rotation::key_hash("customer-42") % 5) as usize;
        assert_eq!(first, proxies[index]);
    }

    #[tokio::test]
    async fn test_staleness_follows_ttl() {
        let inventory = ProxyInventory::new(
            Arc::new(MemoryCacheStore::new()),
            CountingProvider::new(vec![bp_proxy("1.2.3.4")]),
            InventoryConfig {
                cache_ttl: Duration::ZERO,
                ..InventoryConfig::default()
            },
        );
        assert!(inventory.is_stale());

        inventory.ensure_loaded().await.unwrap();
        assert!(inventory.snapshot().is_stale(Duration::ZERO));
        assert!(!inventory.snapshot().is_stale(Duration::from_secs(60)));
    }
}
