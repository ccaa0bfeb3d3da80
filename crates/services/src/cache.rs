//! Latest-snapshot cache, one entry per symbol.
//!
//! [`FallbackStore`] composes a primary tier (normally [`RemoteStore`]) with
//! an in-process [`LocalStore`]. Writes go to the primary and land in the
//! local tier only when the primary fails; reads try the primary first.
//!
//! [`RemoteStore`]: crate::redis_store::RemoteStore

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use marketstream_models::{MarketStreamError, Snapshot};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stored snapshot could not be decoded: {0}")]
    Codec(#[from] MarketStreamError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put(&self, snapshot: &Snapshot) -> StoreResult<()>;

    async fn get(&self, symbol: &str) -> StoreResult<Option<Snapshot>>;

    async fn clear(&self) -> StoreResult<()>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: Snapshot,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// In-process tier. Entries never expire unless a TTL is configured.
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: DashMap<String, CacheEntry>,
    ttl: Option<Duration>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Some(ttl),
        }
    }

    /// Entries physically held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for LocalStore {
    async fn put(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let entry = CacheEntry {
            snapshot: snapshot.clone(),
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.insert(snapshot.symbol.clone(), entry);
        Ok(())
    }

    async fn get(&self, symbol: &str) -> StoreResult<Option<Snapshot>> {
        let now = Instant::now();
        let found = self
            .entries
            .get(symbol)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.snapshot.clone()));

        match found {
            Some(Some(snapshot)) => Ok(Some(snapshot)),
            Some(None) => {
                self.entries.remove_if(symbol, |_, entry| entry.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn clear(&self) -> StoreResult<()> {
        self.entries.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Two-tier cache with silent fallback.
///
/// Primary calls are bounded by `timeout`; a primary that errors or stalls is
/// treated as unavailable for that call only. `put` reports an error only
/// when the fallback tier fails as well.
pub struct FallbackStore {
    primary: Option<Arc<dyn SnapshotStore>>,
    fallback: Arc<dyn SnapshotStore>,
    timeout: Duration,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn SnapshotStore>, fallback: Arc<dyn SnapshotStore>, timeout: Duration) -> Self {
        Self {
            primary: Some(primary),
            fallback,
            timeout,
        }
    }

    /// A cache with no primary tier, used when the remote store is disabled or unreachable.
    pub fn local_only(fallback: Arc<dyn SnapshotStore>) -> Self {
        Self {
            primary: None,
            fallback,
            timeout: Duration::ZERO,
        }
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    async fn guarded<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        timeout(self.timeout, operation)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.timeout)))
    }
}

#[async_trait]
impl SnapshotStore for FallbackStore {
    async fn put(&self, snapshot: &Snapshot) -> StoreResult<()> {
        if let Some(primary) = &self.primary {
            match self.guarded(primary.put(snapshot)).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    "⚠️ {} cache write failed for {}, using {}: {}",
                    primary.name(),
                    snapshot.symbol,
                    self.fallback.name(),
                    e
                ),
            }
        }

        self.fallback.put(snapshot).await
    }

    async fn get(&self, symbol: &str) -> StoreResult<Option<Snapshot>> {
        if let Some(primary) = &self.primary {
            match self.guarded(primary.get(symbol)).await {
                Ok(Some(snapshot)) => return Ok(Some(snapshot)),
                Ok(None) => {}
                Err(e) => debug!("{} cache read failed for {}: {}", primary.name(), symbol, e),
            }
        }

        self.fallback.get(symbol).await
    }

    async fn clear(&self) -> StoreResult<()> {
        if let Some(primary) = &self.primary {
            if let Err(e) = self.guarded(primary.clear()).await {
                debug!("Ignoring {} cache clear failure: {}", primary.name(), e);
            }
        }

        self.fallback.clear().await
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketstream_models::wall_clock_now;
    use rust_decimal_macros::dec;

    const PRIMARY_TIMEOUT: Duration = Duration::from_millis(50);

    fn snapshot(symbol: &str) -> Snapshot {
        Snapshot::baseline(symbol, dec!(150.00), wall_clock_now())
    }

    fn failing_primary() -> MockSnapshotStore {
        let mut primary = MockSnapshotStore::new();
        primary
            .expect_put()
            .returning(|_| Err(StoreError::Unavailable("connection refused".to_string())));
        primary
            .expect_get()
            .returning(|_| Err(StoreError::Unavailable("connection refused".to_string())));
        primary
            .expect_clear()
            .returning(|| Err(StoreError::Unavailable("connection refused".to_string())));
        primary.expect_name().return_const("mock");
        primary
    }

    /// Primary that never answers within the timeout.
    struct StalledStore;

    #[async_trait]
    impl SnapshotStore for StalledStore {
        async fn put(&self, _snapshot: &Snapshot) -> StoreResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn get(&self, _symbol: &str) -> StoreResult<Option<Snapshot>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn clear(&self) -> StoreResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_put_then_get_returns_same_snapshot() {
        let primary = Arc::new(LocalStore::with_ttl(DEFAULT_CACHE_TTL));
        let fallback = Arc::new(LocalStore::new());
        let cache = FallbackStore::new(primary.clone(), fallback.clone(), PRIMARY_TIMEOUT);

        let written = snapshot("AAPL");
        cache.put(&written).await.unwrap();

        assert_eq!(cache.get("AAPL").await.unwrap(), Some(written));
        assert_eq!(primary.len(), 1);
        assert!(fallback.is_empty(), "healthy primary must not touch the fallback tier");
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_entry_expires_after_ttl() {
        let primary = Arc::new(LocalStore::with_ttl(DEFAULT_CACHE_TTL));
        let cache = FallbackStore::new(primary, Arc::new(LocalStore::new()), PRIMARY_TIMEOUT);

        cache.put(&snapshot("MSFT")).await.unwrap();

        tokio::time::advance(DEFAULT_CACHE_TTL - Duration::from_secs(1)).await;
        assert!(cache.get("MSFT").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("MSFT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_primary_falls_back_without_data_loss() {
        let fallback = Arc::new(LocalStore::new());
        let cache = FallbackStore::new(Arc::new(failing_primary()), fallback.clone(), PRIMARY_TIMEOUT);

        let first = snapshot("TSLA");
        let mut second = snapshot("TSLA");
        second.price = dec!(801.25);

        cache.put(&first).await.unwrap();
        cache.put(&second).await.unwrap();

        assert_eq!(cache.get("TSLA").await.unwrap(), Some(second));
        assert_eq!(fallback.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_primary_times_out_to_fallback() {
        let cache = FallbackStore::new(Arc::new(StalledStore), Arc::new(LocalStore::new()), PRIMARY_TIMEOUT);

        let written = snapshot("NVDA");
        cache.put(&written).await.unwrap();

        assert_eq!(cache.get("NVDA").await.unwrap(), Some(written));
        cache.clear().await.unwrap();
        assert!(cache.get("NVDA").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_entries_never_expire_by_default() {
        let fallback = Arc::new(LocalStore::new());
        let cache = FallbackStore::new(Arc::new(failing_primary()), fallback, PRIMARY_TIMEOUT);

        cache.put(&snapshot("META")).await.unwrap();
        tokio::time::advance(DEFAULT_CACHE_TTL * 10).await;

        assert!(cache.get("META").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_primary_miss_reads_fallback() {
        let primary = Arc::new(LocalStore::new());
        let fallback = Arc::new(LocalStore::new());
        let stale = snapshot("AMZN");
        fallback.put(&stale).await.unwrap();

        let cache = FallbackStore::new(primary, fallback, PRIMARY_TIMEOUT);
        assert_eq!(cache.get("AMZN").await.unwrap(), Some(stale));
        assert!(cache.get("GOOGL").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_swallows_primary_failure() {
        let fallback = Arc::new(LocalStore::new());
        let cache = FallbackStore::new(Arc::new(failing_primary()), fallback.clone(), PRIMARY_TIMEOUT);

        cache.put(&snapshot("NFLX")).await.unwrap();
        cache.clear().await.unwrap();

        assert!(fallback.is_empty());
    }

    #[tokio::test]
    async fn test_local_only_cache() {
        let cache = FallbackStore::local_only(Arc::new(LocalStore::new()));
        assert!(!cache.has_primary());

        let written = snapshot("RELIANCE");
        cache.put(&written).await.unwrap();
        assert_eq!(cache.get("RELIANCE").await.unwrap(), Some(written));
    }
}
