// Redis-backed primary cache tier

use std::time::Duration;

use async_trait::async_trait;
use marketstream_models::Snapshot;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, AsyncIter, Client};
use tracing::info;

use crate::cache::{SnapshotStore, StoreResult};

pub const DEFAULT_KEY_PREFIX: &str = "market:data:";

/// Snapshots stored as wire JSON under `<prefix><symbol>` with a TTL.
pub struct RemoteStore {
    connection: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
}

impl RemoteStore {
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>, ttl: Duration) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        let key_prefix = key_prefix.into();

        info!("🗄️  Remote cache connected (prefix: {}, ttl: {}s)", key_prefix, ttl.as_secs());
        Ok(Self {
            connection,
            key_prefix,
            ttl,
        })
    }

    fn key(&self, symbol: &str) -> String {
        format!("{}{}", self.key_prefix, symbol)
    }
}

#[async_trait]
impl SnapshotStore for RemoteStore {
    async fn put(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let payload = snapshot.to_wire()?;
        let mut conn = self.connection.clone();

        redis::cmd("SET")
            .arg(self.key(&snapshot.symbol))
            .arg(payload)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, symbol: &str) -> StoreResult<Option<Snapshot>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(self.key(symbol)).await?;

        Ok(raw.map(|payload| Snapshot::from_wire(&payload)).transpose()?)
    }

    /// Removes this cache's keys only; other data in the database is left alone.
    async fn clear(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.key_prefix);

        let keys: Vec<String> = {
            let mut iter: AsyncIter<String> = conn.scan_match(&pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if !keys.is_empty() {
            let _: i64 = conn.del(&keys).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
