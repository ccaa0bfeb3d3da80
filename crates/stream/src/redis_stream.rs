// Redis streaming implementation

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisResult};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelResult, MessageChannel};
use crate::message::Delivery;

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";
const SWEEP_BATCH: usize = 256;

pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    pub stream_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Approximate upper bound on stream length, enforced on every `XADD`.
    pub max_len: usize,
    /// Pending entries idle this long are handed out again.
    pub claim_idle: Duration,
}

/// Ids owed to this consumer: nacked, recovered at startup, or found idle.
#[derive(Debug, Default)]
struct ReclaimQueue {
    ids: VecDeque<String>,
}

impl ReclaimQueue {
    fn push(&mut self, id: String) {
        if !self.ids.contains(&id) {
            self.ids.push_back(id);
        }
    }

    fn take(&mut self, max: usize) -> Vec<String> {
        let count = max.min(self.ids.len());
        self.ids.drain(..count).collect()
    }

    /// Puts ids back at the head in their original order.
    fn restore(&mut self, ids: Vec<String>) {
        for id in ids.into_iter().rev() {
            if !self.ids.contains(&id) {
                self.ids.push_front(id);
            }
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Message channel on a Redis stream with a consumer group.
///
/// Reads and writes use separate connections so a blocking `XREADGROUP`
/// never stalls publishes or acknowledgements queued behind it.
///
/// Every entry handed to this consumer stays in the group's pending list
/// until acked. Failed claims go back on the reclaim queue, and a periodic
/// sweep claims entries left idle longer than `claim_idle`, so nothing is
/// stranded by a failed or abandoned poll.
pub struct RedisStream {
    writer: ConnectionManager,
    reader: ConnectionManager,
    config: RedisStreamConfig,
    reclaim: Mutex<ReclaimQueue>,
    last_sweep: Mutex<Instant>,
}

impl RedisStream {
    pub async fn connect(redis_url: &str, config: RedisStreamConfig) -> ChannelResult<Self> {
        let client = Client::open(redis_url)?;
        let writer = ConnectionManager::new(client.clone()).await?;
        let reader = ConnectionManager::new(client).await?;

        let stream = Self {
            writer,
            reader,
            config,
            reclaim: Mutex::new(ReclaimQueue::default()),
            last_sweep: Mutex::new(Instant::now()),
        };
        stream.ensure_group().await?;
        stream.recover_pending().await?;

        info!(
            "🔄 Redis stream '{}' ready (group: {}, consumer: {})",
            stream.config.stream_key, stream.config.consumer_group, stream.config.consumer_name
        );
        Ok(stream)
    }

    /// Ids waiting to be claimed again.
    pub fn reclaim_len(&self) -> usize {
        self.reclaim.lock().len()
    }

    async fn ensure_group(&self) -> ChannelResult<()> {
        let mut conn = self.writer.clone();
        let created: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.stream_key, &self.config.consumer_group, "$")
            .await;

        match created {
            Ok(()) => {
                debug!("Created consumer group {}", self.config.consumer_group);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Queues entries this consumer received before a restart but never acknowledged.
    async fn recover_pending(&self) -> ChannelResult<()> {
        let mut conn = self.reader.clone();
        let options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_name)
            .count(self.config.max_len);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream_key], &["0"], &options)
            .await?;

        let ids: Vec<String> = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|stream| stream.ids)
                    .map(|entry| entry.id)
                    .collect()
            })
            .unwrap_or_default();

        if !ids.is_empty() {
            info!("♻️  Recovering {} unacknowledged messages", ids.len());
            let mut queue = self.reclaim.lock();
            for id in ids {
                queue.push(id);
            }
        }
        Ok(())
    }

    fn sweep_due(&self) -> bool {
        let mut last = self.last_sweep.lock();
        if last.elapsed() >= self.config.claim_idle {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    /// Queues this consumer's pending entries that nobody settled within `claim_idle`.
    async fn sweep_idle(&self, conn: &mut ConnectionManager) -> ChannelResult<()> {
        let reply: StreamPendingCountReply = conn
            .xpending_consumer_count(
                &self.config.stream_key,
                &self.config.consumer_group,
                "-",
                "+",
                SWEEP_BATCH,
                &self.config.consumer_name,
            )
            .await?;

        let idle_ms = self.config.claim_idle.as_millis();
        let stale: Vec<String> = reply
            .ids
            .into_iter()
            .filter(|pending| pending.last_delivered_ms as u128 >= idle_ms)
            .map(|pending| pending.id)
            .collect();

        if !stale.is_empty() {
            warn!("♻️ Reclaiming {} idle pending messages", stale.len());
            self.reclaim.lock().restore(stale);
        }
        Ok(())
    }

    fn to_delivery(entry: &StreamId, redelivered: bool) -> Delivery {
        // Entries missing fields still surface so the consumer can drop and ack them
        Delivery {
            id: entry.id.clone(),
            key: entry.get(KEY_FIELD).unwrap_or_default(),
            payload: entry.get(PAYLOAD_FIELD).unwrap_or_default(),
            redelivered,
        }
    }

    async fn reclaim_pending(&self, conn: &mut ConnectionManager, max: usize) -> ChannelResult<Vec<Delivery>> {
        let ids = self.reclaim.lock().take(max);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: RedisResult<StreamClaimReply> = conn
            .xclaim(
                &self.config.stream_key,
                &self.config.consumer_group,
                &self.config.consumer_name,
                0,
                &ids[..],
            )
            .await;

        match claimed {
            Ok(claimed) => Ok(claimed
                .ids
                .iter()
                .map(|entry| Self::to_delivery(entry, true))
                .collect()),
            Err(e) => {
                self.reclaim.lock().restore(ids);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl MessageChannel for RedisStream {
    async fn publish(&self, key: &str, payload: &str) -> ChannelResult<String> {
        let mut conn = self.writer.clone();
        let id: String = conn
            .xadd_maxlen(
                &self.config.stream_key,
                StreamMaxlen::Approx(self.config.max_len),
                "*",
                &[(KEY_FIELD, key), (PAYLOAD_FIELD, payload)],
            )
            .await?;
        Ok(id)
    }

    async fn poll(&self, max: usize, block: Duration) -> ChannelResult<Vec<Delivery>> {
        let mut conn = self.reader.clone();

        if self.sweep_due() {
            if let Err(e) = self.sweep_idle(&mut conn).await {
                warn!("⚠️ Pending sweep failed: {}", e);
            }
        }

        let mut deliveries = self.reclaim_pending(&mut conn, max).await?;
        if deliveries.len() >= max {
            return Ok(deliveries);
        }

        // BLOCK 0 would wait forever; reclaimed work should not wait at all
        let block = if deliveries.is_empty() { block } else { Duration::ZERO };
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX).max(1);
        let options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_name)
            .count(max - deliveries.len())
            .block(block_ms);

        let reply: Option<StreamReadReply> = match conn
            .xread_options(&[&self.config.stream_key], &[">"], &options)
            .await
        {
            Ok(reply) => reply,
            Err(e) if deliveries.is_empty() => return Err(e.into()),
            Err(e) => {
                // Claimed entries are already ours; hand them out rather than strand them
                warn!("⚠️ Stream read failed after reclaiming {} messages: {}", deliveries.len(), e);
                return Ok(deliveries);
            }
        };

        if let Some(reply) = reply {
            deliveries.extend(
                reply
                    .keys
                    .iter()
                    .flat_map(|stream| stream.ids.iter())
                    .map(|entry| Self::to_delivery(entry, false)),
            );
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        let mut conn = self.writer.clone();
        let _: i64 = conn
            .xack(&self.config.stream_key, &self.config.consumer_group, &[&delivery.id])
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> ChannelResult<()> {
        // The entry stays in the group's pending list; the next poll claims it again
        self.reclaim.lock().push(delivery.id.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
