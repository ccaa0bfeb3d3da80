use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use marketstream_stream::{bounded, Broadcaster, ChannelError, Delivery, MessageChannel};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::SnapshotStore;
use crate::metrics::PipelineMetrics;

const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Parallel processing lanes. Every key maps to exactly one lane.
    pub workers: usize,
    pub batch_size: usize,
    pub poll_block_ms: u64,
    pub channel_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 64,
            poll_block_ms: 500,
            channel_timeout_ms: 2000,
        }
    }
}

/// Outcome of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Cached and broadcast; acknowledged.
    Processed,
    /// Undecodable; acknowledged so it is never seen again.
    Dropped,
    /// Could not be cached; left unacknowledged for redelivery.
    Retry,
}

/// Reads the channel, refreshes the cache and fans snapshots out to subscribers.
#[derive(Clone)]
pub struct MarketDataConsumer {
    channel: Arc<dyn MessageChannel>,
    store: Arc<dyn SnapshotStore>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<PipelineMetrics>,
    config: ConsumerConfig,
}

impl MarketDataConsumer {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn SnapshotStore>,
        broadcaster: Arc<Broadcaster>,
        metrics: Arc<PipelineMetrics>,
        config: Option<ConsumerConfig>,
    ) -> Self {
        Self {
            channel,
            store,
            broadcaster,
            metrics,
            config: config.unwrap_or_default(),
        }
    }

    /// Polls until `shutdown` fires or the channel closes.
    ///
    /// Deliveries are routed to lanes by key, so snapshots of one symbol are
    /// handled one at a time in channel order while different symbols
    /// proceed in parallel.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let workers = self.config.workers.max(1);
        info!("📥 Starting MarketDataConsumer");
        info!("⚙️  Workers: {}, batch size: {}", workers, self.config.batch_size);
        info!("📡 Channel: {}", self.channel.name());

        let mut lanes = Vec::with_capacity(workers);
        let mut pool = JoinSet::new();
        for lane in 0..workers {
            let (sender, mut receiver) = mpsc::channel::<Delivery>(self.config.batch_size.max(1));
            lanes.push(sender);

            let consumer = self.clone();
            pool.spawn(async move {
                while let Some(delivery) = receiver.recv().await {
                    consumer.handle(delivery).await;
                }
                debug!("Consumer lane {} drained", lane);
            });
        }

        let block = Duration::from_millis(self.config.poll_block_ms);
        let poll_limit = block + Duration::from_millis(self.config.channel_timeout_ms);

        loop {
            let polled = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                polled = bounded(poll_limit, self.channel.poll(self.config.batch_size.max(1), block)) => polled,
            };

            match polled {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        let lane = lane_for(&delivery.key, lanes.len());
                        if lanes[lane].send(delivery).await.is_err() {
                            error!("❌ Consumer lane {} is gone", lane);
                        }
                    }
                }
                Err(ChannelError::Closed) => {
                    info!("Channel closed, consumer stopping");
                    break;
                }
                Err(e) => {
                    warn!("⚠️ Poll failed: {}", e);
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        // Closing the lanes lets each worker finish what it already holds
        drop(lanes);
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!("❌ Consumer lane panicked: {}", e);
            }
        }

        info!("🛑 MarketDataConsumer stopped");
        Ok(())
    }

    /// Processes one delivery and settles it with the channel.
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let disposition = self.process(&delivery).await;
        let limit = Duration::from_millis(self.config.channel_timeout_ms);

        let settled = match disposition {
            Disposition::Processed | Disposition::Dropped => bounded(limit, self.channel.ack(&delivery)).await,
            Disposition::Retry => bounded(limit, self.channel.nack(&delivery)).await,
        };
        if let Err(e) = settled {
            // The channel redelivers anything left unsettled
            warn!("⚠️ Failed to settle message {} ({:?}): {}", delivery.id, disposition, e);
        }

        disposition
    }

    pub async fn process(&self, delivery: &Delivery) -> Disposition {
        let snapshot = match delivery.decode() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.malformed.inc();
                warn!("🗑️ Dropping malformed message {} for key {}: {}", delivery.id, delivery.key, e);
                return Disposition::Dropped;
            }
        };

        if let Err(e) = self.store.put(&snapshot).await {
            self.metrics.retried.inc();
            error!("❌ Failed to cache {}: {}", snapshot.symbol, e);
            return Disposition::Retry;
        }

        if delivery.redelivered {
            debug!("Reprocessed redelivered message {} for {}", delivery.id, snapshot.symbol);
        }

        let symbol = snapshot.symbol.clone();
        let delivered = self.broadcaster.publish_snapshot(snapshot);
        self.metrics.consumed.inc();
        self.metrics.broadcast_deliveries.inc_by(delivered as u64);
        debug!("📨 Processed {} ({} live subscribers)", symbol, delivered);

        Disposition::Processed
    }
}

/// Stable lane index for a message key.
pub fn lane_for(key: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LocalStore, MockSnapshotStore, StoreError};
    use marketstream_models::{wall_clock_now, Snapshot, Topic};
    use marketstream_stream::{ChannelMessage, InMemoryChannel};
    use rust_decimal_macros::dec;

    const NO_WAIT: Duration = Duration::from_millis(1);

    struct Harness {
        channel: Arc<InMemoryChannel>,
        store: Arc<LocalStore>,
        broadcaster: Arc<Broadcaster>,
        consumer: MarketDataConsumer,
    }

    fn harness() -> Harness {
        let channel = Arc::new(InMemoryChannel::default());
        let store = Arc::new(LocalStore::new());
        let broadcaster = Broadcaster::new(16);
        let consumer = MarketDataConsumer::new(
            channel.clone(),
            store.clone(),
            broadcaster.clone(),
            Arc::new(PipelineMetrics::new().unwrap()),
            Some(ConsumerConfig {
                poll_block_ms: 10,
                ..ConsumerConfig::default()
            }),
        );
        Harness {
            channel,
            store,
            broadcaster,
            consumer,
        }
    }

    async fn publish(channel: &InMemoryChannel, snapshot: &Snapshot) {
        let message = ChannelMessage::from_snapshot(snapshot).unwrap();
        channel.publish(&message.key, &message.payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_valid_delivery_is_cached_broadcast_and_acked() {
        let h = harness();
        let mut subscription = h.broadcaster.subscribe(Topic::symbol("AAPL"));
        let snapshot = Snapshot::baseline("AAPL", dec!(150.00), wall_clock_now());
        publish(&h.channel, &snapshot).await;

        let delivery = h.channel.poll(1, NO_WAIT).await.unwrap().remove(0);
        assert_eq!(h.consumer.handle(delivery).await, Disposition::Processed);

        assert_eq!(h.store.get("AAPL").await.unwrap(), Some(snapshot.clone()));
        assert_eq!(subscription.recv().await.unwrap().as_ref(), &snapshot);
        assert_eq!(h.channel.in_flight_len(), 0);
        assert_eq!(h.consumer.metrics.consumed.get(), 1);
        assert_eq!(h.consumer.metrics.broadcast_deliveries.get(), 1);
    }

    #[tokio::test]
    async fn test_malformed_delivery_is_dropped_and_acked() {
        let h = harness();
        h.channel.publish("AAPL", "{not json").await.unwrap();

        let delivery = h.channel.poll(1, NO_WAIT).await.unwrap().remove(0);
        assert_eq!(h.consumer.handle(delivery).await, Disposition::Dropped);

        assert!(h.store.is_empty());
        assert_eq!(h.channel.in_flight_len(), 0);
        assert_eq!(h.channel.ready_len(), 0);
        assert_eq!(h.consumer.metrics.malformed.get(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_message_for_redelivery() {
        let mut store = MockSnapshotStore::new();
        store
            .expect_put()
            .returning(|_| Err(StoreError::Unavailable("disk full".to_string())));

        let channel = Arc::new(InMemoryChannel::default());
        let broadcaster = Broadcaster::new(16);
        let mut subscription = broadcaster.subscribe(Topic::All);
        let consumer = MarketDataConsumer::new(
            channel.clone(),
            Arc::new(store),
            broadcaster.clone(),
            Arc::new(PipelineMetrics::new().unwrap()),
            None,
        );

        publish(&channel, &Snapshot::baseline("TSLA", dec!(800.00), wall_clock_now())).await;
        let delivery = channel.poll(1, NO_WAIT).await.unwrap().remove(0);
        assert_eq!(consumer.handle(delivery).await, Disposition::Retry);

        assert!(subscription.try_recv().is_none(), "nothing is broadcast before it is cached");
        let again = channel.poll(1, NO_WAIT).await.unwrap();
        assert!(again[0].redelivered);
        assert_eq!(consumer.metrics.retried.get(), 1);
    }

    #[tokio::test]
    async fn test_start_processes_until_cancelled() {
        let h = harness();
        let mut all = h.broadcaster.subscribe(Topic::All);
        let shutdown = CancellationToken::new();

        let handle = {
            let consumer = h.consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.start(shutdown).await })
        };

        let symbols = ["AAPL", "MSFT", "GOOGL", "AMZN", "TSLA"];
        for symbol in symbols {
            publish(&h.channel, &Snapshot::baseline(symbol, dec!(100.00), wall_clock_now())).await;
        }

        for _ in symbols {
            tokio::time::timeout(Duration::from_secs(5), all.recv())
                .await
                .expect("snapshot should be broadcast")
                .unwrap();
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(h.store.len(), symbols.len());
        assert_eq!(h.channel.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_same_key_is_applied_in_channel_order() {
        let h = harness();
        let shutdown = CancellationToken::new();

        let mut expected = Snapshot::baseline("NVDA", dec!(450.00), wall_clock_now());
        for cents in 0..20 {
            expected.price = dec!(450.00) + rust_decimal::Decimal::new(cents, 2);
            publish(&h.channel, &expected).await;
        }
        h.channel.close();

        h.consumer.start(shutdown).await.unwrap();

        assert_eq!(h.store.get("NVDA").await.unwrap(), Some(expected));
    }

    #[tokio::test]
    async fn test_closed_channel_stops_consumer() {
        let h = harness();
        h.channel.close();

        let finished = tokio::time::timeout(Duration::from_secs(5), h.consumer.start(CancellationToken::new())).await;
        assert!(finished.is_ok());
    }

    #[test]
    fn test_lane_for_is_stable_and_in_range() {
        for symbol in ["AAPL", "MSFT", "RELIANCE", "TATAINFY"] {
            let lane = lane_for(symbol, 4);
            assert!(lane < 4);
            assert_eq!(lane, lane_for(symbol, 4));
        }
        assert_eq!(lane_for("AAPL", 0), 0);
    }
}
