use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use marketstream_models::{Snapshot, SymbolSpec, SymbolUniverse, Topic};
use marketstream_services::{
    ConsumerConfig, Disposition, FallbackStore, LocalStore, MarketDataConsumer, MarketDataProducer, Pipeline,
    PipelineMetrics, ProducerConfig, SnapshotStore, StoreError, StoreResult,
};
use marketstream_stream::{Broadcaster, ChannelMessage, InMemoryChannel, MessageChannel};

const NO_WAIT: Duration = Duration::from_millis(1);

/// Primary tier that is always down.
struct UnreachableStore;

#[async_trait]
impl SnapshotStore for UnreachableStore {
    async fn put(&self, _snapshot: &Snapshot) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _symbol: &str) -> StoreResult<Option<Snapshot>> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn clear(&self) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

struct TestPipeline {
    channel: Arc<InMemoryChannel>,
    cache: Arc<dyn SnapshotStore>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<PipelineMetrics>,
    producer: MarketDataProducer,
    consumer: MarketDataConsumer,
}

fn create_test_pipeline(specs: Vec<SymbolSpec>, cache: Arc<dyn SnapshotStore>) -> TestPipeline {
    let channel = Arc::new(InMemoryChannel::default());
    let broadcaster = Broadcaster::new(256);
    let metrics = Arc::new(PipelineMetrics::new().unwrap());
    let universe = Arc::new(SymbolUniverse::new(specs).unwrap());

    let producer = MarketDataProducer::new(
        channel.clone(),
        universe,
        metrics.clone(),
        Some(ProducerConfig {
            interval_ms: 25,
            ..ProducerConfig::default()
        }),
    );
    let consumer = MarketDataConsumer::new(
        channel.clone(),
        cache.clone(),
        broadcaster.clone(),
        metrics.clone(),
        Some(ConsumerConfig {
            poll_block_ms: 10,
            ..ConsumerConfig::default()
        }),
    );

    TestPipeline {
        channel,
        cache,
        broadcaster,
        metrics,
        producer,
        consumer,
    }
}

fn local_cache() -> Arc<dyn SnapshotStore> {
    Arc::new(FallbackStore::local_only(Arc::new(LocalStore::new())))
}

async fn drain(pipeline: &TestPipeline) -> Vec<Disposition> {
    let mut dispositions = Vec::new();
    for delivery in pipeline.channel.poll(1_000, NO_WAIT).await.unwrap() {
        dispositions.push(pipeline.consumer.handle(delivery).await);
    }
    dispositions
}

#[tokio::test]
async fn test_single_tick_end_to_end() {
    let pipeline = create_test_pipeline(vec![SymbolSpec::new("AAPL", dec!(150.00))], local_cache());
    let mut aapl = pipeline.broadcaster.subscribe(Topic::symbol("AAPL"));

    let report = pipeline.producer.tick().await;
    assert_eq!(report.published, 1);
    assert_eq!(drain(&pipeline).await, vec![Disposition::Processed]);

    let broadcast = aapl.recv().await.unwrap();
    assert!(broadcast.price >= dec!(142.50) && broadcast.price <= dec!(157.50));
    assert!((1000..=9999).contains(&broadcast.volume));
    assert!(broadcast.bid_price <= broadcast.price && broadcast.price <= broadcast.ask_price);

    let cached = pipeline.cache.get("AAPL").await.unwrap().unwrap();
    assert_eq!(&cached, broadcast.as_ref());
    assert_eq!(pipeline.producer.last_price("AAPL"), Some(cached.price));
}

#[tokio::test]
async fn test_malformed_message_is_skipped() {
    let pipeline = create_test_pipeline(vec![SymbolSpec::new("MSFT", dec!(300.00))], local_cache());

    pipeline.channel.publish("MSFT", "{\"symbol\":").await.unwrap();
    pipeline.producer.tick().await;

    assert_eq!(
        drain(&pipeline).await,
        vec![Disposition::Dropped, Disposition::Processed]
    );
    assert!(pipeline.cache.get("MSFT").await.unwrap().is_some());
    assert_eq!(pipeline.channel.in_flight_len(), 0);
    assert_eq!(pipeline.metrics.malformed.get(), 1);
    assert_eq!(pipeline.metrics.consumed.get(), 1);
}

#[tokio::test]
async fn test_every_subscriber_sees_every_snapshot() {
    let pipeline = create_test_pipeline(SymbolUniverse::default_specs(), local_cache());
    let mut all_subscribers: Vec<_> = (0..5).map(|_| pipeline.broadcaster.subscribe(Topic::All)).collect();
    let mut tsla = pipeline.broadcaster.subscribe(Topic::symbol("TSLA"));

    for _ in 0..3 {
        pipeline.producer.tick().await;
    }
    assert_eq!(drain(&pipeline).await.len(), 30);

    for subscriber in &mut all_subscribers {
        let mut received = 0;
        while subscriber.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 30);
    }

    let mut tsla_prices = Vec::new();
    while let Some(snapshot) = tsla.try_recv() {
        assert_eq!(snapshot.symbol, "TSLA");
        tsla_prices.push(snapshot.price);
    }
    assert_eq!(tsla_prices.len(), 3);
    assert_eq!(pipeline.producer.last_price("TSLA"), tsla_prices.last().copied());
}

#[tokio::test]
async fn test_remote_outage_falls_back_to_local_tier() {
    let fallback = Arc::new(LocalStore::new());
    let cache: Arc<dyn SnapshotStore> = Arc::new(FallbackStore::new(
        Arc::new(UnreachableStore),
        fallback.clone(),
        Duration::from_millis(50),
    ));
    let pipeline = create_test_pipeline(SymbolUniverse::default_specs(), cache);

    pipeline.producer.tick().await;
    let dispositions = drain(&pipeline).await;

    assert!(dispositions.iter().all(|d| *d == Disposition::Processed));
    assert_eq!(fallback.len(), 10);
    assert!(pipeline.cache.get("RELIANCE").await.unwrap().is_some());
}

#[tokio::test]
async fn test_redelivered_duplicate_is_harmless() {
    let pipeline = create_test_pipeline(vec![SymbolSpec::new("NFLX", dec!(400.00))], local_cache());
    let snapshot = pipeline.producer.generate("NFLX").unwrap();
    let message = ChannelMessage::from_snapshot(&snapshot).unwrap();

    pipeline.channel.publish(&message.key, &message.payload).await.unwrap();
    pipeline.channel.publish(&message.key, &message.payload).await.unwrap();

    assert_eq!(
        drain(&pipeline).await,
        vec![Disposition::Processed, Disposition::Processed]
    );
    assert_eq!(pipeline.cache.get("NFLX").await.unwrap(), Some(snapshot));
}

#[tokio::test]
async fn test_running_pipeline_keeps_symbol_order() {
    let pipeline = create_test_pipeline(
        vec![
            SymbolSpec::new("NVDA", dec!(450.00)),
            SymbolSpec::new("TATAINFY", dec!(25.00)),
        ],
        local_cache(),
    );
    let mut nvda = pipeline.broadcaster.subscribe(Topic::symbol("NVDA"));

    let running = Pipeline::spawn(
        pipeline.producer.clone(),
        pipeline.consumer.clone(),
        pipeline.broadcaster.clone(),
    );

    let mut received = Vec::new();
    while received.len() < 4 {
        let snapshot = tokio::time::timeout(Duration::from_secs(5), nvda.recv())
            .await
            .expect("NVDA snapshots should keep arriving")
            .unwrap();
        received.push(snapshot);
    }
    running.shutdown().await;

    for pair in received.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
        // Each step starts from the previous price
        let expected = (pair[0].price + pair[1].change).max(dec!(1.00));
        assert_eq!(pair[1].price, expected);
    }
    assert!(pipeline.metrics.ticks.get() >= 4);
}

#[tokio::test]
async fn test_consumer_stops_on_cancel() {
    let pipeline = create_test_pipeline(vec![SymbolSpec::new("AMZN", dec!(3200.00))], local_cache());
    let shutdown = CancellationToken::new();

    let handle = {
        let consumer = pipeline.consumer.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.start(shutdown).await })
    };

    shutdown.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(stopped.is_ok());
}
