mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use config::{AppConfig, ChannelBackend};
use marketstream_api::{create_app, AppState};
use marketstream_services::{
    FallbackStore, LocalStore, MarketDataConsumer, MarketDataProducer, Pipeline, PipelineMetrics, RemoteStore,
    SnapshotStore,
};
use marketstream_stream::{Broadcaster, InMemoryChannel, MessageChannel, RedisStream};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketstream=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting MarketStream market data feed");

    // Load configuration
    let config = AppConfig::new()?;
    config.validate()?;
    let universe = Arc::new(config.universe()?);
    info!("✅ Configuration loaded successfully");
    info!("🔄 Redis: {}", config.redis_url());
    info!("📡 Channel: {:?} (topic {})", config.channel.backend, config.channel.topic);
    info!("📊 Symbols: {}", universe.symbols().collect::<Vec<_>>().join(", "));
    info!("🌐 Server will bind to: {}", config.server_addr());

    let metrics = Arc::new(PipelineMetrics::new()?);
    let broadcaster = Broadcaster::new(config.broadcast.capacity);
    let channel = connect_channel(&config).await?;
    let cache = build_cache(&config).await;

    let producer = MarketDataProducer::new(
        channel.clone(),
        universe.clone(),
        metrics.clone(),
        Some(config.producer_config()),
    );
    let consumer = MarketDataConsumer::new(
        channel,
        cache.clone(),
        broadcaster.clone(),
        metrics.clone(),
        Some(config.consumer_config()),
    );
    let pipeline = Pipeline::spawn(producer, consumer, broadcaster.clone());

    let state = AppState {
        cache,
        broadcaster,
        universe,
        metrics: metrics.clone(),
    };
    let app = create_app(state, &config.server.cors_origins);

    let listener = tokio::net::TcpListener::bind(config.server_addr()).await?;
    info!("🌐 Listening on {}", listener.local_addr()?);

    let mut server = {
        let shutdown = pipeline.shutdown_token();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        })
    };

    info!("✅ All services started successfully");
    info!("⌨️  Press Ctrl+C to stop");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("👋 Shutting down gracefully");
        }
        served = &mut server => {
            error!("❌ HTTP server stopped unexpectedly: {:?}", served);
        }
    }

    // Closing the broadcaster ends open feeds, which lets the server finish
    pipeline.shutdown().await;
    if !server.is_finished() {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("❌ HTTP server error: {}", e),
            Err(e) => error!("❌ HTTP server task failed: {}", e),
        }
    }

    metrics.log_summary();
    Ok(())
}

async fn connect_channel(config: &AppConfig) -> Result<Arc<dyn MessageChannel>> {
    match config.channel.backend {
        ChannelBackend::Memory => {
            info!("📦 Using in-process message channel");
            Ok(Arc::new(InMemoryChannel::default()))
        }
        ChannelBackend::Redis => {
            let stream = RedisStream::connect(config.redis_url(), config.redis_stream_config()).await?;
            Ok(Arc::new(stream))
        }
    }
}

async fn build_cache(config: &AppConfig) -> Arc<dyn SnapshotStore> {
    let fallback: Arc<dyn SnapshotStore> = match config.cache.fallback_ttl_secs {
        Some(secs) => Arc::new(LocalStore::with_ttl(Duration::from_secs(secs))),
        None => Arc::new(LocalStore::new()),
    };

    if !config.cache.remote_enabled {
        info!("🗄️  Remote cache disabled, using in-process cache");
        return Arc::new(FallbackStore::local_only(fallback));
    }

    match RemoteStore::connect(config.redis_url(), config.cache.key_prefix.clone(), config.cache_ttl()).await {
        Ok(remote) => Arc::new(FallbackStore::new(Arc::new(remote), fallback, config.cache_timeout())),
        Err(e) => {
            warn!("⚠️ Remote cache unavailable, using in-process cache only: {}", e);
            Arc::new(FallbackStore::local_only(fallback))
        }
    }
}
