use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use marketstream_models::{Snapshot, SymbolUniverse};
use marketstream_stream::{bounded, ChannelMessage, MessageChannel};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::PipelineMetrics;
use crate::price_model;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub interval_ms: u64,
    pub publish_timeout_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000, // 1 second
            publish_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub published: usize,
    pub failed: usize,
}

/// Periodic driver that advances every symbol's price and publishes the result.
///
/// Ticks never overlap: each one runs to completion inside the timer loop and
/// a late tick pushes the schedule back instead of bunching up. Same-symbol
/// snapshots therefore always leave in timestamp order.
#[derive(Clone)]
pub struct MarketDataProducer {
    channel: Arc<dyn MessageChannel>,
    universe: Arc<SymbolUniverse>,
    last_prices: Arc<DashMap<String, Decimal>>,
    rng: Arc<Mutex<StdRng>>,
    metrics: Arc<PipelineMetrics>,
    config: ProducerConfig,
}

impl MarketDataProducer {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        universe: Arc<SymbolUniverse>,
        metrics: Arc<PipelineMetrics>,
        config: Option<ProducerConfig>,
    ) -> Self {
        let last_prices = universe
            .specs()
            .iter()
            .map(|spec| (spec.symbol.clone(), spec.base_price))
            .collect();

        Self {
            channel,
            universe,
            last_prices: Arc::new(last_prices),
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            metrics,
            config: config.unwrap_or_default(),
        }
    }

    /// Replaces the entropy-seeded generator, for reproducible runs.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.last_prices.get(symbol).map(|price| *price)
    }

    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        info!("🎯 Starting MarketDataProducer");
        info!("⚙️  Tick interval: {}ms", self.config.interval_ms);
        info!("📊 Symbols: {}", self.universe.len());
        info!("📡 Channel: {}", self.channel.name());

        let mut ticker = interval(Duration::from_millis(self.config.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.failed > 0 {
                        warn!("⚠️ Tick finished with {} of {} symbols failing",
                              report.failed, report.published + report.failed);
                    }
                }
            }
        }

        info!("🛑 MarketDataProducer stopped");
        Ok(())
    }

    /// Runs one generation pass over the whole universe.
    pub async fn tick(&self) -> TickReport {
        let timer = self.metrics.tick_duration.start_timer();
        let mut report = TickReport::default();

        for symbol in self.universe.symbols() {
            match self.generate_and_send(symbol).await {
                Ok(id) => {
                    report.published += 1;
                    self.metrics.published.inc();
                    debug!("📤 Market data sent for {} as {}", symbol, id);
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.publish_failures.inc();
                    error!("❌ Failed to send market data for {}: {}", symbol, e);
                }
            }
        }

        self.metrics.ticks.inc();
        timer.observe_duration();
        report
    }

    /// Advances one symbol's price. The map entry stays locked for the whole
    /// read-modify-write, so the step is atomic per symbol.
    pub fn generate(&self, symbol: &str) -> Option<Snapshot> {
        let mut last_price = self.last_prices.get_mut(symbol)?;
        let snapshot = {
            let mut rng = self.rng.lock();
            price_model::advance(&mut *rng, symbol, *last_price)
        };
        *last_price = snapshot.price;
        Some(snapshot)
    }

    async fn generate_and_send(&self, symbol: &str) -> Result<String> {
        let snapshot = self
            .generate(symbol)
            .ok_or_else(|| anyhow!("no price state for {}", symbol))?;
        let message = ChannelMessage::from_snapshot(&snapshot)?;

        let limit = Duration::from_millis(self.config.publish_timeout_ms);
        let id = bounded(limit, self.channel.publish(&message.key, &message.payload)).await?;
        Ok(id)
    }
}
