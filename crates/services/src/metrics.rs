use std::time::Instant;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStats {
    pub uptime_seconds: u64,
    pub ticks: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub consumed: u64,
    pub malformed: u64,
    pub retried: u64,
    pub broadcast_deliveries: u64,
}

/// Prometheus counters for the produce/consume pipeline.
pub struct PipelineMetrics {
    registry: Registry,
    start_time: Instant,
    pub ticks: IntCounter,
    pub published: IntCounter,
    pub publish_failures: IntCounter,
    pub consumed: IntCounter,
    pub malformed: IntCounter,
    pub retried: IntCounter,
    pub broadcast_deliveries: IntCounter,
    pub tick_duration: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl PipelineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("marketstream".to_string()), None)?;

        let tick_duration = Histogram::with_opts(
            HistogramOpts::new("tick_duration_seconds", "Time spent generating and publishing one tick")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        )?;
        registry.register(Box::new(tick_duration.clone()))?;

        Ok(Self {
            ticks: counter(&registry, "ticks_total", "Generation ticks run")?,
            published: counter(&registry, "published_total", "Snapshots published to the channel")?,
            publish_failures: counter(&registry, "publish_failures_total", "Snapshots that failed to publish")?,
            consumed: counter(&registry, "consumed_total", "Snapshots cached and broadcast")?,
            malformed: counter(&registry, "malformed_total", "Undecodable messages dropped")?,
            retried: counter(&registry, "retried_total", "Messages left unacknowledged for redelivery")?,
            broadcast_deliveries: counter(
                &registry,
                "broadcast_deliveries_total",
                "Snapshots handed to live subscribers",
            )?,
            tick_duration,
            registry,
            start_time: Instant::now(),
        })
    }

    /// Prometheus text exposition of every pipeline metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            ticks: self.ticks.get(),
            published: self.published.get(),
            publish_failures: self.publish_failures.get(),
            consumed: self.consumed.get(),
            malformed: self.malformed.get(),
            retried: self.retried.get(),
            broadcast_deliveries: self.broadcast_deliveries.get(),
        }
    }

    pub fn log_summary(&self) {
        let stats = self.stats();

        info!("📈 Pipeline Summary:");
        info!("   Ticks: {}", stats.ticks);
        info!("   Published: {} ({} failed)", stats.published, stats.publish_failures);
        info!("   Consumed: {}", stats.consumed);
        info!("   Malformed dropped: {}", stats.malformed);
        info!("   Redelivery requests: {}", stats.retried);
        info!("   Broadcast deliveries: {}", stats.broadcast_deliveries);
        info!("   Uptime: {} seconds", stats.uptime_seconds);
    }
}
