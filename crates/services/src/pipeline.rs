// Wires the producer and consumer together under one shutdown signal

use std::sync::Arc;

use marketstream_stream::Broadcaster;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::consumer::MarketDataConsumer;
use crate::producer::MarketDataProducer;

pub struct Pipeline {
    shutdown: CancellationToken,
    broadcaster: Arc<Broadcaster>,
    handles: Vec<(&'static str, JoinHandle<anyhow::Result<()>>)>,
}

impl Pipeline {
    pub fn spawn(producer: MarketDataProducer, consumer: MarketDataConsumer, broadcaster: Arc<Broadcaster>) -> Self {
        let shutdown = CancellationToken::new();

        let consumer_handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.start(shutdown).await })
        };
        let producer_handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { producer.start(shutdown).await })
        };

        Self {
            shutdown,
            broadcaster,
            handles: vec![("producer", producer_handle), ("consumer", consumer_handle)],
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops generation, lets the consumer settle what it holds, then closes every subscription.
    pub async fn shutdown(self) {
        info!("🛑 Shutting down pipeline...");
        self.shutdown.cancel();

        for (name, handle) in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("❌ {} exited with error: {}", name, e),
                Err(e) => error!("❌ {} task failed: {}", name, e),
            }
        }

        self.broadcaster.shutdown();
        info!("✅ Pipeline stopped");
    }
}
