use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use marketstream_models::{MarketStreamError, SymbolSpec, SymbolUniverse};
use marketstream_services::{ConsumerConfig, ProducerConfig, DEFAULT_KEY_PREFIX};
use marketstream_stream::RedisStreamConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub channel: ChannelConfig,
    pub generator: GeneratorConfig,
    pub cache: CacheConfig,
    pub consumer: ConsumerSettings,
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub backend: ChannelBackend,
    pub topic: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub max_len: usize,
    pub operation_timeout_ms: u64,
    pub claim_idle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub interval_ms: u64,
    /// Ordered universe; the built-in ten symbols when absent.
    pub symbols: Option<Vec<SymbolConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    pub base_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub key_prefix: String,
    pub remote_enabled: bool,
    pub operation_timeout_ms: u64,
    pub fallback_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub poll_block_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub capacity: usize,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.cors_origins", vec!["http://localhost:3000", "http://localhost:8080"])?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("channel.backend", "redis")?
            .set_default("channel.topic", "market-data")?
            .set_default("channel.consumer_group", "marketstream-consumer-group")?
            .set_default("channel.consumer_name", "marketstream-consumer-1")?
            .set_default("channel.max_len", 10_000)?
            .set_default("channel.operation_timeout_ms", 2000)?
            .set_default("channel.claim_idle_ms", 30_000)?
            .set_default("generator.interval_ms", 1000)?
            .set_default("cache.ttl_secs", 300)?
            .set_default("cache.key_prefix", DEFAULT_KEY_PREFIX)?
            .set_default("cache.remote_enabled", true)?
            .set_default("cache.operation_timeout_ms", 250)?
            .set_default("consumer.workers", 4)?
            .set_default("consumer.batch_size", 64)?
            .set_default("consumer.poll_block_ms", 500)?
            .set_default("broadcast.capacity", 1024)?
            // Add in settings from configuration file
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from environment variables, e.g. MARKETSTREAM__CHANNEL__BACKEND=memory
            .add_source(Environment::with_prefix("MARKETSTREAM").separator("__").try_parsing(true))
            .build()?;

        config.try_deserialize()
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), MarketStreamError> {
        let positive = [
            ("generator.interval_ms", self.generator.interval_ms),
            ("cache.ttl_secs", self.cache.ttl_secs),
            ("consumer.workers", self.consumer.workers as u64),
            ("consumer.batch_size", self.consumer.batch_size as u64),
            ("broadcast.capacity", self.broadcast.capacity as u64),
            ("channel.operation_timeout_ms", self.channel.operation_timeout_ms),
            ("channel.claim_idle_ms", self.channel.claim_idle_ms),
            ("cache.operation_timeout_ms", self.cache.operation_timeout_ms),
        ];

        for (key, value) in positive {
            if value == 0 {
                return Err(MarketStreamError::Config(format!("{} must be greater than zero", key)));
            }
        }
        if self.channel.topic.trim().is_empty() {
            return Err(MarketStreamError::Config("channel.topic must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn universe(&self) -> Result<SymbolUniverse, MarketStreamError> {
        match &self.generator.symbols {
            Some(symbols) => SymbolUniverse::new(
                symbols
                    .iter()
                    .map(|s| SymbolSpec::new(s.symbol.clone(), s.base_price))
                    .collect(),
            ),
            None => SymbolUniverse::new(SymbolUniverse::default_specs()),
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            interval_ms: self.generator.interval_ms,
            publish_timeout_ms: self.channel.operation_timeout_ms,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            workers: self.consumer.workers,
            batch_size: self.consumer.batch_size,
            poll_block_ms: self.consumer.poll_block_ms,
            channel_timeout_ms: self.channel.operation_timeout_ms,
        }
    }

    pub fn redis_stream_config(&self) -> RedisStreamConfig {
        RedisStreamConfig {
            stream_key: self.channel.topic.clone(),
            consumer_group: self.channel.consumer_group.clone(),
            consumer_name: self.channel.consumer_name.clone(),
            max_len: self.channel.max_len,
            claim_idle: Duration::from_millis(self.channel.claim_idle_ms),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache.operation_timeout_ms)
    }

    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
