pub mod cache;
pub mod consumer;
pub mod metrics;
pub mod pipeline;
pub mod price_model;
pub mod producer;
pub mod redis_store;

pub use cache::*;
pub use consumer::*;
pub use metrics::*;
pub use pipeline::*;
pub use producer::*;
pub use redis_store::*;
