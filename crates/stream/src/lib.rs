pub mod channel;
pub mod redis_stream;
pub mod event_bus;
pub mod message;

pub use channel::*;
pub use redis_stream::*;
pub use event_bus::*;
pub use message::*;
