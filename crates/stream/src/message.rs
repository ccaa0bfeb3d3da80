// Message serialization and deserialization

use marketstream_models::{Result, Snapshot};

/// A record ready to be published: keyed by symbol, JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub key: String,
    pub payload: String,
}

impl ChannelMessage {
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        Ok(Self {
            key: snapshot.symbol.clone(),
            payload: snapshot.to_wire()?,
        })
    }
}

/// A message handed out by a channel, awaiting `ack` or `nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub key: String,
    pub payload: String,
    /// Set when the channel has handed this message out before.
    pub redelivered: bool,
}

impl Delivery {
    pub fn decode(&self) -> Result<Snapshot> {
        Snapshot::from_wire(&self.payload)
    }
}
