// Message channel abstraction: ordered per key, at-least-once delivery

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{timeout, timeout_at, Instant};

use crate::message::Delivery;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Channel operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel is closed")]
    Closed,
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// The durable boundary between the producer and the consumer.
///
/// Implementations hand out messages in publish order per key and keep every
/// delivery until it is acknowledged; a `nack`ed delivery comes back later.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Appends a message and returns its channel id.
    async fn publish(&self, key: &str, payload: &str) -> ChannelResult<String>;

    /// Waits up to `block` for messages and returns at most `max` of them.
    async fn poll(&self, max: usize, block: Duration) -> ChannelResult<Vec<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()>;

    async fn nack(&self, delivery: &Delivery) -> ChannelResult<()>;

    fn name(&self) -> &'static str;
}

/// Runs a channel operation, giving up after `limit`.
pub async fn bounded<T, F>(limit: Duration, operation: F) -> ChannelResult<T>
where
    F: Future<Output = ChannelResult<T>>,
{
    timeout(limit, operation)
        .await
        .unwrap_or(Err(ChannelError::Timeout(limit)))
}

#[derive(Debug, Clone)]
struct Entry {
    offset: u64,
    key: String,
    payload: String,
    attempts: u32,
}

#[derive(Debug)]
struct InFlight {
    entry: Entry,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct ChannelState {
    next_offset: u64,
    ready: VecDeque<Entry>,
    in_flight: HashMap<String, InFlight>,
    closed: bool,
}

impl ChannelState {
    /// Deliveries nobody settled within the visibility timeout go back to the head.
    fn requeue_expired(&mut self, visibility_timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| now.duration_since(flight.delivered_at) >= visibility_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return;
        }

        let mut entries: Vec<Entry> = expired
            .iter()
            .filter_map(|id| self.in_flight.remove(id))
            .map(|flight| flight.entry)
            .collect();
        entries.sort_by_key(|entry| entry.offset);

        for entry in entries.into_iter().rev() {
            self.ready.push_front(entry);
        }
    }

    fn take(&mut self, max: usize) -> Vec<Delivery> {
        let count = max.min(self.ready.len());
        let now = Instant::now();
        let batch: Vec<Entry> = self.ready.drain(..count).collect();

        batch
            .into_iter()
            .map(|mut entry| {
                entry.attempts += 1;
                let delivery = Delivery {
                    id: entry.offset.to_string(),
                    key: entry.key.clone(),
                    payload: entry.payload.clone(),
                    redelivered: entry.attempts > 1,
                };
                self.in_flight
                    .insert(delivery.id.clone(), InFlight { entry, delivered_at: now });
                delivery
            })
            .collect()
    }
}

/// In-process broker with the same contract as the Redis stream backend.
///
/// A single FIFO log keeps publish order for every key. Unsettled deliveries
/// return to the head of the log on `nack` or once the visibility timeout passes.
#[derive(Debug)]
pub struct InMemoryChannel {
    state: Mutex<ChannelState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryChannel {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Messages waiting to be handed out.
    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Messages handed out but not yet settled.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Stops accepting publishes; pollers drain what is left, then see `Closed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn publish(&self, key: &str, payload: &str) -> ChannelResult<String> {
        let offset = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ChannelError::Closed);
            }
            let offset = state.next_offset;
            state.next_offset += 1;
            state.ready.push_back(Entry {
                offset,
                key: key.to_string(),
                payload: payload.to_string(),
                attempts: 0,
            });
            offset
        };

        self.notify.notify_one();
        Ok(offset.to_string())
    }

    async fn poll(&self, max: usize, block: Duration) -> ChannelResult<Vec<Delivery>> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before checking state so a publish in between is not missed
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                state.requeue_expired(self.visibility_timeout);
                if !state.ready.is_empty() {
                    return Ok(state.take(max.max(1)));
                }
                if state.closed {
                    return Err(ChannelError::Closed);
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        // Settling an unknown id is a no-op: duplicates are expected under at-least-once
        self.state.lock().in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> ChannelResult<()> {
        let returned = {
            let mut state = self.state.lock();
            match state.in_flight.remove(&delivery.id) {
                Some(flight) => {
                    state.ready.push_front(flight.entry);
                    true
                }
                None => false,
            }
        };

        if returned {
            self.notify.notify_one();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
