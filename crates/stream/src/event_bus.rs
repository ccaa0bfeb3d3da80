// Event bus for live fan-out of snapshots to topic subscribers

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::Stream;
use marketstream_models::{Snapshot, Topic};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Topic-based publish/subscribe hub.
///
/// Each topic owns a bounded broadcast ring. Publishing never waits on a
/// subscriber: one that falls more than `capacity` messages behind loses the
/// oldest ones and keeps going.
pub struct Broadcaster {
    topics: DashMap<Topic, broadcast::Sender<Arc<Snapshot>>>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        })
    }

    /// Delivers to every current subscriber of `topic`; returns how many received it.
    pub fn publish(&self, topic: &Topic, snapshot: &Arc<Snapshot>) -> usize {
        // Clone the sender so the registry shard is not held while sending
        let Some(sender) = self.topics.get(topic).map(|entry| entry.value().clone()) else {
            return 0;
        };

        match sender.send(snapshot.clone()) {
            Ok(receivers) => receivers,
            Err(_) => {
                self.prune(topic);
                0
            }
        }
    }

    /// Fans a snapshot out to `market-data.<symbol>` and `market-data.all`.
    pub fn publish_snapshot(&self, snapshot: Snapshot) -> usize {
        let snapshot = Arc::new(snapshot);
        Topic::fan_out(&snapshot)
            .iter()
            .map(|topic| self.publish(topic, &snapshot))
            .sum()
    }

    pub fn subscribe(self: &Arc<Self>, topic: Topic) -> Subscription {
        let receiver = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        debug!("➕ New subscriber on {}", topic);
        Subscription {
            topic,
            receiver: Some(receiver),
            hub: Arc::downgrade(self),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |entry| entry.value().receiver_count())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Drops every topic; subscribers drain what is queued and then end.
    pub fn shutdown(&self) {
        let topics = self.topics.len();
        self.topics.clear();
        debug!("Broadcaster closed {} topics", topics);
    }

    fn prune(&self, topic: &Topic) {
        self.topics
            .remove_if(topic, |_, sender| sender.receiver_count() == 0);
    }
}

/// Live handle on one topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    receiver: Option<broadcast::Receiver<Arc<Snapshot>>>,
    hub: Weak<Broadcaster>,
    missed: u64,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Snapshots skipped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Next snapshot on the topic, or `None` once unsubscribed or the hub shut down.
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                    warn!("⚠️ Subscriber on {} lagged, skipped {} snapshots", self.topic, skipped);
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<Snapshot>> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(TryRecvError::Lagged(skipped)) => self.missed += skipped,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Releases the queue slot. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        drop(receiver);

        if let Some(hub) = self.hub.upgrade() {
            hub.prune(&self.topic);
        }
        debug!("➖ Subscriber left {}", self.topic);
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Snapshot>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            let next = subscription.recv().await;
            next.map(|snapshot| (snapshot, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
