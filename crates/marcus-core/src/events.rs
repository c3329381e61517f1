//! Event Bus (C8, §4.8): in-process pub/sub. A slow subscriber never
//! blocks the publisher — each subscriber gets a bounded queue with a
//! drop-oldest policy and a dropped-count metric, implemented atop
//! `tokio::sync::broadcast`'s ring buffer (a lagging receiver observes
//! `RecvError::Lagged(n)` rather than blocking the sender).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventTopic {
    AssignmentAcquired,
    AssignmentReleased,
    AssignmentReverted,
    LeaseRenewed,
    LeaseExpired,
    LeaseHeartbeat,
    LeaseForcedRelease,
    TaskStarted,
    TaskProgress,
    TaskBlocked,
    TaskCompleted,
    DependencyInferred,
    ReconcilerReport,
    ProblemTask,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: EventTopic,
    pub payload: serde_json::Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

pub struct EventBus {
    sender: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// `queue_max` is the per-subscriber bounded capacity (§6.5
    /// `event_queue_max`, default 1000).
    pub fn new(queue_max: usize) -> Self {
        let (sender, _) = broadcast::channel(queue_max.max(1));
        Self { sender, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub async fn publish(&self, topic: EventTopic, payload: serde_json::Value) {
        let event = Event { topic, payload, published_at: chrono::Utc::now() };
        // No receivers is not an error: the bus has no subscribers yet.
        let _ = self.sender.send(event);
    }

    /// Subscribe to the bus. The returned handle transparently
    /// fast-forwards past dropped messages and records the drop count.
    pub fn subscribe(&self) -> Subscription {
        Subscription { receiver: self.sender.subscribe(), dropped: self.dropped.clone() }
    }

    /// Total number of events dropped across all subscribers due to lag.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Await the next event, skipping past any lag gaps (and recording
    /// them) rather than surfacing `Lagged` to the caller.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
