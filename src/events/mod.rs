//! Run events and the process-local publish/subscribe bus.
//!
//! Every emission writes to two topics: the run-specific one and the
//! aggregate `all`. Delivery is synchronous best-effort into each
//! subscriber's own queue; closed subscribers are pruned on publish.
//! Events carry a monotonic ULID, so consumers can sort across publishers.

pub mod reporter;
pub mod ulid;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use ulid::new_ulid;

/// The aggregate topic every event is mirrored to.
pub const TOPIC_ALL: &str = "all";

/// Event types emitted over a run's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunCompleted,
    TaskStarted,
    TaskCompleted,
    TaskOutput,
    GateWaiting,
    GateResolved,
}

/// One event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic ULID; total order within the emitting process.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_id: String,
    /// Emitting node's name.
    pub node: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, run_id: &str, node: &str, data: serde_json::Value) -> Self {
        Self {
            id: new_ulid(),
            kind,
            run_id: run_id.to_string(),
            node: node.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Process-local pub/sub over unbounded per-subscriber queues.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<DashMap<String, Vec<mpsc::UnboundedSender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topic name for one run's events.
    pub fn run_topic(run_id: &str) -> String {
        format!("run:{}", run_id)
    }

    /// Subscribe to a topic; the receiver gets every event published after
    /// this call.
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Publish to the run topic and mirror to `all`.
    pub fn publish(&self, event: Event) {
        self.deliver(&Self::run_topic(&event.run_id), &event);
        self.deliver(TOPIC_ALL, &event);
    }

    fn deliver(&self, topic: &str, event: &Event) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Number of live subscribers on a topic (diagnostics).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, run_id: &str) -> Event {
        Event::new(kind, run_id, "local", json!({}))
    }

    #[tokio::test]
    async fn publish_reaches_run_topic_and_all() {
        let bus = EventBus::new();
        let mut run_rx = bus.subscribe(&EventBus::run_topic("r1"));
        let mut all_rx = bus.subscribe(TOPIC_ALL);

        bus.publish(event(EventKind::RunStarted, "r1"));

        assert_eq!(run_rx.recv().await.unwrap().kind, EventKind::RunStarted);
        assert_eq!(all_rx.recv().await.unwrap().kind, EventKind::RunStarted);
    }

    #[tokio::test]
    async fn other_runs_do_not_cross_topics() {
        let bus = EventBus::new();
        let mut r1 = bus.subscribe(&EventBus::run_topic("r1"));

        bus.publish(event(EventKind::RunStarted, "r2"));
        bus.publish(event(EventKind::RunStarted, "r1"));

        let received = r1.recv().await.unwrap();
        assert_eq!(received.run_id, "r1");
        assert!(r1.try_recv().is_err());
    }

    #[tokio::test]
    async fn publisher_order_is_preserved_per_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(TOPIC_ALL);

        bus.publish(event(EventKind::RunStarted, "r"));
        bus.publish(event(EventKind::TaskStarted, "r"));
        bus.publish(event(EventKind::TaskCompleted, "r"));
        bus.publish(event(EventKind::RunCompleted, "r"));

        let mut kinds = Vec::new();
        for _ in 0..4 {
            kinds.push(rx.recv().await.unwrap().kind);
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::RunStarted,
                EventKind::TaskStarted,
                EventKind::TaskCompleted,
                EventKind::RunCompleted
            ]
        );
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(TOPIC_ALL);
        drop(rx);

        bus.publish(event(EventKind::RunStarted, "r"));
        assert_eq!(bus.subscriber_count(TOPIC_ALL), 0);
    }

    #[tokio::test]
    async fn event_ids_sort_in_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(TOPIC_ALL);

        for _ in 0..10 {
            bus.publish(event(EventKind::TaskOutput, "r"));
        }

        let mut last = String::new();
        for _ in 0..10 {
            let id = rx.recv().await.unwrap().id;
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn event_serializes_with_snake_case_type() {
        let e = event(EventKind::TaskCompleted, "r1");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "task_completed");
        assert_eq!(json["run_id"], "r1");
        assert_eq!(json["id"].as_str().unwrap().len(), 26);
    }
}
