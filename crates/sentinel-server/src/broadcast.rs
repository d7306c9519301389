//! Topic-based best-effort pub/sub for live consumers (the external web UI
//! subscribes here). Lagging or absent subscribers lose messages; nothing in
//! the engine depends on delivery.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

pub struct Broadcaster {
    topics: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self { topics: Mutex::new(HashMap::new()), capacity }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<serde_json::Value> {
        let mut topics = self.topics.lock().expect("topics lock");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to one topic. Messages published before the subscription
    /// are not replayed.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<serde_json::Value> {
        self.sender(topic).subscribe()
    }

    /// Publish to a topic; a send with no subscribers is not an error.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let _ = self.sender(topic).send(payload);
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_their_topic_only() {
        let broadcaster = Broadcaster::default();
        let mut rollouts = broadcaster.subscribe("rollout.state_changed");
        let mut drift = broadcaster.subscribe("drift.detected");

        broadcaster.publish("rollout.state_changed", json!({"to": "completed"}));
        let got = rollouts.recv().await.expect("message");
        assert_eq!(got["to"], "completed");
        assert!(drift.try_recv().is_err());
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let broadcaster = Broadcaster::default();
        broadcaster.publish("rollout.state_changed", json!({}));
    }

    #[tokio::test]
    async fn multiple_subscribers_fan_out() {
        let broadcaster = Broadcaster::default();
        let mut a = broadcaster.subscribe("drift.detected");
        let mut b = broadcaster.subscribe("drift.detected");
        broadcaster.publish("drift.detected", json!({"node": 1}));
        assert_eq!(a.recv().await.expect("a")["node"], 1);
        assert_eq!(b.recv().await.expect("b")["node"], 1);
    }
}
