use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::models::event::Envelope;

const HUB_CAPACITY: usize = 1024;

/// Fan-out of server events to every connected observer. Publishing never
/// blocks: a slow observer falls behind on its own broadcast receiver and
/// recovers with a fresh snapshot (see `server::ws`), it cannot stall
/// producers or other observers.
#[derive(Debug, Clone)]
pub struct Hub {
    sender: broadcast::Sender<Envelope>,
    next_observer_id: Arc<AtomicU64>,
}

impl Hub {
    pub fn new() -> Hub {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Hub {
            sender,
            next_observer_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Joins the event stream. The receiver sees every event published after
    /// this call, in publish order.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn next_observer_id(&self) -> u64 {
        self.next_observer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: &str, payload: serde_json::Value) {
        let envelope = Envelope::new(event, payload);
        // Err only means nobody is connected right now
        if let Err(e) = self.sender.send(envelope) {
            log::debug!("[Hub] No observers for {event}: {e}");
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides whether a bus event should be forwarded to an observer whose init
/// snapshot already covered part of the output stream. Output chunks at or
/// below the snapshot cursor are duplicates; every other event type carries a
/// full record and is safe to apply again.
pub fn should_forward(envelope: &Envelope, cursors: &HashMap<String, u64>) -> bool {
    if envelope.event != "task:output" {
        return true;
    }
    let task_id = match envelope.payload.get("taskId").and_then(|v| v.as_str()) {
        Some(id) => id,
        None => return true,
    };
    let seq = match envelope.payload.get("seq").and_then(|v| v.as_u64()) {
        Some(seq) => seq,
        None => return true,
    };
    match cursors.get(task_id) {
        Some(cursor) => seq > *cursor,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let hub = Hub::new();
        let mut rx_a = hub.subscribe();
        let mut rx_b = hub.subscribe();

        for seq in 1..=5u64 {
            hub.publish("task:output", json!({"taskId": "t", "seq": seq, "chunk": "x"}));
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for expected in 1..=5u64 {
                let envelope = rx.recv().await.expect("recv");
                assert_eq!(envelope.event, "task:output");
                assert_eq!(envelope.payload["seq"], expected);
            }
        }
    }

    #[tokio::test]
    async fn observer_ids_are_unique() {
        let hub = Hub::new();
        let a = hub.next_observer_id();
        let b = hub.next_observer_id();
        assert_ne!(a, b);
    }

    #[test]
    fn snapshot_cursor_filters_covered_output() {
        let cursors = HashMap::from([("t1".to_string(), 3u64)]);

        let covered = Envelope::new("task:output", json!({"taskId": "t1", "seq": 3}));
        let fresh = Envelope::new("task:output", json!({"taskId": "t1", "seq": 4}));
        let other_task = Envelope::new("task:output", json!({"taskId": "t2", "seq": 1}));
        let state_event = Envelope::new("task:stateChanged", json!({"taskId": "t1"}));

        assert!(!should_forward(&covered, &cursors));
        assert!(should_forward(&fresh, &cursors));
        assert!(should_forward(&other_task, &cursors));
        assert!(should_forward(&state_event, &cursors));
    }
}
