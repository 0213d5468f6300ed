use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Broadcasts session events to every connected RPC client.
///
/// Each event carries a `sequence` number that increases strictly within a
/// single session, starting at 0, so a client that reconnects can tell the
/// daemon "I last saw sequence N" and either resume or be told to refetch.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
    sequences: std::sync::Arc<Mutex<HashMap<String, i64>>>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            sequences: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Emit one event for `session_id`, returning the sequence number it was
    /// assigned. Silently drops the event if nobody is subscribed.
    pub fn broadcast(&self, event_type: &str, session_id: &str, data: Value) -> i64 {
        let sequence = self.next_sequence(session_id);
        let envelope = json!({
            "type": event_type,
            "session_id": session_id,
            "data": data,
            "sequence": sequence,
        });
        let _ = self.tx.send(envelope.to_string());
        sequence
    }

    fn next_sequence(&self, session_id: &str) -> i64 {
        let mut map = self.sequences.lock().unwrap();
        let slot = map.entry(session_id.to_string()).or_insert(0);
        let seq = *slot;
        *slot += 1;
        seq
    }

    /// Forget a session's sequence counter (called on delete, so a reused
    /// session id — which cannot happen with UUIDs, but keeps this honest —
    /// starts clean).
    pub fn forget(&self, session_id: &str) {
        self.sequences.lock().unwrap().remove(session_id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_increases_per_session_independently() {
        let b = EventBroadcaster::new();
        assert_eq!(b.broadcast("session.messageCreated", "s1", json!({})), 0);
        assert_eq!(b.broadcast("session.messageCreated", "s1", json!({})), 1);
        assert_eq!(b.broadcast("session.messageCreated", "s2", json!({})), 0);
    }
}
