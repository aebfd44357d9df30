//! Abort Registry (C1) — process-wide map from session id to abort
//! timestamp, plus a broadcast of `aborted(sessionId)` events.
//!
//! This is the single source of truth for "does the current turn for this
//! session need to unwind". No other component may infer abort from any
//! other signal (a tool erroring, a channel closing, etc).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

/// Millisecond timestamp, matching the rest of the core's time fields.
pub type Timestamp = i64;

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct AbortedEvent {
    pub session_id: String,
    pub timestamp: Timestamp,
}

/// Process-wide registry of in-flight aborts.
///
/// `entries` guards only the map; the broadcast channel has its own interior
/// synchronization, so `mark_aborted` never holds the map lock across an
/// await point.
pub struct AbortRegistry {
    entries: Mutex<HashMap<String, Timestamp>>,
    events: broadcast::Sender<AbortedEvent>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            events: tx,
        }
    }

    /// Subscribe to `aborted(sessionId)` events emitted by every `mark_aborted`
    /// call, including re-marks.
    pub fn subscribe(&self) -> broadcast::Receiver<AbortedEvent> {
        self.events.subscribe()
    }

    /// Idempotent: re-marking an already-aborted session updates the
    /// timestamp and re-emits the event.
    pub fn mark_aborted(&self, session_id: &str) -> Timestamp {
        let ts = now_ms();
        self.entries
            .lock()
            .expect("abort registry lock poisoned")
            .insert(session_id.to_string(), ts);
        // A lagging/closed receiver is not an error for the marker.
        let _ = self.events.send(AbortedEvent {
            session_id: session_id.to_string(),
            timestamp: ts,
        });
        ts
    }

    pub fn is_aborted(&self, session_id: &str) -> bool {
        self.entries
            .lock()
            .expect("abort registry lock poisoned")
            .contains_key(session_id)
    }

    pub fn abort_timestamp(&self, session_id: &str) -> Option<Timestamp> {
        self.entries
            .lock()
            .expect("abort registry lock poisoned")
            .get(session_id)
            .copied()
    }

    /// Clears the abort entry for a session. Called by the runner when
    /// starting a fresh turn, and by the Session Manager on deletion.
    pub fn clear(&self, session_id: &str) {
        self.entries
            .lock()
            .expect("abort registry lock poisoned")
            .remove(session_id);
    }

    /// Resolves once `session_id` is marked aborted. Used by the runner to
    /// race a suspending operation (an LLM call, a tool future) against
    /// cancellation. Checks the current state first so a session already
    /// aborted before this call resolves immediately rather than waiting for
    /// the next broadcast.
    pub async fn aborted(&self, session_id: &str) {
        if self.is_aborted(session_id) {
            return;
        }
        let mut rx = self.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) if event.session_id == session_id => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.is_aborted(session_id) {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

impl Default for AbortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_then_is_aborted() {
        let registry = AbortRegistry::new();
        assert!(!registry.is_aborted("s1"));
        registry.mark_aborted("s1");
        assert!(registry.is_aborted("s1"));
    }

    #[test]
    fn clear_resets_abort_state() {
        let registry = AbortRegistry::new();
        registry.mark_aborted("s1");
        registry.clear("s1");
        assert!(!registry.is_aborted("s1"));
    }

    #[test]
    fn remark_updates_timestamp_and_is_idempotent_in_shape() {
        let registry = AbortRegistry::new();
        let t1 = registry.mark_aborted("s1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let t2 = registry.mark_aborted("s1");
        assert!(t2 >= t1);
        assert!(registry.is_aborted("s1"));
    }

    #[tokio::test]
    async fn subscribers_observe_abort_events() {
        let registry = AbortRegistry::new();
        let mut rx = registry.subscribe();
        registry.mark_aborted("s1");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, "s1");
    }
}
