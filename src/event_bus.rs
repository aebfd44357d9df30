//! Event Bus (C10) — topic-keyed, synchronous, in-process pub/sub.
//!
//! Handlers run in emission order on the emitting task. A handler that
//! panics is caught and logged so it cannot prevent later handlers, or the
//! emitter itself, from continuing — the spec treats this as "exception in
//! one handler must not prevent later handlers".

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Subscription {
    id: u64,
    handler: Handler,
}

/// A handle returned from `on`; dropping it does not unsubscribe. Call
/// `unsubscribe` explicitly, mirroring the "subscribe returns an unregister
/// handle" operations in §4.3/§4.10.
pub struct Unsubscribe {
    topic: String,
    id: u64,
    bus: EventBusHandle,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.bus.off(&self.topic, self.id);
    }
}

#[derive(Clone)]
struct EventBusHandle(Arc<Mutex<HashMap<String, Vec<Subscription>>>>);

impl EventBusHandle {
    fn off(&self, topic: &str, id: u64) {
        let mut topics = self.0.lock().expect("event bus lock poisoned");
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
    }
}

/// Topic-keyed synchronous in-process event bus.
pub struct EventBus {
    handle: EventBusHandle,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handle: EventBusHandle(Arc::new(Mutex::new(HashMap::new()))),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn on<F>(&self, topic: &str, handler: F) -> Unsubscribe
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handle
            .0
            .lock()
            .expect("event bus lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });

        Unsubscribe {
            topic: topic.to_string(),
            id,
            bus: self.handle.clone(),
        }
    }

    pub fn off(&self, topic: &str, id: u64) {
        self.handle.off(topic, id);
    }

    /// Emits `payload` on `topic` to every current subscriber, in
    /// subscription order. A handler panic is caught and logged; it never
    /// aborts the emission.
    pub fn emit(&self, topic: &str, payload: Value) {
        let handlers: Vec<Handler> = {
            let topics = self.handle.0.lock().expect("event bus lock poisoned");
            topics
                .get(topic)
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&payload)));
            if let Err(panic) = result {
                tracing::error!(topic, ?panic, "event bus handler panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emits_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.on("t", move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        bus.on("t", move |_| o2.lock().unwrap().push(2));

        bus.emit("t", json!({}));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = bus.on("t", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("t", json!({}));
        sub.unsubscribe();
        bus.emit("t", json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on("t", |_| panic!("boom"));
        let c = count.clone();
        bus.on("t", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("t", json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
