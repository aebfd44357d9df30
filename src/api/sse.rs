//! Bridges the Agent Service's in-process event bus (C10) to Server-Sent
//! Events for a single session, mirroring the teacher's `api/sse.rs`
//! broadcast-to-SSE conversion.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::event_bus::Unsubscribe;

use super::AppState;

/// Topics re-emitted on the Agent Service bus (spec §6); a session's SSE
/// feed is all of these filtered down to its own `sessionId`.
const SESSION_TOPICS: &[&str] = &[
    "processing:started",
    "processing:completed",
    "processing:error",
    "processing:aborted",
    "tool:execution:created",
    "tool:execution:started",
    "tool:execution:completed",
    "tool:execution:error",
    "tool:execution:aborted",
    "permission:requested",
    "permission:resolved",
    "fast_edit_mode_enabled",
    "fast_edit_mode_disabled",
    "environment_status_changed",
];

/// Owns both the broadcast receiver and the bus subscriptions feeding it,
/// so the subscriptions are torn down the moment a client disconnects and
/// this stream is dropped. `Unsubscribe::unsubscribe` consumes `self`, so
/// the teardown happens in `Drop` rather than relying on a plain field drop.
struct SessionEventStream {
    inner: BroadcastStream<(String, Value)>,
    subs: Vec<Unsubscribe>,
}

impl Stream for SessionEventStream {
    type Item = Result<(String, Value), BroadcastStreamRecvError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SessionEventStream {
    fn drop(&mut self) {
        for sub in self.subs.drain(..) {
            sub.unsubscribe();
        }
    }
}

pub async fn stream_session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = broadcast::channel::<(String, Value)>(256);

    let mut subs = Vec::with_capacity(SESSION_TOPICS.len());
    for topic in SESSION_TOPICS {
        let tx = tx.clone();
        let topic = (*topic).to_string();
        subs.push(state.service.events.on(topic.as_str(), move |payload| {
            // Every payload this bus carries is normalised to include
            // `sessionId` (see AgentService::normalize_execution and the
            // processing:* emit sites); drop anything that isn't ours.
            let _ = tx.send((topic.clone(), payload.clone()));
        }));
    }

    let session_id_filter = session_id.clone();
    let events = SessionEventStream {
        inner: BroadcastStream::new(rx),
        subs,
    }
    .filter_map(move |result| match result {
        Ok((topic, payload)) => {
            let matches = payload
                .get("sessionId")
                .and_then(Value::as_str)
                .map(|id| id == session_id_filter)
                .unwrap_or(false);
            matches.then(|| Ok(sse_event(&topic, &payload)))
        }
        Err(_) => None, // lagged: client missed events, keep streaming fresh ones
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

fn sse_event(topic: &str, payload: &Value) -> Event {
    Event::default().event(topic).data(payload.to_string())
}
