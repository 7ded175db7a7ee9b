// SPDX-License-Identifier: MIT
//! C6 — in-process pub/sub bus feeding live WebSocket fan-out.
//!
//! Concrete mapping per SPEC_FULL.md §5: a `dashmap::DashMap<SessionId,
//! broadcast::Sender<Event>>` registry so attach/detach for one session never
//! contends with an unrelated session's publish. The log (`EventLog`) is the
//! source of truth; this bus is a live optimisation layered on top of it —
//! callers always append to the log before publishing here (`Coordinator`
//! enforces the ordering), so a subscriber can never observe an event the
//! log doesn't yet have durably.

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 1024;

/// Per-session broadcast registry. Cloning is cheap (`Arc`-backed internally
/// via `DashMap`); share one instance across the gateway.
#[derive(Clone, Default)]
pub struct Bus {
    channels: std::sync::Arc<DashMap<String, broadcast::Sender<Event>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self { channels: std::sync::Arc::new(DashMap::new()) }
    }

    /// Publish an event to a session's subscribers. A session with no
    /// subscribers is a no-op (the `send` error from zero receivers is
    /// intentionally ignored — there is nothing live to deliver to).
    pub fn publish(&self, session_id: &str, event: Event) {
        if let Some(tx) = self.channels.get(session_id) {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to a session's live event stream, creating its channel on
    /// first subscriber. A slow subscriber that falls more than
    /// `CHANNEL_CAPACITY` events behind observes `RecvError::Lagged` and must
    /// re-subscribe with its last cursor via `Coordinator::reconnect`.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Event> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Number of live subscribers for a session (0 if the channel doesn't
    /// exist yet).
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels.get(session_id).map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;

    fn event(session_id: &str, stream_id: i64) -> Event {
        Event {
            stream_id,
            session_id: session_id.into(),
            kind: EventKind::MessageDelta,
            payload: serde_json::json!({}),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = Bus::new();
        let mut rx = bus.subscribe("s1");
        bus.publish("s1", event("s1", 1));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.stream_id, 1);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let bus = Bus::new();
        bus.publish("s1", event("s1", 1));
        assert_eq!(bus.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn subscribers_are_isolated_per_session() {
        let bus = Bus::new();
        let mut rx_a = bus.subscribe("a");
        let mut rx_b = bus.subscribe("b");
        bus.publish("a", event("a", 1));
        assert_eq!(rx_a.recv().await.unwrap().session_id, "a");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn lagging_subscriber_observes_lagged_error() {
        let bus = Bus::new();
        let mut rx = bus.subscribe("s1");
        for i in 0..(CHANNEL_CAPACITY as i64 + 10) {
            bus.publish("s1", event("s1", i));
        }
        let result = rx.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }
}
