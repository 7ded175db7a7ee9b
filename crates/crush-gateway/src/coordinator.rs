// SPDX-License-Identifier: MIT
//! C8 — Session Coordinator.
//!
//! Owns per-session lifecycle: at most one active generation, cancellation,
//! permission resolution, and reconnect backfill. Each session owns exactly
//! one agent-loop task at a time (the single-writer discipline of
//! SPEC_FULL.md §5) and a persister that drains the loop's event channel,
//! appending every event to the durable log (C5) before publishing it to the
//! bus (C6) — in that order, so a subscriber never observes an event the log
//! doesn't yet have durably (§9 "Pub/Sub vs. log").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{info, warn};

use crush_core::{Agent, AgentEvent};

use crate::arbiter::Arbiter;
use crate::bus::Bus;
use crate::error::GatewayError;
use crate::event_log::EventLog;
use crate::model::{Event, EventKind, PermissionRequestRecord};

struct SessionEntry {
    agent: AsyncMutex<Agent>,
    generation_active: AtomicBool,
    cancel_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

/// Snapshot returned to a reconnecting client.
pub struct ReconnectInfo {
    pub backfill: Vec<Event>,
    pub generation_active: bool,
    pub last_stream_id: i64,
    pub pending_permissions: Vec<PermissionRequestRecord>,
}

pub struct SessionCoordinator {
    sessions: DashMap<String, Arc<SessionEntry>>,
    log: EventLog,
    bus: Bus,
    arbiter: Arc<Arbiter>,
}

impl SessionCoordinator {
    pub fn new(log: EventLog, bus: Bus, arbiter: Arc<Arbiter>) -> Self {
        Self { sessions: DashMap::new(), log, bus, arbiter }
    }

    pub fn register_session(&self, session_id: String, agent: Agent) {
        self.sessions.insert(
            session_id,
            Arc::new(SessionEntry {
                agent: AsyncMutex::new(agent),
                generation_active: AtomicBool::new(false),
                cancel_tx: std::sync::Mutex::new(None),
            }),
        );
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Start a new generation for `session_id`. Rejects with `BusyGeneration`
    /// if one is already running (Open Question (a) — rejected, not queued).
    pub async fn start_generation(&self, session_id: &str, user_message: &str) -> Result<(), GatewayError> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| e.clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;

        if entry
            .generation_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GatewayError::BusyGeneration(session_id.to_string()));
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        *entry.cancel_tx.lock().expect("cancel_tx mutex poisoned") = Some(cancel_tx);

        let (tx, rx) = mpsc::channel::<AgentEvent>(256);
        let persist_log = self.log.clone();
        let persist_bus = self.bus.clone();
        let persist_session = session_id.to_string();
        let persister = tokio::spawn(persist_events(persist_session, persist_log, persist_bus, rx));

        let session_id_owned = session_id.to_string();
        let user_message = user_message.to_string();
        tokio::spawn(async move {
            let result = {
                let mut agent = entry.agent.lock().await;
                agent.submit_with_cancel(&user_message, tx, cancel_rx).await
            };
            if let Err(e) = result {
                warn!(session_id = %session_id_owned, error = %e, "generation ended with an error");
            }
            entry.generation_active.store(false, Ordering::SeqCst);
            *entry.cancel_tx.lock().expect("cancel_tx mutex poisoned") = None;
            let _ = persister.await;
        });

        Ok(())
    }

    /// Idempotent: cancelling a session with no active generation is a no-op.
    pub fn cancel(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            if let Some(tx) = entry.cancel_tx.lock().expect("cancel_tx mutex poisoned").take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn resolve_permission(&self, request_id: &str, granted: bool) {
        self.arbiter.resolve(request_id, granted);
    }

    /// Live event stream for a session, used by the WebSocket handler once
    /// it has finished backfilling from the log.
    pub fn subscribe_bus(&self, session_id: &str) -> broadcast::Receiver<Event> {
        self.bus.subscribe(session_id)
    }

    pub fn is_generation_active(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|e| e.generation_active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Backfill events strictly greater than `cursor`, report whether a
    /// generation is currently live, and the session's current high-water
    /// mark — used to build the `reconnection_status` control frame (§6).
    pub fn reconnect(&self, session_id: &str, cursor: i64) -> Result<ReconnectInfo, GatewayError> {
        if !self.has_session(session_id) {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }
        let backfill = self.log.read_from(session_id, cursor, 10_000)?;
        let last_stream_id = self.log.last_stream_id(session_id)?;
        let pending_permissions = self.arbiter.reopen(session_id);
        Ok(ReconnectInfo {
            backfill,
            generation_active: self.is_generation_active(session_id),
            last_stream_id,
            pending_permissions,
        })
    }
}

/// Drains an agent loop's event channel, appending each event to the
/// durable log before publishing it to the bus — log append strictly
/// precedes publish so the at-least-once/never-early invariant holds.
async fn persist_events(session_id: String, log: EventLog, bus: Bus, mut rx: mpsc::Receiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
        let (kind, payload) = map_agent_event(&event);
        match log.append(&session_id, kind, payload) {
            Ok(persisted) => bus.publish(&session_id, persisted),
            Err(e) => warn!(session_id = %session_id, error = %e, "failed to persist agent event"),
        }
    }
    info!(session_id = %session_id, "generation event stream closed");
}

fn map_agent_event(event: &AgentEvent) -> (EventKind, serde_json::Value) {
    match event {
        AgentEvent::MessageDelta(text) => (EventKind::MessageDelta, serde_json::json!({ "text": text })),
        AgentEvent::MessageComplete(text) => (EventKind::MessageFinal, serde_json::json!({ "text": text })),
        AgentEvent::ReasoningDelta(text) => {
            (EventKind::MessageDelta, serde_json::json!({ "reasoning": text }))
        }
        AgentEvent::ReasoningComplete(text) => {
            (EventKind::MessageFinal, serde_json::json!({ "reasoning": text }))
        }
        AgentEvent::ToolCallStarted(tc) => (
            EventKind::ToolCallStarted,
            serde_json::json!({ "id": tc.id, "name": tc.name, "args": tc.args }),
        ),
        AgentEvent::ToolCallFinished { call_id, tool_name, output, is_error } => (
            EventKind::ToolResult,
            serde_json::json!({ "call_id": call_id, "tool_name": tool_name, "output": output, "is_error": is_error }),
        ),
        AgentEvent::ContextCompacted { tokens_before, tokens_after } => (
            EventKind::SessionUpdate,
            serde_json::json!({ "tokens_before": tokens_before, "tokens_after": tokens_after }),
        ),
        AgentEvent::TokenUsage { input, output, context_total, cache_read, cache_write } => (
            EventKind::SessionUpdate,
            serde_json::json!({
                "input": input, "output": output, "context_total": context_total,
                "cache_read": cache_read, "cache_write": cache_write,
            }),
        ),
        AgentEvent::TodoUpdate(todos) => (EventKind::SessionUpdate, serde_json::json!({ "todos": todos })),
        AgentEvent::GenerationComplete(outcome) => {
            (EventKind::GenerationComplete, serde_json::to_value(format!("{outcome:?}")).unwrap())
        }
        AgentEvent::Error(message) => (EventKind::Error, serde_json::json!({ "message": message })),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crush_config::{AgentConfig, PermissionConfig, ToolsConfig};
    use crush_core::{AgentRuntimeContext, AlwaysGrant, PermissionGate};
    use crush_model::ScriptedMockProvider;
    use crush_tools::{ToolPolicy, ToolRegistry};

    use super::*;

    fn make_agent(model: ScriptedMockProvider) -> Agent {
        let (_tx, rx) = mpsc::channel(16);
        Agent::new(
            Arc::new(model),
            Arc::new(ToolRegistry::default()),
            Arc::new(ToolPolicy::from_config(&ToolsConfig::default())),
            Arc::new(AgentConfig::default()),
            AgentRuntimeContext::default(),
            Arc::new(AlwaysGrant),
            rx,
            128_000,
        )
    }

    fn coordinator() -> SessionCoordinator {
        let log = EventLog::open_in_memory(30, 50_000).unwrap();
        let bus = Bus::new();
        let arbiter = Arc::new(Arbiter::new(&PermissionConfig::default(), log.clone(), bus.clone()));
        SessionCoordinator::new(log, bus, arbiter)
    }

    #[tokio::test]
    async fn start_generation_unknown_session_errors() {
        let coord = coordinator();
        let err = coord.start_generation("nope", "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn second_generation_while_active_is_rejected() {
        let coord = coordinator();
        coord.register_session("s1".into(), make_agent(ScriptedMockProvider::always_text("slow reply")));
        coord.start_generation("s1", "first").await.unwrap();
        let err = coord.start_generation("s1", "second").await.unwrap_err();
        assert!(matches!(err, GatewayError::BusyGeneration(_)));
    }

    #[tokio::test]
    async fn generation_completes_and_frees_the_slot() {
        let coord = coordinator();
        coord.register_session("s1".into(), make_agent(ScriptedMockProvider::always_text("done")));
        coord.start_generation("s1", "go").await.unwrap();
        for _ in 0..50 {
            if !coord.is_generation_active("s1") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!coord.is_generation_active("s1"));
    }

    #[tokio::test]
    async fn events_are_persisted_to_the_log() {
        let coord = coordinator();
        coord.register_session("s1".into(), make_agent(ScriptedMockProvider::always_text("hi there")));
        coord.start_generation("s1", "go").await.unwrap();
        for _ in 0..50 {
            if !coord.is_generation_active("s1") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let events = coord.log.read_from("s1", 0, 100).unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().any(|e| e.kind == EventKind::GenerationComplete));
    }

    #[tokio::test]
    async fn cancel_on_idle_session_is_a_noop() {
        let coord = coordinator();
        coord.register_session("s1".into(), make_agent(ScriptedMockProvider::always_text("hi")));
        coord.cancel("s1"); // must not panic
    }

    #[tokio::test]
    async fn reconnect_unknown_session_errors() {
        let coord = coordinator();
        assert!(coord.reconnect("nope", 0).is_err());
    }

    #[tokio::test]
    async fn reconnect_backfills_from_cursor() {
        let coord = coordinator();
        coord.register_session("s1".into(), make_agent(ScriptedMockProvider::always_text("hi")));
        coord.start_generation("s1", "go").await.unwrap();
        for _ in 0..50 {
            if !coord.is_generation_active("s1") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let info = coord.reconnect("s1", 0).unwrap();
        assert!(!info.backfill.is_empty());
        assert!(!info.generation_active);
        assert_eq!(info.last_stream_id, info.backfill.last().unwrap().stream_id);
    }

    #[tokio::test]
    async fn reconnect_reopens_pending_permission_requests() {
        let coord = coordinator();
        coord.register_session("s1".into(), make_agent(ScriptedMockProvider::always_text("hi")));
        let arbiter = coord.arbiter.clone();
        let req = crush_core::PermissionRequest {
            session_id: "s1".into(),
            tool_call_id: "tc1".into(),
            tool_name: "write".into(),
            description: "write a file".into(),
            params: serde_json::json!({}),
        };
        let arb_for_task = arbiter.clone();
        tokio::spawn(async move {
            let _ = arb_for_task.request(req).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let info = coord.reconnect("s1", 0).unwrap();
        assert_eq!(info.pending_permissions.len(), 1);
        assert_eq!(info.pending_permissions[0].tool_call_id, "tc1");
    }
}
