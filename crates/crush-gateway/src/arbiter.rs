// SPDX-License-Identifier: MIT
//! C3 — Permission Arbiter.
//!
//! Mediates between a running tool call (waiting inside the agent loop) and
//! a human client. Exactly one waiter exists per request id; `resolve` is a
//! no-op for unknown or terminal ids; a decision delivered by `resolve` is
//! authoritative even if a timeout has begun — the race is settled by a
//! single `std::sync::Mutex` guarding each request's state, so whichever
//! side observes `Pending` first wins the transition atomically
//! (SPEC_FULL.md §4.3, testable property 4).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use ulid::Ulid;

use crush_config::PermissionConfig;
use crush_core::{PermissionDecision, PermissionGate, PermissionRequest};

use crate::bus::Bus;
use crate::event_log::EventLog;
use crate::model::{EventKind, PermissionRequestRecord, PermissionState};

struct PendingEntry {
    record: PermissionRequestRecord,
    sender: Option<oneshot::Sender<PermissionDecision>>,
}

pub struct Arbiter {
    pending: DashMap<String, Mutex<PendingEntry>>,
    timeout: Duration,
    log: EventLog,
    bus: Bus,
}

impl Arbiter {
    pub fn new(config: &PermissionConfig, log: EventLog, bus: Bus) -> Self {
        Self { pending: DashMap::new(), timeout: Duration::from_secs(config.timeout_secs), log, bus }
    }

    #[cfg(test)]
    fn with_timeout(timeout: Duration, log: EventLog, bus: Bus) -> Self {
        Self { pending: DashMap::new(), timeout, log, bus }
    }

    /// Called by the gateway when a `permission_response` frame arrives.
    /// No-op if `request_id` is unknown or already in a terminal state.
    pub fn resolve(&self, request_id: &str, granted: bool) {
        let Some(entry) = self.pending.get(request_id) else { return };
        let decision_and_state = {
            let mut guard = entry.value().lock().expect("arbiter mutex poisoned");
            if guard.record.state != PermissionState::Pending {
                return;
            }
            guard.record.state = if granted { PermissionState::Granted } else { PermissionState::Denied };
            let sender = guard.sender.take();
            (sender, guard.record.state, guard.record.session_id.clone())
        };
        let (sender, state, session_id) = decision_and_state;
        if let Some(tx) = sender {
            let decision = if granted { PermissionDecision::Granted } else { PermissionDecision::Denied };
            let _ = tx.send(decision);
        }
        self.log_resolution(&session_id, request_id, state);
    }

    /// Still-pending or re-armable requests for a session, returned to the
    /// gateway at reconnect time.
    pub fn reopen(&self, session_id: &str) -> Vec<PermissionRequestRecord> {
        self.pending
            .iter()
            .filter_map(|kv| {
                let guard = kv.value().lock().expect("arbiter mutex poisoned");
                if guard.record.session_id == session_id && !guard.record.state.is_terminal() {
                    Some(guard.record.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    async fn request_internal(&self, req: PermissionRequest) -> PermissionDecision {
        let id = Ulid::new().to_string();
        let (tx, rx) = oneshot::channel();
        let record = PermissionRequestRecord {
            id: id.clone(),
            session_id: req.session_id.clone(),
            tool_call_id: req.tool_call_id.clone(),
            tool_name: req.tool_name.clone(),
            description: req.description.clone(),
            params: req.params.clone(),
            created_at: chrono::Utc::now(),
            state: PermissionState::Pending,
        };
        self.pending.insert(id.clone(), Mutex::new(PendingEntry { record: record.clone(), sender: Some(tx) }));
        if let Ok(ev) = self.log.append(
            &req.session_id,
            EventKind::PermissionRequest,
            serde_json::json!({
                "id": id, "tool_call_id": req.tool_call_id, "tool_name": req.tool_name,
                "description": req.description, "params": req.params,
            }),
        ) {
            self.bus.publish(&req.session_id, ev);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => PermissionDecision::Denied,
            Err(_elapsed) => self.suspend(&id),
        }
    }

    /// Invoked on timeout: atomically transitions `pending` → `timed_out`
    /// unless a concurrent `resolve` already won the race, in which case the
    /// already-committed terminal state is read back instead of overwritten.
    fn suspend(&self, id: &str) -> PermissionDecision {
        let Some(entry) = self.pending.get(id) else { return PermissionDecision::TimedOut };
        let mut guard = entry.value().lock().expect("arbiter mutex poisoned");
        if guard.record.state == PermissionState::Pending {
            guard.record.state = PermissionState::TimedOut;
            guard.sender = None;
            let session_id = guard.record.session_id.clone();
            drop(guard);
            self.log_resolution(&session_id, id, PermissionState::TimedOut);
            PermissionDecision::TimedOut
        } else {
            match guard.record.state {
                PermissionState::Granted => PermissionDecision::Granted,
                PermissionState::Denied => PermissionDecision::Denied,
                _ => PermissionDecision::TimedOut,
            }
        }
    }

    fn log_resolution(&self, session_id: &str, request_id: &str, state: PermissionState) {
        if let Ok(ev) = self.log.append(
            session_id,
            EventKind::PermissionResolved,
            serde_json::json!({ "id": request_id, "state": state }),
        ) {
            self.bus.publish(session_id, ev);
        }
    }
}

#[async_trait]
impl PermissionGate for Arbiter {
    async fn request(&self, req: PermissionRequest) -> PermissionDecision {
        self.request_internal(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> PermissionRequest {
        PermissionRequest {
            session_id: "s1".into(),
            tool_call_id: "tc1".into(),
            tool_name: "run_terminal_command".into(),
            description: "rm file.txt".into(),
            params: serde_json::json!({}),
        }
    }

    fn arbiter(timeout: Duration) -> Arc<Arbiter> {
        let log = EventLog::open_in_memory(30, 50_000).unwrap();
        let bus = Bus::new();
        Arc::new(Arbiter::with_timeout(timeout, log, bus))
    }

    #[tokio::test]
    async fn resolve_grants_before_timeout() {
        let arb = arbiter(Duration::from_secs(5));
        let arb2 = arb.clone();
        let handle = tokio::spawn(async move { arb2.request_internal(req()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = arb.pending.iter().next().unwrap().key().clone();
        arb.resolve(&id, true);
        let decision = handle.await.unwrap();
        assert_eq!(decision, PermissionDecision::Granted);
    }

    #[tokio::test]
    async fn resolve_denies() {
        let arb = arbiter(Duration::from_secs(5));
        let arb2 = arb.clone();
        let handle = tokio::spawn(async move { arb2.request_internal(req()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = arb.pending.iter().next().unwrap().key().clone();
        arb.resolve(&id, false);
        assert_eq!(handle.await.unwrap(), PermissionDecision::Denied);
    }

    #[tokio::test]
    async fn times_out_when_nobody_resolves() {
        let arb = arbiter(Duration::from_millis(20));
        let decision = arb.request_internal(req()).await;
        assert_eq!(decision, PermissionDecision::TimedOut);
    }

    #[tokio::test]
    async fn resolve_is_noop_for_unknown_id() {
        let arb = arbiter(Duration::from_secs(5));
        arb.resolve("does-not-exist", true); // must not panic
    }

    #[tokio::test]
    async fn resolve_is_noop_after_timeout_already_fired() {
        let arb = arbiter(Duration::from_millis(20));
        let decision = arb.request_internal(req()).await;
        assert_eq!(decision, PermissionDecision::TimedOut);
        let id = arb.pending.iter().next().unwrap().key().clone();
        arb.resolve(&id, true); // must be a no-op; state already terminal
        let guard = arb.pending.get(&id).unwrap();
        let guard = guard.value().lock().unwrap();
        assert_eq!(guard.record.state, PermissionState::TimedOut);
    }

    #[tokio::test]
    async fn reopen_returns_only_pending_for_session() {
        let arb = arbiter(Duration::from_secs(5));
        let arb2 = arb.clone();
        let handle = tokio::spawn(async move { arb2.request_internal(req()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = arb.reopen("s1");
        assert_eq!(pending.len(), 1);
        let id = pending[0].id.clone();
        arb.resolve(&id, true);
        handle.await.unwrap();
        assert!(arb.reopen("s1").is_empty());
    }
}
