// SPDX-License-Identifier: MIT
//! Durable data-model types owned by the gateway: the persisted `Event`
//! record (§3) and the permission-request record tracked by the arbiter.

use serde::{Deserialize, Serialize};

/// A single entry in a session's durable, append-only event log.
///
/// `stream_id` is monotonic per session and assigned by [`crate::event_log::EventLog::append`]
/// inside the same transaction as the insert, so it is never reused or
/// skipped under concurrent callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub stream_id: i64,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageDelta,
    MessageFinal,
    ToolCallStarted,
    ToolResult,
    PermissionRequest,
    PermissionResolved,
    SessionUpdate,
    GenerationComplete,
    Error,
}

/// Terminal/non-terminal state of a permission request, as persisted by the
/// arbiter (C3). Exactly one of the terminal states is ever reached per
/// request (testable property 4, SPEC_FULL.md §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Pending,
    Granted,
    Denied,
    TimedOut,
    Cancelled,
}

impl PermissionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PermissionState::Pending)
    }
}

/// The full permission-request record tracked by the arbiter, as opposed to
/// [`crush_core::PermissionRequest`] which is the transient in-process value
/// the agent loop hands to the `PermissionGate` trait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequestRecord {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub description: String,
    pub params: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub state: PermissionState,
}
