// SPDX-License-Identifier: MIT
use async_trait::async_trait;

/// A single permission request raised by the agent loop before dispatching a
/// tool call whose policy resolved to `Ask`.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    /// Human-readable summary shown to the client (e.g. the shell command,
    /// or "write to src/main.rs").
    pub description: String,
    pub params: serde_json::Value,
}

/// Outcome of a permission request, resolved by the connected client (or by
/// a timeout) through the session coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied,
    TimedOut,
}

/// The seam between the agent loop (C7) and the permission arbiter (C3).
///
/// `crush-gateway` provides the production implementation: it registers the
/// request, notifies the connected client, and waits for a
/// `permission_response` frame or the configured timeout. Tests use an
/// in-memory gate that always grants or always denies.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request(&self, req: PermissionRequest) -> PermissionDecision;
}

/// A gate that grants every request immediately — useful for tests and for
/// single-user / trusted-sandbox deployments that skip the arbiter entirely.
pub struct AlwaysGrant;

#[async_trait]
impl PermissionGate for AlwaysGrant {
    async fn request(&self, _req: PermissionRequest) -> PermissionDecision {
        PermissionDecision::Granted
    }
}

/// A gate that denies every request — useful for testing the policy-denied
/// error path without standing up a full arbiter.
pub struct AlwaysDeny;

#[async_trait]
impl PermissionGate for AlwaysDeny {
    async fn request(&self, _req: PermissionRequest) -> PermissionDecision {
        PermissionDecision::Denied
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

    #[tokio::test]
    async fn always_grant_grants() {
        assert_eq!(AlwaysGrant.request(req()).await, PermissionDecision::Granted);
    }

    #[tokio::test]
    async fn always_deny_denies() {
        assert_eq!(AlwaysDeny.request(req()).await, PermissionDecision::Denied);
    }
}
