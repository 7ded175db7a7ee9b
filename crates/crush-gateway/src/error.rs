// SPDX-License-Identifier: MIT
//! Library-boundary error enums for the gateway crate.
//!
//! Follows the split documented in SPEC_FULL.md §7.1: `thiserror` enums here,
//! `anyhow::Result` at call sites that only need to propagate. Errors that
//! cross the WebSocket boundary are converted into the client-facing
//! `{class, message, tag?}` taxonomy by [`ErrorClass`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("no pending permission request with id {0}")]
    UnknownRequest(String),
    #[error("permission request {0} is already in a terminal state")]
    AlreadyTerminal(String),
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session {0} not found")]
    SessionNotFound(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or malformed authentication token")]
    Unauthenticated,
    #[error("token verification failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("a generation is already running for session {0}")]
    BusyGeneration(String),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),
}

/// Client-facing error class, per the taxonomy in SPEC_FULL.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Transport,
    Protocol,
    Policy,
    Fatal,
}

impl GatewayError {
    /// Map this error to the class/tag pair sent to clients in an `error`
    /// event payload — never the raw Rust type name.
    pub fn classify(&self) -> (ErrorClass, Option<&'static str>) {
        match self {
            GatewayError::Unauthenticated | GatewayError::InvalidToken(_) => {
                (ErrorClass::Fatal, Some("auth"))
            }
            GatewayError::SessionNotFound(_) => (ErrorClass::Fatal, Some("session_not_found")),
            GatewayError::BusyGeneration(_) => (ErrorClass::Policy, Some("busy_generation")),
            GatewayError::EventLog(_) => (ErrorClass::Transport, Some("event_log")),
            GatewayError::Arbiter(_) => (ErrorClass::Fatal, Some("arbiter")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_generation_classifies_as_policy() {
        let e = GatewayError::BusyGeneration("s1".into());
        assert_eq!(e.classify().0, ErrorClass::Policy);
    }

    #[test]
    fn session_not_found_classifies_as_fatal() {
        let e = GatewayError::SessionNotFound("s1".into());
        assert_eq!(e.classify().0, ErrorClass::Fatal);
    }
}
