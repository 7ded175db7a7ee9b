// SPDX-License-Identifier: MIT
//! Gateway process: the durable event log (C5), pub/sub bus (C6), permission
//! arbiter (C3), session coordinator (C8), and the WebSocket connection
//! gateway (C9) that ties them together for external clients.

pub mod arbiter;
pub mod auth;
pub mod bus;
pub mod coordinator;
pub mod error;
pub mod event_log;
pub mod model;
pub mod server;
pub mod ws;

pub use arbiter::Arbiter;
pub use auth::AuthState;
pub use bus::Bus;
pub use coordinator::{ReconnectInfo, SessionCoordinator};
pub use error::{ArbiterError, ErrorClass, EventLogError, GatewayError};
pub use event_log::EventLog;
pub use model::{Event, EventKind, PermissionRequestRecord, PermissionState};
pub use server::{build_router, GatewayHandle};
