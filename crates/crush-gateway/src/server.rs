// SPDX-License-Identifier: MIT
//! Gateway startup — assembles the event log, bus, arbiter, coordinator and
//! auth state, then serves the WebSocket connection gateway (C9), adapted
//! from the teacher's `gateway.rs::run()` startup sequence with the
//! P2P/Slack transports dropped: this system has exactly one external
//! transport, the WebSocket JSON protocol of SPEC_FULL.md §6.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crush_config::{Config, GatewayConfig};
use crush_core::Agent;

use crate::arbiter::Arbiter;
use crate::auth::AuthState;
use crate::bus::Bus;
use crate::coordinator::SessionCoordinator;
use crate::event_log::EventLog;
use crate::ws::{ws_handler, GatewayState};

/// Owns the subsystems that outlive any single connection. Cloning is cheap
/// (every field is internally `Arc`-backed).
#[derive(Clone)]
pub struct GatewayHandle {
    pub coordinator: Arc<SessionCoordinator>,
    pub log: EventLog,
    pub bus: Bus,
    pub arbiter: Arc<Arbiter>,
    pub auth: AuthState,
}

impl GatewayHandle {
    pub fn new(config: &Config, data_dir: &std::path::Path) -> anyhow::Result<Self> {
        let db_path = config
            .event_log
            .database_path
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("events.sqlite3"));
        let log = EventLog::open(&db_path, config.event_log.max_age_days, config.event_log.max_events_per_session)?;
        let bus = Bus::new();
        let arbiter = Arc::new(Arbiter::new(&config.permission, log.clone(), bus.clone()));
        let coordinator = Arc::new(SessionCoordinator::new(log.clone(), bus.clone(), arbiter.clone()));
        let auth = AuthState::from_env(&config.gateway)?;
        Ok(Self { coordinator, log, bus, arbiter, auth })
    }

    pub fn register_session(&self, session_id: String, agent: Agent) {
        self.coordinator.register_session(session_id, agent);
    }

    /// Bind and serve until the process is signalled to shut down. Blocks.
    pub async fn serve(self, config: &GatewayConfig) -> anyhow::Result<()> {
        let addr: SocketAddr = config.bind_addr.parse()?;
        let router = build_router(&self, config.outbound_queue_len);
        info!(bind = %addr, "starting WebSocket gateway");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

pub fn build_router(handle: &GatewayHandle, outbound_queue_len: usize) -> Router {
    let state = Arc::new(GatewayState {
        coordinator: handle.coordinator.clone(),
        auth: handle.auth.clone(),
        outbound_queue_len,
    });
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining connections");
}
