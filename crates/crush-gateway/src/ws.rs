// SPDX-License-Identifier: MIT
//! C9 — Connection Gateway: WebSocket attach/detach and inbound frame demux,
//! adapted from the teacher's `http/ws.rs` bridge (recv/forward loop plus a
//! `tokio::select!` against the live event stream) but bound to a single
//! session per connection, authenticated by JWT instead of a bearer token,
//! and backed by the session coordinator instead of a raw `AgentHandle`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::auth::AuthState;
use crate::coordinator::SessionCoordinator;
use crate::error::ErrorClass;
use crate::model::{Event, EventKind, PermissionRequestRecord};

pub struct GatewayState {
    pub coordinator: Arc<SessionCoordinator>,
    pub auth: AuthState,
    pub outbound_queue_len: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Message {
        content: String,
        #[serde(default)]
        #[allow(dead_code)]
        images: Vec<serde_json::Value>,
    },
    Cancel,
    #[serde(rename = "permission_response")]
    PermissionResponse {
        #[allow(dead_code)]
        id: String,
        tool_call_id: String,
        granted: bool,
    },
    Reconnect {
        #[serde(rename = "lastMsgId", default)]
        last_msg_id: String,
    },
}

#[derive(Serialize)]
struct OutboundFrame {
    #[serde(rename = "_streamId")]
    stream_id: i64,
    #[serde(rename = "_type")]
    kind: EventKind,
    #[serde(rename = "_payload")]
    payload: serde_json::Value,
    #[serde(rename = "_replay", skip_serializing_if = "std::ops::Not::not")]
    replay: bool,
}

impl From<Event> for OutboundFrame {
    fn from(ev: Event) -> Self {
        Self { stream_id: ev.stream_id, kind: ev.kind, payload: ev.payload, replay: false }
    }
}

#[derive(Serialize)]
struct ReconnectionStatus {
    #[serde(rename = "_streamId")]
    stream_id: i64,
    #[serde(rename = "_type")]
    kind: &'static str,
    #[serde(rename = "_payload")]
    payload: ReconnectionPayload,
}

#[derive(Serialize)]
struct ReconnectionPayload {
    messages_replayed: usize,
    generation_active: bool,
    last_stream_id: i64,
    /// Requests still awaiting a decision — re-armed from the arbiter
    /// (§4.3 `Reopen`) rather than the backfilled log, since a request made
    /// before the client's cursor would otherwise never be resent.
    pending_permissions: Vec<PermissionRequestRecord>,
}

/// `GET /ws?token=<JWT>&session_id=<id>` upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    State(gw): State<Arc<GatewayState>>,
) -> Response {
    let (Some(token), Some(session_id)) = (params.get("token").cloned(), params.get("session_id").cloned()) else {
        return (StatusCode::BAD_REQUEST, "missing token or session_id").into_response();
    };
    if gw.auth.verify(&token, addr.ip()).is_err() {
        // Close before any frame is processed — the spec's "4401-equivalent"
        // close. We reject at the HTTP layer so the socket is never upgraded.
        return (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response();
    }
    if !gw.coordinator.has_session(&session_id) {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, gw, session_id))
}

async fn handle_socket(socket: WebSocket, gw: Arc<GatewayState>, session_id: String) {
    let (mut sink, mut stream) = socket.split();

    // Decouple the live subscriber from the socket's own send latency: a
    // bounded local buffer, dropped (closing the connection) the moment a
    // client falls behind it, satisfies "closes connections that fall
    // behind a bounded queue" without blocking the bus's publish path.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(gw.outbound_queue_len);
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut live_rx: Option<broadcast::Receiver<Event>> = None;

    loop {
        let forward_live = async {
            match live_rx.as_mut() {
                Some(rx) => Some(rx.recv().await),
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundFrame>(&text) {
                            Ok(frame) => {
                                if let Some(rx) = handle_inbound(&gw, &session_id, frame, &out_tx).await {
                                    live_rx = Some(rx);
                                }
                            }
                            Err(e) => {
                                send_error(&out_tx, ErrorClass::Protocol, &format!("malformed frame: {e}"), Some("bad_json")).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => { debug!("WebSocket recv error: {e}"); break; }
                }
            }
            result = forward_live => {
                match result {
                    Some(Ok(ev)) => {
                        let frame = OutboundFrame::from(ev);
                        if send_frame(&out_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(broadcast::error::RecvError::Lagged(n))) => {
                        warn!(session_id = %session_id, lagged = n, "subscriber fell behind, closing connection");
                        break;
                    }
                    Some(Err(broadcast::error::RecvError::Closed)) | None => {
                        live_rx = None;
                    }
                }
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    debug!(session_id = %session_id, "WebSocket connection closed");
}

async fn handle_inbound(
    gw: &GatewayState,
    session_id: &str,
    frame: InboundFrame,
    out_tx: &mpsc::Sender<Message>,
) -> Option<broadcast::Receiver<Event>> {
    match frame {
        InboundFrame::Message { content, .. } => {
            if let Err(e) = gw.coordinator.start_generation(session_id, &content).await {
                send_error(out_tx, ErrorClass::Policy, &e.to_string(), Some("busy_generation")).await;
            }
            None
        }
        InboundFrame::Cancel => {
            gw.coordinator.cancel(session_id);
            None
        }
        InboundFrame::PermissionResponse { tool_call_id, granted, .. } => {
            gw.coordinator.resolve_permission(&tool_call_id, granted);
            None
        }
        InboundFrame::Reconnect { last_msg_id } => {
            let cursor: i64 = last_msg_id.parse().unwrap_or(0);
            match gw.coordinator.reconnect(session_id, cursor) {
                Ok(info) => {
                    for ev in &info.backfill {
                        let mut frame = OutboundFrame::from(ev.clone());
                        frame.replay = true;
                        let _ = send_frame(out_tx, &frame).await;
                    }
                    let status = ReconnectionStatus {
                        stream_id: info.last_stream_id,
                        kind: "reconnection_status",
                        payload: ReconnectionPayload {
                            messages_replayed: info.backfill.len(),
                            generation_active: info.generation_active,
                            last_stream_id: info.last_stream_id,
                            pending_permissions: info.pending_permissions,
                        },
                    };
                    if let Ok(json) = serde_json::to_string(&status) {
                        let _ = out_tx.send(Message::Text(json)).await;
                    }
                    Some(gw.coordinator_subscribe(session_id))
                }
                Err(e) => {
                    send_error(out_tx, ErrorClass::Fatal, &e.to_string(), Some("session_not_found")).await;
                    None
                }
            }
        }
    }
}

async fn send_frame(out_tx: &mpsc::Sender<Message>, frame: &OutboundFrame) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    out_tx.try_send(Message::Text(json)).map_err(|_| ())
}

async fn send_error(out_tx: &mpsc::Sender<Message>, class: ErrorClass, message: &str, tag: Option<&str>) {
    let payload = serde_json::json!({ "class": class, "message": message, "tag": tag });
    if let Ok(json) = serde_json::to_string(&serde_json::json!({ "_streamId": 0, "_type": "error", "_payload": payload })) {
        let _ = out_tx.send(Message::Text(json)).await;
    }
}

impl GatewayState {
    fn coordinator_subscribe(&self, session_id: &str) -> broadcast::Receiver<Event> {
        self.coordinator.subscribe_bus(session_id)
    }
}
