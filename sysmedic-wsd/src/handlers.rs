//! HTTP and WebSocket handlers (grounded in `rpglot-web::handlers`'s
//! typed-JSON handler shape and `main.rs`'s `handle_stream`, here adapted
//! from Server-Sent Events to a true WebSocket upgrade per spec §6).

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sysmedic_core::broadcast::{ClientRequest, ClientRequestType, WelcomePayload, WsEnvelope, WsMessageKind};
use sysmedic_core::model::Alert;

use crate::auth::{extract_secret, secret_matches};
use crate::state::{now_epoch, AppState, LAST_CLIENT_ACTIVITY};

pub async fn handle_health() -> &'static str {
    r#"{"status":"healthy"}"#
}

#[derive(Serialize)]
struct StatusResponse {
    running: bool,
    clients: usize,
    port: u16,
    version: &'static str,
    uptime: u64,
}

pub async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        running: true,
        clients: state.active_connections.load(Ordering::Relaxed),
        port: state.port,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.uptime_secs(),
    })
}

pub async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> axum::response::Response {
    let presented = extract_secret(params.get("secret").map(|s| s.as_str()), &headers);

    let state_for_secret = state.clone();
    let secret = match tokio::task::spawn_blocking(move || state_for_secret.store.auth_secret()).await {
        Ok(Ok(secret)) => secret,
        _ => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable"),
    };

    let authorized = match (&secret, &presented) {
        (Some(expected), Some(presented)) => secret_matches(&expected.hex, presented),
        _ => false,
    };

    if !authorized {
        warn!("websocket client rejected: bad or missing secret");
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let secret_version = secret.map(|s| s.version).unwrap_or(0);
    ws.on_upgrade(move |socket| handle_socket(socket, state, secret_version))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    let body = serde_json::json!({"error": message}).to_string();
    axum::response::Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap()
}

async fn handle_socket(socket: WebSocket, state: AppState, secret_version_at_connect: u64) {
    let session_id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    let active = state.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
    LAST_CLIENT_ACTIVITY.store(now_epoch(), Ordering::Relaxed);
    info!(session_id, active_connections = active, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();

    let (alert_tx, mut alert_rx) = mpsc::channel::<Arc<Alert>>(64);
    state.alert_registry.lock().unwrap().insert(session_id, alert_tx);

    let mut system_update_rx = state.system_update_tx.subscribe();
    let mut secret_rx = state.secret_version.subscribe();

    let current_status = match read_live_snapshot(&state).await {
        Ok(live) => live.status,
        Err(e) => {
            warn!(session_id, error = %e, "failed to read live status for welcome frame");
            Default::default()
        }
    };
    let welcome = WsEnvelope::welcome(
        now_epoch(),
        &WelcomePayload {
            os: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: current_status,
            uptime_secs: state.uptime_secs(),
        },
    );
    if send_envelope(&mut sender, &welcome).await.is_err() {
        cleanup_session(&state, session_id);
        return;
    }

    let config_payload = serde_json::json!({
        "port": state.port,
        "broadcast_interval_secs": state.broadcast_interval_secs,
    });
    let config_msg = WsEnvelope::config(now_epoch(), config_payload);
    if send_envelope(&mut sender, &config_msg).await.is_err() {
        cleanup_session(&state, session_id);
        return;
    }

    loop {
        tokio::select! {
            update = system_update_rx.recv() => {
                match update {
                    Ok(payload) => {
                        let msg = WsEnvelope::system_update(now_epoch(), &payload);
                        if send_envelope(&mut sender, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(session_id, skipped = n, "session lagged on system_update, resyncing");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            alert = alert_rx.recv() => {
                match alert {
                    Some(alert) => {
                        let msg = WsEnvelope::alert(now_epoch(), &alert);
                        if send_envelope(&mut sender, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        info!(session_id, "alert queue closed, ending session");
                        break;
                    }
                }
            }
            changed = secret_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if *secret_rx.borrow() != secret_version_at_connect {
                    info!(session_id, "auth secret rotated, closing session");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        LAST_CLIENT_ACTIVITY.store(now_epoch(), Ordering::Relaxed);
                        handle_client_message(&state, &mut sender, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    cleanup_session(&state, session_id);
}

fn cleanup_session(state: &AppState, session_id: u64) {
    state.alert_registry.lock().unwrap().remove(&session_id);
    let active = state.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(session_id, active_connections = active, "websocket client disconnected");
}

async fn send_envelope(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    envelope: &WsEnvelope,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(envelope).unwrap_or_default();
    match tokio::time::timeout(Duration::from_secs(10), sender.send(Message::Text(json))).await {
        Ok(result) => result,
        Err(_) => Err(axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}

async fn handle_client_message(state: &AppState, sender: &mut futures::stream::SplitSink<WebSocket, Message>, text: &str) {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            let err = WsEnvelope::error(now_epoch(), None, format!("malformed request: {e}"));
            let _ = send_envelope(sender, &err).await;
            return;
        }
    };

    if envelope.kind != WsMessageKind::Request {
        let err = WsEnvelope::error(now_epoch(), envelope.request_id.clone(), "expected a request message");
        let _ = send_envelope(sender, &err).await;
        return;
    }

    let request: ClientRequest = match envelope.data.clone().and_then(|d| serde_json::from_value(d).ok()) {
        Some(r) => r,
        None => {
            let err = WsEnvelope::error(now_epoch(), envelope.request_id.clone(), "missing or invalid request data");
            let _ = send_envelope(sender, &err).await;
            return;
        }
    };

    let request_id = envelope.request_id.clone().unwrap_or_default();
    let data = match request.request_type {
        ClientRequestType::Ping => serde_json::json!({"pong": true}),
        ClientRequestType::GetSystemInfo => match read_live_snapshot(state).await {
            Ok(live) => serde_json::json!({
                "host": live.host,
                "status": live.status,
                "open_offenders": live.open_offenders,
            }),
            Err(e) => {
                let err = WsEnvelope::error(now_epoch(), Some(request_id), format!("store error: {e}"));
                let _ = send_envelope(sender, &err).await;
                return;
            }
        },
        ClientRequestType::GetUserMetrics => match read_live_snapshot(state).await {
            Ok(live) => serde_json::json!({ "users": live.users }),
            Err(e) => {
                let err = WsEnvelope::error(now_epoch(), Some(request_id), format!("store error: {e}"));
                let _ = send_envelope(sender, &err).await;
                return;
            }
        },
        ClientRequestType::GetAlerts => {
            let since_secs = request
                .params
                .as_ref()
                .and_then(|p| p.get("since_secs"))
                .and_then(|v| v.as_i64())
                .unwrap_or(3600);
            let state_clone = state.clone();
            let now = now_epoch();
            let result = tokio::task::spawn_blocking(move || state_clone.store.get_alerts_since(since_secs, now, None)).await;
            match result {
                Ok(Ok(alerts)) => serde_json::json!({ "alerts": alerts }),
                _ => {
                    let err = WsEnvelope::error(now_epoch(), Some(request_id), "store error");
                    let _ = send_envelope(sender, &err).await;
                    return;
                }
            }
        }
        ClientRequestType::GetConfig => serde_json::json!({
            "port": state.port,
            "broadcast_interval_secs": state.broadcast_interval_secs,
        }),
    };

    let response = WsEnvelope::response(now_epoch(), request_id, data);
    let _ = send_envelope(sender, &response).await;
}

async fn read_live_snapshot(state: &AppState) -> std::io::Result<sysmedic_core::model::LiveSnapshot> {
    let state = state.clone();
    tokio::task::spawn_blocking(move || state.store.live_snapshot())
        .await
        .unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}
