//! Message and session types shared between the Doctor and WebSocket
//! processes (spec §4.7). The actual fan-out (`tokio::sync::broadcast`) and
//! axum routing live in `sysmedic-wsd`; this module only defines the wire
//! shapes both sides agree on.

use serde::{Deserialize, Serialize};

use crate::model::{Alert, HostSample, SystemStatus, UserSample};

/// Envelope every WebSocket frame uses: `{type, timestamp, data?,
/// request_id?}` (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: WsMessageKind,
    /// ISO 8601 UTC, e.g. `2024-01-01T00:00:00Z`.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsMessageKind {
    Welcome,
    Config,
    SystemUpdate,
    Alert,
    Request,
    Response,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub os: String,
    pub version: String,
    pub status: SystemStatus,
    pub uptime_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemUpdatePayload {
    pub host: HostSample,
    pub users: Vec<UserSample>,
    pub status: SystemStatus,
}

/// The `data` shape of an incoming client request, carried inside a
/// `Request`-kind envelope. The request's own flavour (`get_alerts` etc.) is
/// distinguished by `request_type` rather than overloading the envelope's
/// outer `type`, since the envelope's `type` is reserved for the seven
/// message kinds above.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientRequest {
    pub request_type: ClientRequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRequestType {
    GetSystemInfo,
    GetAlerts,
    GetUserMetrics,
    GetConfig,
    Ping,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

fn now_iso8601(unix_secs: i64) -> String {
    chrono::DateTime::from_timestamp(unix_secs, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

impl WsEnvelope {
    pub fn welcome(now: i64, payload: &WelcomePayload) -> Self {
        Self {
            kind: WsMessageKind::Welcome,
            timestamp: now_iso8601(now),
            data: serde_json::to_value(payload).ok(),
            request_id: None,
        }
    }

    pub fn config(now: i64, sanitized_config_json: serde_json::Value) -> Self {
        Self {
            kind: WsMessageKind::Config,
            timestamp: now_iso8601(now),
            data: Some(sanitized_config_json),
            request_id: None,
        }
    }

    pub fn system_update(now: i64, payload: &SystemUpdatePayload) -> Self {
        Self {
            kind: WsMessageKind::SystemUpdate,
            timestamp: now_iso8601(now),
            data: serde_json::to_value(payload).ok(),
            request_id: None,
        }
    }

    pub fn alert(now: i64, alert: &Alert) -> Self {
        Self {
            kind: WsMessageKind::Alert,
            timestamp: now_iso8601(now),
            data: serde_json::to_value(alert).ok(),
            request_id: None,
        }
    }

    pub fn response(now: i64, request_id: String, data: serde_json::Value) -> Self {
        Self {
            kind: WsMessageKind::Response,
            timestamp: now_iso8601(now),
            data: Some(data),
            request_id: Some(request_id),
        }
    }

    pub fn error(now: i64, request_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: WsMessageKind::Error,
            timestamp: now_iso8601(now),
            data: serde_json::to_value(ErrorPayload { error: message.into() }).ok(),
            request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_absent_optional_fields() {
        let msg = WsEnvelope::welcome(
            0,
            &WelcomePayload {
                os: "linux".to_string(),
                version: "0.1.0".to_string(),
                status: SystemStatus::Light,
                uptime_secs: 5,
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("request_id"));
        assert!(json.contains("\"type\":\"welcome\""));
    }

    #[test]
    fn response_carries_request_id() {
        let msg = WsEnvelope::response(0, "abc-123".to_string(), serde_json::json!({"ok": true}));
        assert_eq!(msg.request_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn client_request_round_trips_through_json() {
        let req = ClientRequest {
            request_type: ClientRequestType::GetAlerts,
            params: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ClientRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_type, ClientRequestType::GetAlerts);
    }
}
