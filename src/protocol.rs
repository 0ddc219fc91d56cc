//! Wire protocol types.
//!
//! Every WebSocket text message is a JSON envelope:
//!
//! ```json
//! { "type": "auth" | "pty" | "service" | "system",
//!   "action": "...",
//!   "payload": { ... },
//!   "requestId": "optional-correlation-id" }
//! ```
//!
//! The envelope is decoded once; the payload stays dynamic only until the
//! router picks the per-action struct below. Replies echo `requestId` when
//! (and only when) the request carried one; event frames never carry it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Incoming message envelope.
#[derive(Debug, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Decode the payload into a per-action structure.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(self.payload.clone()).map_err(|e| format!("invalid payload: {e}"))
    }
}

/// `auth/login` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: String,
    /// Stable device identifier chosen by the client; the unit of session
    /// ownership.
    pub client_id: String,
    #[serde(default)]
    pub device_name: String,
}

/// `pty/create` payload. All fields optional; defaults applied by the pool.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyCreatePayload {
    pub name: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cwd: Option<String>,
    pub shell: Option<String>,
}

/// Payloads that only name a session (`close`, `subscribe`, `unsubscribe`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtySessionRef {
    pub session_id: String,
}

/// `pty/write` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyWritePayload {
    pub session_id: String,
    pub data: String,
}

/// `pty/resize` payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyResizePayload {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// Payloads that name a service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub id: String,
}

/// Live PTY session metadata as it crosses the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtySession {
    pub id: String,
    pub name: String,
    pub cols: u16,
    pub rows: u16,
    pub cwd: String,
    pub shell: String,
    /// Milliseconds since epoch.
    pub created_at: u64,
}

/// Service status snapshot as it crosses the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusInfo {
    pub id: String,
    pub name: String,
    /// One of `stopped`, `starting`, `running`, `error`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Milliseconds since the child started; absent unless running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Build a reply frame, echoing `request_id` when present.
pub fn response(kind: &str, action: &str, payload: Value, request_id: Option<&str>) -> Value {
    let mut frame = json!({
        "type": kind,
        "action": action,
        "payload": payload,
    });
    if let Some(rid) = request_id {
        frame["requestId"] = json!(rid);
    }
    frame
}

/// Build an event frame (never correlated).
pub fn event(kind: &str, action: &str, payload: Value) -> Value {
    json!({
        "type": kind,
        "action": action,
        "payload": payload,
    })
}

/// Build a `system/error` frame, correlated only when the offending request
/// carried a `requestId`.
pub fn error_frame(message: &str, request_id: Option<&str>) -> Value {
    response("system", "error", json!({ "error": message }), request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope() {
        let frame = Frame::parse(
            r#"{"type":"pty","action":"write","payload":{"sessionId":"s1","data":"ls\n"},"requestId":"r9"}"#,
        )
        .unwrap();
        assert_eq!(frame.kind, "pty");
        assert_eq!(frame.action, "write");
        assert_eq!(frame.request_id.as_deref(), Some("r9"));
        let write: PtyWritePayload = frame.payload_as().unwrap();
        assert_eq!(write.session_id, "s1");
        assert_eq!(write.data, "ls\n");
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let frame = Frame::parse(r#"{"type":"system","action":"ping"}"#).unwrap();
        assert!(frame.payload.is_null());
        assert!(frame.request_id.is_none());
    }

    #[test]
    fn test_create_payload_all_optional() {
        let frame = Frame::parse(r#"{"type":"pty","action":"create","payload":{}}"#).unwrap();
        let create: PtyCreatePayload = frame.payload_as().unwrap();
        assert!(create.cols.is_none());
        assert!(create.shell.is_none());
    }

    #[test]
    fn test_response_echoes_request_id() {
        let with = response("pty", "created", json!({}), Some("r1"));
        assert_eq!(with["requestId"], "r1");
        let without = response("pty", "created", json!({}), None);
        assert!(without.get("requestId").is_none());
    }

    #[test]
    fn test_error_frame_shape() {
        let err = error_frame("Access denied", None);
        assert_eq!(err["type"], "system");
        assert_eq!(err["action"], "error");
        assert_eq!(err["payload"]["error"], "Access denied");
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let s = PtySession {
            id: "s".into(),
            name: "shell".into(),
            cols: 80,
            rows: 24,
            cwd: "/tmp".into(),
            shell: "/bin/sh".into(),
            created_at: 123,
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["createdAt"], 123);
    }
}
