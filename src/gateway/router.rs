//! Frame dispatch for authenticated connections.
//!
//! The envelope has already been decoded by the connection loop; this module
//! picks the per-action payload structure, enforces authorization, and sends
//! replies back through the connection's queue.
//!
//! Authorization, evaluated before every PTY action except `create` and
//! `list`:
//! - `write` / `resize` / `close`: the client owns the session (by device
//!   id), is subscribed to it, or is local.
//! - `subscribe`: the client owns the session or is local.
//! - `unsubscribe`: always allowed against the client's own set.
//!
//! Any authenticated client may drive or observe any registered service.
//!
//! Replies: frames that exist to return data (`create`, `list`, `ping`,
//! `info`) always get their result frame, correlated when a `requestId` was
//! present. Fire-and-forget mutations are acknowledged only when the caller
//! supplied a `requestId`.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::protocol::{
    self, Frame, PtyCreatePayload, PtyResizePayload, PtySessionRef, PtyWritePayload, ServiceRef,
};
use crate::util;

use super::GatewayState;

/// Route one authenticated frame.
pub async fn dispatch(
    state: &GatewayState,
    conn_id: &str,
    frame: Frame,
    tx: &mpsc::Sender<Message>,
) {
    let rid = frame.request_id.clone();
    match frame.kind.as_str() {
        "auth" => {
            send(tx, protocol::error_frame("Already authenticated", rid.as_deref())).await;
        }
        "pty" => handle_pty(state, conn_id, frame, tx).await,
        "service" => handle_service(state, conn_id, frame, tx).await,
        "system" => handle_system(state, frame, tx).await,
        other => {
            send(
                tx,
                protocol::error_frame(&format!("Unknown message type: {other}"), rid.as_deref()),
            )
            .await;
        }
    }
}

async fn handle_pty(state: &GatewayState, conn_id: &str, frame: Frame, tx: &mpsc::Sender<Message>) {
    let rid = frame.request_id.as_deref();
    match frame.action.as_str() {
        "create" => {
            let opts: PtyCreatePayload = if frame.payload.is_null() {
                PtyCreatePayload::default()
            } else {
                match frame.payload_as() {
                    Ok(p) => p,
                    Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
                }
            };
            let session = match state.pool.create(opts).await {
                Ok(s) => s,
                Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
            };
            let Some(device_id) = state.clients.get(conn_id, |c| c.device_id.clone()).await
            else {
                // Connection vanished mid-create; don't leak the shell.
                state.pool.close(&session.id).await;
                return;
            };

            state.registry.claim(&session.id, &device_id).await;
            state
                .clients
                .with_client(conn_id, |c| {
                    c.owned_sessions.insert(session.id.clone());
                    c.session_subscriptions.insert(session.id.clone());
                })
                .await;

            let payload = serde_json::to_value(&session).unwrap_or_default();
            send(tx, protocol::response("pty", "created", payload.clone(), rid)).await;

            // Lifecycle event for other connections entitled to see it.
            let event = protocol::event("pty", "created", payload);
            for endpoint in state.clients.visible_to_session(&device_id, conn_id).await {
                endpoint.deliver(&event);
            }
        }
        "write" => {
            let write: PtyWritePayload = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
            };
            if !may_operate(state, conn_id, &write.session_id).await {
                return send(tx, protocol::error_frame("Access denied", rid)).await;
            }
            state.pool.write(&write.session_id, write.data.as_bytes()).await;
            if rid.is_some() {
                let payload = json!({ "sessionId": write.session_id });
                send(tx, protocol::response("pty", "written", payload, rid)).await;
            }
        }
        "resize" => {
            let resize: PtyResizePayload = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
            };
            if !may_operate(state, conn_id, &resize.session_id).await {
                return send(tx, protocol::error_frame("Access denied", rid)).await;
            }
            state
                .pool
                .resize(&resize.session_id, resize.cols, resize.rows)
                .await;
            if rid.is_some() {
                let payload = json!({
                    "sessionId": resize.session_id,
                    "cols": resize.cols,
                    "rows": resize.rows,
                });
                send(tx, protocol::response("pty", "resized", payload, rid)).await;
            }
        }
        "close" => {
            let close: PtySessionRef = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
            };
            if !may_operate(state, conn_id, &close.session_id).await {
                return send(tx, protocol::error_frame("Access denied", rid)).await;
            }
            let owner = state.registry.owner(&close.session_id).await;
            let existed = state.pool.close(&close.session_id).await;
            state.registry.release(&close.session_id).await;

            if existed {
                let event = protocol::event(
                    "pty",
                    "closed",
                    json!({ "sessionId": close.session_id }),
                );
                let owner = owner.unwrap_or_default();
                for endpoint in state.clients.visible_to_session(&owner, conn_id).await {
                    endpoint.deliver(&event);
                }
            }
            if rid.is_some() {
                let payload = json!({ "sessionId": close.session_id });
                send(tx, protocol::response("pty", "closed", payload, rid)).await;
            }
        }
        "subscribe" => {
            let sub: PtySessionRef = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
            };
            let allowed = state
                .clients
                .get(conn_id, |c| c.may_subscribe(&sub.session_id))
                .await
                .unwrap_or(false);
            if !allowed {
                return send(tx, protocol::error_frame("Access denied", rid)).await;
            }
            if !state.pool.contains(&sub.session_id).await {
                return send(tx, protocol::error_frame("Session not found", rid)).await;
            }
            state
                .clients
                .with_client(conn_id, |c| {
                    c.session_subscriptions.insert(sub.session_id.clone());
                })
                .await;
            if rid.is_some() {
                let payload = json!({ "sessionId": sub.session_id });
                send(tx, protocol::response("pty", "subscribed", payload, rid)).await;
            }
        }
        "unsubscribe" => {
            let unsub: PtySessionRef = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
            };
            state
                .clients
                .with_client(conn_id, |c| {
                    c.session_subscriptions.remove(&unsub.session_id);
                })
                .await;
            if rid.is_some() {
                let payload = json!({ "sessionId": unsub.session_id });
                send(tx, protocol::response("pty", "unsubscribed", payload, rid)).await;
            }
        }
        "list" => {
            let sessions = state.pool.list().await;
            let payload = json!({ "sessions": sessions });
            send(tx, protocol::response("pty", "list", payload, rid)).await;
        }
        other => {
            debug!("Unknown pty action: {other}");
            send(
                tx,
                protocol::error_frame(&format!("Unknown pty action: {other}"), rid),
            )
            .await;
        }
    }
}

async fn handle_service(
    state: &GatewayState,
    conn_id: &str,
    frame: Frame,
    tx: &mpsc::Sender<Message>,
) {
    let rid = frame.request_id.as_deref();
    match frame.action.as_str() {
        "start" | "stop" | "restart" => {
            let svc: ServiceRef = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
            };
            let result = match frame.action.as_str() {
                "start" => state.services.start(&svc.id).await,
                "stop" => state.services.stop(&svc.id).await,
                _ => state.services.restart(&svc.id).await,
            };
            match result {
                Ok(()) => {
                    if rid.is_some() {
                        let action = match frame.action.as_str() {
                            "start" => "started",
                            "stop" => "stopped",
                            _ => "restarted",
                        };
                        let payload = json!({ "id": svc.id });
                        send(tx, protocol::response("service", action, payload, rid)).await;
                    }
                }
                Err(e) => send(tx, protocol::error_frame(&e, rid)).await,
            }
        }
        "list" => {
            let services = state.services.list_all().await;
            let payload = json!({ "services": services });
            send(tx, protocol::response("service", "list", payload, rid)).await;
        }
        "subscribe" => {
            let svc: ServiceRef = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
            };
            if !state.services.is_registered(&svc.id).await {
                return send(tx, protocol::error_frame("Service not found", rid)).await;
            }
            state
                .clients
                .with_client(conn_id, |c| {
                    c.service_subscriptions.insert(svc.id.clone());
                })
                .await;
            if rid.is_some() {
                let payload = json!({ "id": svc.id });
                send(tx, protocol::response("service", "subscribed", payload, rid)).await;
            }
        }
        "unsubscribe" => {
            let svc: ServiceRef = match frame.payload_as() {
                Ok(p) => p,
                Err(e) => return send(tx, protocol::error_frame(&e, rid)).await,
            };
            state
                .clients
                .with_client(conn_id, |c| {
                    c.service_subscriptions.remove(&svc.id);
                })
                .await;
            if rid.is_some() {
                let payload = json!({ "id": svc.id });
                send(tx, protocol::response("service", "unsubscribed", payload, rid)).await;
            }
        }
        other => {
            send(
                tx,
                protocol::error_frame(&format!("Unknown service action: {other}"), rid),
            )
            .await;
        }
    }
}

async fn handle_system(state: &GatewayState, frame: Frame, tx: &mpsc::Sender<Message>) {
    let rid = frame.request_id.as_deref();
    match frame.action.as_str() {
        "ping" => {
            let payload = json!({ "timestamp": util::now_ms() });
            send(tx, protocol::response("system", "pong", payload, rid)).await;
        }
        "info" => {
            let payload = json!({
                "hostname": hostname(),
                "platform": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "version": env!("CARGO_PKG_VERSION"),
                "uptimeSecs": state.started_at.elapsed().as_secs(),
            });
            send(tx, protocol::response("system", "info", payload, rid)).await;
        }
        other => {
            send(
                tx,
                protocol::error_frame(&format!("Unknown system action: {other}"), rid),
            )
            .await;
        }
    }
}

/// write/resize/close authorization.
async fn may_operate(state: &GatewayState, conn_id: &str, session_id: &str) -> bool {
    state
        .clients
        .get(conn_id, |c| c.may_operate(session_id))
        .await
        .unwrap_or(false)
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

async fn send(tx: &mpsc::Sender<Message>, frame: Value) {
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = tx.send(Message::Text(text)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fake_client, harness, next_frame};
    use super::*;

    fn frame(kind: &str, action: &str, payload: Value, rid: Option<&str>) -> Frame {
        let mut raw = json!({ "type": kind, "action": action, "payload": payload });
        if let Some(rid) = rid {
            raw["requestId"] = json!(rid);
        }
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn test_remote_client_denied_on_foreign_session() {
        let h = harness();
        let mut rx_b = fake_client(&h.state, "conn-b", "device-b", false).await;

        // Session owned by device-a; device-b neither owns nor subscribes.
        h.state.registry.claim("s1", "device-a").await;
        let (tx, mut queue) = mpsc::channel(8);
        dispatch(
            &h.state,
            "conn-b",
            frame("pty", "write", json!({"sessionId": "s1", "data": "rm -rf /\n"}), None),
            &tx,
        )
        .await;

        let err: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(err["action"], "error");
        assert_eq!(err["payload"]["error"], "Access denied");
        assert!(next_frame(&mut rx_b).is_none());
    }

    #[tokio::test]
    async fn test_owner_may_write_even_after_registry_release() {
        let h = harness();
        let _rx = fake_client(&h.state, "conn-a", "device-a", false).await;
        h.state
            .clients
            .with_client("conn-a", |c| {
                c.owned_sessions.insert("s1".to_string());
            })
            .await;
        // PTY exited: global ownership released, per-connection set stale.
        h.state.registry.release("s1").await;

        let (tx, mut queue) = mpsc::channel(8);
        dispatch(
            &h.state,
            "conn-a",
            frame("pty", "write", json!({"sessionId": "s1", "data": "ls\n"}), None),
            &tx,
        )
        .await;
        // Authorized by the stale owned set; the pool no-ops. No error frame.
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_requires_ownership_or_local() {
        let h = harness();
        let _rx_a = fake_client(&h.state, "conn-a", "device-a", false).await;
        let _rx_b = fake_client(&h.state, "conn-b", "device-b", false).await;
        let _rx_l = fake_client(&h.state, "conn-l", "local-ui", true).await;

        h.state
            .clients
            .with_client("conn-a", |c| {
                c.owned_sessions.insert("s1".to_string());
            })
            .await;

        // Non-owner remote: denied outright.
        let (tx, mut queue) = mpsc::channel(8);
        dispatch(
            &h.state,
            "conn-b",
            frame("pty", "subscribe", json!({"sessionId": "s1"}), Some("r1")),
            &tx,
        )
        .await;
        let err: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(err["payload"]["error"], "Access denied");
        assert_eq!(err["requestId"], "r1");

        // Owner passes authorization but the session is not live.
        let (tx, mut queue) = mpsc::channel(8);
        dispatch(
            &h.state,
            "conn-a",
            frame("pty", "subscribe", json!({"sessionId": "s1"}), None),
            &tx,
        )
        .await;
        let err: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(err["payload"]["error"], "Session not found");

        // Local client: same existence failure, never an access failure.
        let (tx, mut queue) = mpsc::channel(8);
        dispatch(
            &h.state,
            "conn-l",
            frame("pty", "subscribe", json!({"sessionId": "s1"}), None),
            &tx,
        )
        .await;
        let err: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(err["payload"]["error"], "Session not found");
    }

    #[tokio::test]
    async fn test_unsubscribe_always_allowed() {
        let h = harness();
        let _rx = fake_client(&h.state, "conn-b", "device-b", false).await;
        let (tx, mut queue) = mpsc::channel(8);
        dispatch(
            &h.state,
            "conn-b",
            frame("pty", "unsubscribe", json!({"sessionId": "s1"}), Some("r2")),
            &tx,
        )
        .await;
        let ack: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(ack["action"], "unsubscribed");
        assert_eq!(ack["requestId"], "r2");
    }

    #[tokio::test]
    async fn test_create_claims_ownership_and_subscribes() {
        let h = harness();
        let _rx = fake_client(&h.state, "conn-a", "device-a", false).await;

        let (tx, mut queue) = mpsc::channel(8);
        dispatch(
            &h.state,
            "conn-a",
            frame(
                "pty",
                "create",
                json!({"name": "t", "shell": "/bin/sh", "cwd": "/tmp"}),
                Some("r3"),
            ),
            &tx,
        )
        .await;

        let created: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(created["action"], "created");
        assert_eq!(created["requestId"], "r3");
        let sid = created["payload"]["id"].as_str().unwrap().to_string();

        assert_eq!(
            h.state.registry.owner(&sid).await.as_deref(),
            Some("device-a")
        );
        let (owned, subscribed) = h
            .state
            .clients
            .get("conn-a", |c| {
                (
                    c.owned_sessions.contains(&sid),
                    c.session_subscriptions.contains(&sid),
                )
            })
            .await
            .unwrap();
        assert!(owned);
        assert!(subscribed);

        h.state.pool.close(&sid).await;
    }

    #[tokio::test]
    async fn test_unknown_service_subscribe_fails() {
        let h = harness();
        let _rx = fake_client(&h.state, "conn-a", "device-a", false).await;
        let (tx, mut queue) = mpsc::channel(8);
        dispatch(
            &h.state,
            "conn-a",
            frame("service", "subscribe", json!({"id": "nope"}), None),
            &tx,
        )
        .await;
        let err: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(err["payload"]["error"], "Service not found");
    }

    #[tokio::test]
    async fn test_ping_pongs_with_timestamp() {
        let h = harness();
        let (tx, mut queue) = mpsc::channel(8);
        dispatch(&h.state, "conn-x", frame("system", "ping", json!({}), None), &tx).await;
        let pong: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert_eq!(pong["action"], "pong");
        assert!(pong["payload"]["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_unknown_type_and_action_report_errors() {
        let h = harness();
        let (tx, mut queue) = mpsc::channel(8);
        dispatch(&h.state, "c", frame("bogus", "x", json!({}), None), &tx).await;
        let err: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert!(err["payload"]["error"]
            .as_str()
            .unwrap()
            .contains("Unknown message type"));

        let (tx, mut queue) = mpsc::channel(8);
        dispatch(&h.state, "c", frame("pty", "zap", json!({}), None), &tx).await;
        let err: Value = match queue.recv().await.unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        assert!(err["payload"]["error"]
            .as_str()
            .unwrap()
            .contains("Unknown pty action"));
    }
}
