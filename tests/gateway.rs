//! End-to-end gateway scenarios over a real WebSocket client.
//!
//! The gateway runs in plaintext diagnostic mode on an ephemeral loopback
//! port; connections are therefore `isLocal`, so remote-vs-remote
//! authorization isolation is covered by the router's unit tests while these
//! exercise the full wire path: handshake, auth window, session lifecycle,
//! event fan-out, and reconnect ownership.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pagent::config::ServiceDefinition;
use pagent::gateway::{self, GatewayState};
use pagent::{Config, PtyPool, ServiceSupervisor, SessionRegistry};

const TOKEN: &str = "4f1c9a2b4f1c9a2b4f1c9a2b4f1c9a2b";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestGateway {
    addr: SocketAddr,
    services: ServiceSupervisor,
    _shutdown: watch::Sender<bool>,
}

async fn start_gateway() -> TestGateway {
    let (pty_tx, pty_rx) = mpsc::channel(1024);
    let (svc_tx, svc_rx) = mpsc::channel(1024);
    let pool = PtyPool::new(pty_tx);
    let services = ServiceSupervisor::new(svc_tx);
    let registry = SessionRegistry::new();

    let state = GatewayState::new(
        Arc::new(Config::default()),
        TOKEN.to_string(),
        pool,
        services.clone(),
        registry,
    );
    gateway::fanout::spawn_pty_fanout(state.clone(), pty_rx);
    gateway::fanout::spawn_service_fanout(state.clone(), svc_rx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(gateway::run(state, listener, None, shutdown_rx));

    TestGateway {
        addr,
        services,
        _shutdown: shutdown_tx,
    }
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/gateway"))
        .await
        .expect("websocket connect failed");
    ws
}

async fn send_frame(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next JSON frame, skipping pings/pongs. Panics after 10 s of silence.
async fn recv_frame(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("frame is not JSON");
        }
    }
}

/// Read frames until one matches, with a 10 s cap.
async fn recv_until(ws: &mut Ws, mut pred: impl FnMut(&Value) -> bool) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for matching frame"
        );
        let frame = recv_frame(ws).await;
        if pred(&frame) {
            return frame;
        }
    }
}

async fn authenticate(ws: &mut Ws, device_id: &str) -> Value {
    send_frame(
        ws,
        json!({
            "type": "auth",
            "action": "login",
            "payload": { "token": TOKEN, "clientId": device_id, "deviceName": "itest" },
            "requestId": "auth-1",
        }),
    )
    .await;
    let reply = recv_frame(ws).await;
    assert_eq!(reply["type"], "auth");
    assert_eq!(reply["action"], "success");
    assert_eq!(reply["requestId"], "auth-1");
    reply
}

#[tokio::test]
async fn test_auth_create_echo_close() {
    let gw = start_gateway().await;
    let mut ws = connect(gw.addr).await;

    let success = authenticate(&mut ws, "device-one").await;
    assert!(success["payload"]["clientId"].as_str().is_some());
    assert_eq!(success["payload"]["sessions"].as_array().unwrap().len(), 0);

    send_frame(
        &mut ws,
        json!({
            "type": "pty",
            "action": "create",
            "payload": { "name": "a", "cols": 80, "rows": 24,
                         "shell": "/bin/sh", "cwd": "/tmp" },
            "requestId": "r1",
        }),
    )
    .await;
    let created = recv_until(&mut ws, |f| f["action"] == "created").await;
    assert_eq!(created["requestId"], "r1");
    let session_id = created["payload"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["payload"]["cols"], 80);
    assert_eq!(created["payload"]["cwd"], "/tmp");

    send_frame(
        &mut ws,
        json!({
            "type": "pty",
            "action": "write",
            "payload": { "sessionId": session_id, "data": "echo e2e-marker\n" },
        }),
    )
    .await;

    let mut collected = String::new();
    recv_until(&mut ws, |f| {
        if f["action"] == "data" && f["payload"]["sessionId"] == session_id.as_str() {
            collected.push_str(f["payload"]["data"].as_str().unwrap_or(""));
        }
        collected.contains("e2e-marker")
    })
    .await;

    send_frame(
        &mut ws,
        json!({
            "type": "pty",
            "action": "close",
            "payload": { "sessionId": session_id },
            "requestId": "r2",
        }),
    )
    .await;
    let exit = recv_until(&mut ws, |f| f["action"] == "exit").await;
    assert_eq!(exit["payload"]["sessionId"], session_id.as_str());
}

#[tokio::test]
async fn test_invalid_token_closes_4003() {
    let gw = start_gateway().await;

    // Token of the right length with one byte changed.
    let mut wrong = TOKEN.to_string();
    wrong.replace_range(0..1, "5");
    for bad in [wrong.as_str(), &TOKEN[..TOKEN.len() - 1]] {
        let mut ws = connect(gw.addr).await;
        send_frame(
            &mut ws,
            json!({
                "type": "auth",
                "action": "login",
                "payload": { "token": bad, "clientId": "d", "deviceName": "x" },
            }),
        )
        .await;
        let close = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .expect("no close frame before timeout");
        let close = close.expect("close carried no frame");
        assert_eq!(close.code, CloseCode::Library(4003));
    }
}

#[tokio::test]
async fn test_unauthenticated_frames_keep_connection() {
    let gw = start_gateway().await;
    let mut ws = connect(gw.addr).await;

    // A non-auth frame before auth elicits an error, not a close.
    send_frame(
        &mut ws,
        json!({ "type": "pty", "action": "list", "requestId": "q1" }),
    )
    .await;
    let err = recv_frame(&mut ws).await;
    assert_eq!(err["action"], "error");
    assert_eq!(err["payload"]["error"], "Not authenticated");
    assert_eq!(err["requestId"], "q1");

    // Unparseable bytes likewise.
    ws.send(Message::Text("{ not json".to_string())).await.unwrap();
    let err = recv_frame(&mut ws).await;
    assert_eq!(err["payload"]["error"], "Failed to parse message");

    // The window is still open: a valid auth frame succeeds.
    authenticate(&mut ws, "late-device").await;
}

#[tokio::test]
async fn test_reconnect_restores_ownership() {
    let gw = start_gateway().await;

    let session_id = {
        let mut ws = connect(gw.addr).await;
        authenticate(&mut ws, "device-reconnect").await;
        send_frame(
            &mut ws,
            json!({
                "type": "pty",
                "action": "create",
                "payload": { "shell": "/bin/sh", "cwd": "/tmp" },
                "requestId": "c1",
            }),
        )
        .await;
        let created = recv_until(&mut ws, |f| f["action"] == "created").await;
        created["payload"]["id"].as_str().unwrap().to_string()
        // Connection drops here; ownership must survive.
    };

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut ws = connect(gw.addr).await;
    let success = authenticate(&mut ws, "device-reconnect").await;
    let sessions = success["payload"]["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], session_id.as_str());

    // The restored session accepts writes from the reconnected device.
    send_frame(
        &mut ws,
        json!({
            "type": "pty",
            "action": "write",
            "payload": { "sessionId": session_id, "data": "echo back-again\n" },
            "requestId": "w1",
        }),
    )
    .await;
    recv_until(&mut ws, |f| f["action"] == "written").await;

    // Auto-resubscription: output flows without an explicit subscribe.
    let mut collected = String::new();
    recv_until(&mut ws, |f| {
        if f["action"] == "data" {
            collected.push_str(f["payload"]["data"].as_str().unwrap_or(""));
        }
        collected.contains("back-again")
    })
    .await;

    send_frame(
        &mut ws,
        json!({
            "type": "pty",
            "action": "close",
            "payload": { "sessionId": session_id },
        }),
    )
    .await;
}

#[tokio::test]
async fn test_service_lifecycle_and_output_subscription() {
    let gw = start_gateway().await;
    gw.services
        .register(ServiceDefinition {
            id: "echo-svc".to_string(),
            name: "Echo".to_string(),
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo svc-hello; sleep 30".to_string()],
            cwd: None,
            env: None,
            auto_start: false,
            restart_on_failure: false,
        })
        .await
        .unwrap();

    let mut ws = connect(gw.addr).await;
    let success = authenticate(&mut ws, "device-svc").await;
    let services = success["payload"]["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["status"], "stopped");

    send_frame(
        &mut ws,
        json!({
            "type": "service",
            "action": "subscribe",
            "payload": { "id": "echo-svc" },
            "requestId": "s1",
        }),
    )
    .await;
    recv_until(&mut ws, |f| f["action"] == "subscribed").await;

    send_frame(
        &mut ws,
        json!({
            "type": "service",
            "action": "start",
            "payload": { "id": "echo-svc" },
        }),
    )
    .await;

    // Status events are broadcast; output arrives via the subscription.
    recv_until(&mut ws, |f| {
        f["action"] == "status" && f["payload"]["status"] == "running"
    })
    .await;
    recv_until(&mut ws, |f| {
        f["action"] == "output"
            && f["payload"]["stream"] == "stdout"
            && f["payload"]["data"].as_str().unwrap_or("").contains("svc-hello")
    })
    .await;

    send_frame(
        &mut ws,
        json!({
            "type": "service",
            "action": "stop",
            "payload": { "id": "echo-svc" },
        }),
    )
    .await;
    recv_until(&mut ws, |f| {
        f["action"] == "status" && f["payload"]["status"] == "stopped"
    })
    .await;
}

#[tokio::test]
async fn test_unknown_session_subscribe_errors() {
    let gw = start_gateway().await;
    let mut ws = connect(gw.addr).await;
    authenticate(&mut ws, "device-x").await;

    send_frame(
        &mut ws,
        json!({
            "type": "pty",
            "action": "subscribe",
            "payload": { "sessionId": "no-such-session" },
            "requestId": "q1",
        }),
    )
    .await;
    let err = recv_frame(&mut ws).await;
    assert_eq!(err["action"], "error");
    assert_eq!(err["payload"]["error"], "Session not found");
}
