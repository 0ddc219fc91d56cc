//! The gateway: TLS listener, WebSocket upgrade, connection lifecycle.
//!
//! ## Connection lifecycle
//!
//! 1. TCP accept. The origin filter judges the peer address before anything
//!    is read; a denied peer still gets its handshakes completed, but only so
//!    close code 4000 can be delivered. No frame from it is ever read.
//! 2. Optional TLS accept (credentials from [`crate::certs::CertManager`]).
//!    Handshake failures are dropped silently.
//! 3. WebSocket accept, at whatever path the client chose.
//! 4. Auth phase: the client has 10 seconds to present a valid `auth` frame
//!    (close 4001 on timeout, 4003 on a bad token). Other frames elicit
//!    `system/error` but do not close the connection.
//! 5. On success the server replies `auth/success` (carrying the assigned
//!    connection id, the sessions visible to the device, and current service
//!    statuses) before the client becomes reachable by fan-out, so auth
//!    success is observable before any event frame.
//! 6. Frames are then routed by [`router`]; malformed ones elicit
//!    `system/error` and the connection stays up.
//!
//! Outbound traffic goes through a bounded per-client queue drained by a
//! writer task; see [`clients`] for the backpressure rules.

pub mod clients;
pub mod fanout;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::config::Config;
use crate::origin::OriginFilter;
use crate::protocol::{self, AuthPayload, Frame, PtySession};
use crate::pty::PtyPool;
use crate::registry::SessionRegistry;
use crate::services::ServiceSupervisor;
use crate::util;

use clients::{ClientHandle, ClientMap, SEND_QUEUE_DEPTH};

/// Shared state handed to every connection task and fan-out task.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// Expected auth token (lowercase hex).
    pub token: Arc<String>,
    /// Monotonic start instant, for the `system/info` uptime field.
    pub started_at: Instant,
    pub pool: PtyPool,
    pub services: ServiceSupervisor,
    pub registry: SessionRegistry,
    pub clients: ClientMap,
    pub origin: OriginFilter,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        token: String,
        pool: PtyPool,
        services: ServiceSupervisor,
        registry: SessionRegistry,
    ) -> Self {
        let origin = OriginFilter::new(config.connection.restrict_to_tailscale);
        Self {
            config,
            token: Arc::new(token),
            started_at: Instant::now(),
            pool,
            services,
            registry,
            clients: ClientMap::new(),
            origin,
        }
    }
}

/// Accept loop. Runs until the shutdown signal flips, then terminates every
/// live client connection and drops the listener.
pub async fn run(
    state: GatewayState,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    if tls.is_none() {
        warn!("TLS disabled, running in plaintext diagnostic mode");
    }
    loop {
        tokio::select! {
            result = listener.accept() => {
                if let Ok((stream, addr)) = result {
                    let state = state.clone();
                    let tls = tls.clone();
                    tokio::spawn(handle_connection(stream, addr, state, tls));
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Gateway closing ({} client(s))", state.clients.count().await);
    state.clients.disconnect_all().await;
}

/// Per-connection entry: origin decision, then TLS, then WebSocket.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: GatewayState,
    tls: Option<TlsAcceptor>,
) {
    // Decided from the address alone, before any bytes are read.
    let admitted = state.origin.admits(addr.ip());

    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => run_ws(tls_stream, addr, state, admitted).await,
            Err(e) => {
                debug!("TLS handshake failed from {addr}: {e}");
            }
        },
        None => run_ws(stream, addr, state, admitted).await,
    }
}

/// WebSocket accept + auth phase + routed read loop.
async fn run_ws<S>(stream: S, addr: SocketAddr, state: GatewayState, admitted: bool)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake failed from {addr}: {e}");
            return;
        }
    };
    let (mut ws_sink, mut ws_stream) = ws.split();

    // All outbound traffic funnels through this queue so session I/O tasks
    // can send without holding the socket.
    let (tx, mut rx) = mpsc::channel::<Message>(SEND_QUEUE_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    if !admitted {
        warn!("Rejected connection from disallowed origin {addr}");
        let _ = tx
            .send(close_frame(
                auth::CLOSE_ORIGIN_DENIED,
                "not allowed from this address",
            ))
            .await;
        drop(tx);
        let _ = writer.await;
        return;
    }

    // --- Auth phase ---
    let deadline = tokio::time::Instant::now() + auth::AUTH_TIMEOUT;
    let authed: Option<(AuthPayload, Option<String>)> = loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                info!("Client {addr}: authentication timeout");
                let _ = tx
                    .send(close_frame(auth::CLOSE_AUTH_TIMEOUT, "Authentication timeout"))
                    .await;
                break None;
            }
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame = match Frame::parse(&text) {
                        Ok(f) => f,
                        Err(_) => {
                            send(&tx, protocol::error_frame("Failed to parse message", None)).await;
                            continue;
                        }
                    };
                    if frame.kind != "auth" {
                        send(
                            &tx,
                            protocol::error_frame("Not authenticated", frame.request_id.as_deref()),
                        )
                        .await;
                        continue;
                    }
                    let rid = frame.request_id.clone();
                    match frame.payload_as::<AuthPayload>() {
                        Ok(payload) => {
                            if auth::verify_token(&state.token, &payload.token) {
                                break Some((payload, rid));
                            }
                            info!("Client {addr}: invalid token");
                            let _ = tx
                                .send(close_frame(
                                    auth::CLOSE_INVALID_TOKEN,
                                    "Invalid authentication token",
                                ))
                                .await;
                            break None;
                        }
                        Err(e) => {
                            send(&tx, protocol::error_frame(&e, rid.as_deref())).await;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(_)) => break None,
            }
        }
    };

    let Some((auth_payload, auth_rid)) = authed else {
        drop(tx);
        let _ = writer.await;
        return;
    };

    // --- Registration ---
    let conn_id = Uuid::new_v4().to_string();
    let is_local = OriginFilter::is_local(addr.ip());
    let device_id = auth_payload.client_id.clone();

    // Ownership survives reconnects: rebuild this device's sessions from the
    // global map and auto-resubscribe to exactly those.
    let owned = state.registry.sessions_owned_by(&device_id).await;
    let sessions = visible_sessions(&state, is_local, &owned).await;
    let services = state.services.list_all().await;

    let success = protocol::response(
        "auth",
        "success",
        serde_json::json!({
            "clientId": conn_id,
            "sessions": sessions,
            "services": services,
        }),
        auth_rid.as_deref(),
    );
    // Sent before the client is inserted into the table, so no fan-out frame
    // can precede it.
    send(&tx, success).await;

    let (disconnect_tx, mut disconnect_rx) = watch::channel(false);
    let mut client = ClientHandle::new(
        conn_id.clone(),
        device_id.clone(),
        auth_payload.device_name.clone(),
        util::now_ms(),
        is_local,
        tx.clone(),
        disconnect_tx,
    );
    client.owned_sessions = owned.iter().cloned().collect();
    client.session_subscriptions = owned.into_iter().collect();
    state.clients.insert(client).await;
    info!(
        "Client {} authenticated (device {device_id:?}, local={is_local})",
        &conn_id[..8]
    );

    // --- Routed read loop ---
    loop {
        tokio::select! {
            _ = disconnect_rx.changed() => {
                if *disconnect_rx.borrow() {
                    break;
                }
            }
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::parse(&text) {
                    Ok(frame) => router::dispatch(&state, &conn_id, frame, &tx).await,
                    Err(_) => {
                        send(&tx, protocol::error_frame("Failed to parse message", None)).await;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }

    // Subscriptions die with the connection; ownership stays in the registry.
    state.clients.remove(&conn_id).await;
    let _ = tx.send(Message::Close(None)).await;
    drop(tx);
    let _ = writer.await;
    info!("Client {} disconnected", &conn_id[..8]);
}

/// Sessions listed in a device's `auth/success`: everything for local
/// clients, only owned sessions for remote ones.
async fn visible_sessions(
    state: &GatewayState,
    is_local: bool,
    owned: &[String],
) -> Vec<PtySession> {
    if is_local {
        return state.pool.list().await;
    }
    let mut sessions = Vec::with_capacity(owned.len());
    for id in owned {
        if let Some(session) = state.pool.get(id).await {
            sessions.push(session);
        }
    }
    sessions
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Library(code),
        reason: reason.into(),
    }))
}

async fn send(tx: &mpsc::Sender<Message>, frame: serde_json::Value) {
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = tx.send(Message::Text(text)).await;
    }
}
