//! Event fan-out.
//!
//! Producers (PTY read loops, service pumps, exit watchers) push onto one
//! channel per event type; the two tasks here drain those channels and
//! deliver to clients. Subscriber lists are snapshotted under the table lock
//! and deliveries happen outside it, through each client's bounded queue, so
//! a dead or slow connection cannot stall the producers or its peers.
//!
//! Delivery rules:
//! - `pty/data` and `pty/exit` go only to clients subscribed to the session.
//! - `service/status` is broadcast to every authenticated client.
//! - `service/output` goes only to clients subscribed to that service.

use serde_json::json;
use tokio::sync::mpsc;

use crate::protocol;
use crate::pty::PtyEvent;
use crate::services::ServiceEvent;

use super::GatewayState;

/// Drain PTY events into subscriber queues; release ownership on exit.
pub fn spawn_pty_fanout(
    state: GatewayState,
    mut events: mpsc::Receiver<PtyEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Data { session_id, data } => {
                    let frame = protocol::event(
                        "pty",
                        "data",
                        json!({ "sessionId": session_id, "data": data }),
                    );
                    for endpoint in state.clients.session_subscribers(&session_id).await {
                        endpoint.deliver(&frame);
                    }
                }
                PtyEvent::Exit {
                    session_id,
                    exit_code,
                    signal,
                } => {
                    let frame = protocol::event(
                        "pty",
                        "exit",
                        json!({
                            "sessionId": session_id,
                            "exitCode": exit_code,
                            "signal": signal,
                        }),
                    );
                    for endpoint in state.clients.session_subscribers(&session_id).await {
                        endpoint.deliver(&frame);
                    }
                    // The PTY is gone; the device no longer owns it. Clients
                    // keep any stale owned-session ids until their next
                    // handshake, which is harmless.
                    state.registry.release(&session_id).await;
                }
            }
        }
    })
}

/// Drain service events: status to everyone, output to subscribers.
pub fn spawn_service_fanout(
    state: GatewayState,
    mut events: mpsc::Receiver<ServiceEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServiceEvent::Status(status) => {
                    let frame = protocol::event(
                        "service",
                        "status",
                        serde_json::to_value(&status).unwrap_or_default(),
                    );
                    for endpoint in state.clients.all().await {
                        endpoint.deliver(&frame);
                    }
                }
                ServiceEvent::Output { id, stream, data } => {
                    let frame = protocol::event(
                        "service",
                        "output",
                        json!({ "id": id, "stream": stream, "data": data }),
                    );
                    for endpoint in state.clients.service_subscribers(&id).await {
                        endpoint.deliver(&frame);
                    }
                }
            }
        }
    })
}
