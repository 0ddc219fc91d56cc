#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]

//! pagent library — the remote session gateway behind the `pagent` binary.
//!
//! A headless agent that lets paired remote clients operate local
//! pseudo-terminals and long-running child services over an authenticated,
//! TLS-encrypted WebSocket link:
//!
//! - `config` — JSON configuration with env overrides
//! - `secrets` — auth token in the OS secret store (file fallback)
//! - `certs` — self-signed certificate lifecycle and pinning fingerprint
//! - `origin` — loopback + Tailscale CGNAT admission
//! - `auth` — constant-time token verification, close codes
//! - `registry` — process-wide session ownership, stable across reconnects
//! - `pty` — PTY pool: spawn, write, resize, close, output events
//! - `services` — supervised child processes with restart-on-failure
//! - `protocol` — wire envelope and payload types
//! - `gateway` — TLS listener, WebSocket upgrade, routing, fan-out
//! - `tailscale` / `pairing` — pairing payload assembly

pub mod auth;
pub mod certs;
pub mod config;
pub mod gateway;
pub mod origin;
pub mod pairing;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod secrets;
pub mod services;
pub mod tailscale;
pub mod util;

// Re-export key types at crate root for convenience.
pub use certs::CertManager;
pub use config::Config;
pub use gateway::GatewayState;
pub use pty::PtyPool;
pub use registry::SessionRegistry;
pub use secrets::SecretStore;
pub use services::ServiceSupervisor;
