//! # pagent
//!
//! Headless personal-agent gateway. Remote clients pair once (QR or manual
//! entry), then operate local PTYs and managed services over an
//! authenticated, certificate-pinned WebSocket link, reachable from loopback
//! and the Tailscale overlay only by default.
//!
//! ## Subcommands
//!
//! - `pagent serve` (default) — run the gateway
//! - `pagent pair` — print the pairing payload (host, port, token, cert
//!   fingerprint) as JSON for QR rendering or manual entry
//! - `pagent rotate-token` — replace the auth token; invalidates every
//!   paired client
//! - `pagent regen-cert` — replace the TLS keypair; clients must re-pin

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use pagent::gateway::{self, GatewayState};
use pagent::secrets::token_preview;
use pagent::{config, pairing, tailscale};
use pagent::{CertManager, Config, PtyPool, SecretStore, ServiceSupervisor, SessionRegistry};

/// Headless personal-agent gateway.
#[derive(Parser)]
#[command(name = "pagent", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override the user data directory (default: ~/.pagent).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Skip TLS and serve plaintext WebSockets. Diagnostic use only.
        #[arg(long)]
        plaintext: bool,
    },
    /// Print the pairing payload as JSON.
    Pair,
    /// Generate a new auth token, invalidating all paired clients.
    RotateToken,
    /// Generate a new TLS keypair; paired clients must re-pin.
    RegenCert,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let data_dir = cli.data_dir.unwrap_or_else(config::data_dir);

    match cli.command {
        Some(Commands::Pair) => pair(&data_dir).await,
        Some(Commands::RotateToken) => rotate_token(&data_dir),
        Some(Commands::RegenCert) => regen_cert(&data_dir).await,
        Some(Commands::Serve { plaintext }) => serve(&data_dir, plaintext).await,
        None => serve(&data_dir, false).await,
    }
}

async fn serve(data_dir: &std::path::Path, plaintext: bool) {
    info!("pagent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", data_dir.display());

    let mut config = Config::load(data_dir);
    let secrets = SecretStore::new(data_dir);

    // Early deployments kept the token inside config.json. Move it into the
    // secret store and scrub the file.
    if let Some(legacy) = config.auth_token.take() {
        warn!("Migrating auth token out of config.json");
        if let Err(e) = secrets.import(&legacy) {
            error!("Token migration failed: {e}");
        } else if let Err(e) = config.save(data_dir) {
            error!("Failed to rewrite config.json after migration: {e}");
        }
    }

    let token = match secrets.auth_token() {
        Ok(token) => token,
        Err(e) => {
            error!("Cannot load or create the auth token: {e}");
            std::process::exit(1);
        }
    };
    info!("Auth token loaded ({}…)", token_preview(&token));

    let tailscale_ip = tailscale::local_ipv4().await;
    match tailscale_ip {
        Some(ip) => info!("Tailscale address: {ip}"),
        None => info!("No Tailscale address detected"),
    }

    // TLS is the normal mode; refusing to start beats serving the pairing
    // surface unencrypted by accident.
    let tls = if plaintext {
        None
    } else {
        let manager = CertManager::new(data_dir);
        let cert_info = manager
            .initialize(tailscale_ip)
            .unwrap_or_else(|e| panic!("Cannot prepare TLS credentials: {e}"));
        info!("Certificate fingerprint: {}", cert_info.fingerprint);
        let server_config = CertManager::server_config(&cert_info)
            .unwrap_or_else(|e| panic!("Cannot assemble TLS config: {e}"));
        Some(TlsAcceptor::from(server_config))
    };

    let (pty_tx, pty_rx) = mpsc::channel(1024);
    let (svc_tx, svc_rx) = mpsc::channel(1024);
    let pool = PtyPool::new(pty_tx);
    let services = ServiceSupervisor::new(svc_tx);
    let registry = SessionRegistry::new();

    // Register configured services; bring up the auto-start ones before the
    // listener opens.
    for def in &config.services {
        let auto_start = def.auto_start;
        let id = def.id.clone();
        if let Err(e) = services.register(def.clone()).await {
            warn!("{e}");
            continue;
        }
        if auto_start {
            if let Err(e) = services.start(&id).await {
                warn!("Service {id}: auto-start failed: {e}");
            }
        }
    }

    let port = config.connection.direct_port;
    let state = GatewayState::new(
        Arc::new(config),
        token,
        pool.clone(),
        services.clone(),
        registry,
    );

    let _pty_fanout = gateway::fanout::spawn_pty_fanout(state.clone(), pty_rx);
    let _svc_fanout = gateway::fanout::spawn_service_fanout(state.clone(), svc_rx);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .unwrap_or_else(|e| panic!("Cannot bind port {port}: {e}"));
    info!("Gateway listening on port {port}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway_task = tokio::spawn(gateway::run(state, listener, tls, shutdown_rx));

    wait_for_shutdown().await;

    // Teardown order: services, then PTYs, then the gateway itself.
    info!("Shutting down...");
    services.stop_all().await;
    pool.close_all().await;
    let _ = shutdown_tx.send(true);
    let _ = gateway_task.await;
    info!("Goodbye");
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

/// Print the pairing payload for QR rendering or manual entry.
async fn pair(data_dir: &std::path::Path) {
    let config = Config::load(data_dir);
    let secrets = SecretStore::new(data_dir);
    let token = match secrets.auth_token() {
        Ok(token) => token,
        Err(e) => {
            error!("Cannot load or create the auth token: {e}");
            std::process::exit(1);
        }
    };

    let tailscale_ip = tailscale::local_ipv4().await;
    let manager = CertManager::new(data_dir);
    let cert_info = match manager.initialize(tailscale_ip) {
        Ok(info) => info,
        Err(e) => {
            error!("Cannot prepare TLS credentials: {e}");
            std::process::exit(1);
        }
    };

    let info = pairing::PairingInfo::new(
        tailscale_ip,
        config.connection.direct_port,
        token,
        cert_info.fingerprint,
    );
    match serde_json::to_string_pretty(&info) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Cannot encode pairing payload: {e}"),
    }
}

fn rotate_token(data_dir: &std::path::Path) {
    let secrets = SecretStore::new(data_dir);
    match secrets.rotate() {
        Ok(token) => {
            println!("New token generated ({}…)", token_preview(&token));
            println!("All paired clients must pair again. Restart the gateway to apply.");
        }
        Err(e) => {
            error!("Token rotation failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn regen_cert(data_dir: &std::path::Path) {
    let tailscale_ip = tailscale::local_ipv4().await;
    let manager = CertManager::new(data_dir);
    match manager.regenerate(tailscale_ip) {
        Ok(info) => {
            println!("New certificate fingerprint:");
            println!("{}", info.fingerprint);
            println!("All paired clients must re-pin. Restart the gateway to apply.");
        }
        Err(e) => {
            error!("Certificate regeneration failed: {e}");
            std::process::exit(1);
        }
    }
}
