//! Local Tailscale address discovery.
//!
//! The gateway only needs one fact from Tailscale: the machine's own IPv4
//! inside the tailnet, used as a certificate SAN and as the pairing host.
//! Absence of the CLI, a stopped daemon, or unparseable output all degrade to
//! `None`, and pairing falls back to loopback.

use std::net::Ipv4Addr;

use tokio::process::Command;
use tracing::debug;

/// The local Tailscale IPv4, if the `tailscale` CLI reports one.
pub async fn local_ipv4() -> Option<Ipv4Addr> {
    let output = Command::new("tailscale")
        .args(["ip", "-4"])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        debug!("tailscale ip -4 exited with {}", output.status);
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .map(str::trim)
        .find_map(|line| line.parse::<Ipv4Addr>().ok())
        .filter(|ip| ip.octets()[0] == 100)
}
