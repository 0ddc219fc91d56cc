//! Pairing payload.
//!
//! Everything a client needs to connect and pin the server: host, port, the
//! pre-shared token, and the certificate fingerprint. Encoded as JSON for QR
//! rendering or manual entry by an external surface.

use std::net::Ipv4Addr;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingInfo {
    /// Tailscale IPv4 when available, loopback otherwise.
    pub host: String,
    pub port: u16,
    /// Lowercase hex auth token.
    pub token: String,
    /// `AA:BB:...` uppercase SHA-256 of the certificate DER.
    pub cert_fingerprint: String,
}

impl PairingInfo {
    pub fn new(
        tailscale_ip: Option<Ipv4Addr>,
        port: u16,
        token: String,
        cert_fingerprint: String,
    ) -> Self {
        let host = tailscale_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Self {
            host,
            port,
            token,
            cert_fingerprint,
        }
    }
}
