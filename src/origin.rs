//! Network-origin admission.
//!
//! The gateway listens on all interfaces, so the first gate on every inbound
//! TCP connection is the peer address itself: loopback is always admitted,
//! and remote peers are admitted only from the Tailscale CGNAT block
//! (`100.64.0.0/10`). The decision uses nothing but the address, so it runs
//! before any bytes are read from the socket.

use std::net::IpAddr;

/// Decides whether a peer address may speak to the gateway at all.
#[derive(Debug, Clone, Copy)]
pub struct OriginFilter {
    /// When false, every origin is admitted (open mode).
    pub restrict_to_tailscale: bool,
}

impl OriginFilter {
    pub fn new(restrict_to_tailscale: bool) -> Self {
        Self {
            restrict_to_tailscale,
        }
    }

    /// Admission decision for a peer address.
    ///
    /// IPv6-mapped IPv4 addresses (`::ffff:a.b.c.d`) are unwrapped first so a
    /// dual-stack listener sees the same decision as a v4-only one.
    pub fn admits(&self, addr: IpAddr) -> bool {
        if !self.restrict_to_tailscale {
            return true;
        }
        match normalize(addr) {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                v4 == std::net::Ipv4Addr::LOCALHOST || (o[0] == 100 && (64..=127).contains(&o[1]))
            }
            IpAddr::V6(v6) => v6 == std::net::Ipv6Addr::LOCALHOST,
        }
    }

    /// Whether the peer is the local machine (used for the `isLocal` client
    /// flag, independent of admission).
    pub fn is_local(addr: IpAddr) -> bool {
        normalize(addr).is_loopback()
    }
}

/// Strip the `::ffff:` IPv6-mapped prefix if present.
fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(addr, IpAddr::V4),
        IpAddr::V4(_) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admits(ip: &str) -> bool {
        OriginFilter::new(true).admits(ip.parse().unwrap())
    }

    #[test]
    fn test_loopback_admitted() {
        assert!(admits("127.0.0.1"));
        assert!(admits("::1"));
        assert!(admits("::ffff:127.0.0.1"));
    }

    #[test]
    fn test_cgnat_range_edges() {
        assert!(!admits("100.63.255.255"));
        assert!(admits("100.64.0.0"));
        assert!(admits("100.100.50.1"));
        assert!(admits("100.127.255.255"));
        assert!(!admits("100.128.0.0"));
    }

    #[test]
    fn test_public_rejected() {
        assert!(!admits("192.0.2.1"));
        assert!(!admits("10.0.0.5"));
        assert!(!admits("2001:db8::1"));
    }

    #[test]
    fn test_mapped_cgnat_admitted() {
        assert!(admits("::ffff:100.64.0.1"));
    }

    #[test]
    fn test_open_mode_admits_everything() {
        let open = OriginFilter::new(false);
        assert!(open.admits("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_is_local() {
        assert!(OriginFilter::is_local("127.0.0.1".parse().unwrap()));
        assert!(OriginFilter::is_local("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!OriginFilter::is_local("100.64.0.1".parse().unwrap()));
    }
}
