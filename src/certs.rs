//! TLS certificate lifecycle for pinning-based pairing.
//!
//! The gateway presents a self-signed X.509 certificate; clients pin its
//! SHA-256 fingerprint, delivered out of band in the pairing payload, instead
//! of consulting a CA store. The certificate and its RSA-2048 key live in
//! `<userData>/certs/` (`server.crt` 0644, `server.key` 0600) and are loaded
//! on startup, generated when missing.
//!
//! The fingerprint is computed over the DER bytes decoded straight out of the
//! PEM body. Re-encoding through an X.509 library first is not an option: a
//! round-trip can produce a different DER byte sequence, and then the value
//! printed here would not match what a pinning client computes from the
//! certificate the TLS stack actually presents.

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use tracing::info;

const CERT_FILE: &str = "server.crt";
const KEY_FILE: &str = "server.key";
const COMMON_NAME: &str = "Personal Agent";
const VALIDITY_DAYS: i64 = 3650;

/// Errors from certificate generation, persistence, or TLS assembly.
#[derive(Debug)]
pub enum CertError {
    Io(std::io::Error),
    /// Key or certificate generation failed.
    Generate(String),
    /// On-disk PEM did not decode.
    Pem(String),
    /// rustls rejected the loaded material.
    Tls(String),
}

impl std::fmt::Display for CertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertError::Io(e) => write!(f, "certificate I/O error: {e}"),
            CertError::Generate(e) => write!(f, "certificate generation failed: {e}"),
            CertError::Pem(e) => write!(f, "invalid PEM: {e}"),
            CertError::Tls(e) => write!(f, "TLS configuration error: {e}"),
        }
    }
}

impl From<std::io::Error> for CertError {
    fn from(e: std::io::Error) -> Self {
        CertError::Io(e)
    }
}

/// The loaded or freshly generated credential pair.
#[derive(Clone)]
pub struct CertificateInfo {
    pub cert_pem: String,
    pub key_pem: String,
    /// Colon-separated uppercase SHA-256 of the certificate DER.
    pub fingerprint: String,
}

/// Owns the on-disk certificate pair under `<userData>/certs/`.
pub struct CertManager {
    certs_dir: PathBuf,
}

impl CertManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            certs_dir: data_dir.join("certs"),
        }
    }

    /// Load the existing pair, or generate a fresh one when either file is
    /// missing or unreadable.
    ///
    /// `additional_ip` (the local Tailscale address, when there is one) is
    /// added to the subject alternative names of a newly generated
    /// certificate; it has no effect on a loaded pair.
    pub fn initialize(&self, additional_ip: Option<Ipv4Addr>) -> Result<CertificateInfo, CertError> {
        let cert_path = self.certs_dir.join(CERT_FILE);
        let key_path = self.certs_dir.join(KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            match fingerprint_from_pem(&cert_pem) {
                Ok(fingerprint) => {
                    info!("Loaded certificate ({})", &fingerprint[..23]);
                    return Ok(CertificateInfo {
                        cert_pem,
                        key_pem,
                        fingerprint,
                    });
                }
                Err(e) => {
                    info!("Stored certificate unreadable ({e}), regenerating");
                }
            }
        }

        self.regenerate(additional_ip)
    }

    /// Unconditionally replace the on-disk pair.
    ///
    /// Live TLS sockets keep the credentials they handshook with; the gateway
    /// must be restarted for new connections to see the new pair.
    pub fn regenerate(&self, additional_ip: Option<Ipv4Addr>) -> Result<CertificateInfo, CertError> {
        let info = generate_pair(additional_ip)?;
        std::fs::create_dir_all(&self.certs_dir)?;
        std::fs::write(self.certs_dir.join(CERT_FILE), &info.cert_pem)?;
        write_key_file(&self.certs_dir.join(KEY_FILE), &info.key_pem)?;
        info!("Generated certificate ({})", &info.fingerprint[..23]);
        Ok(info)
    }

    /// Fingerprint of the certificate currently on disk.
    pub fn fingerprint(&self) -> Result<String, CertError> {
        let cert_pem = std::fs::read_to_string(self.certs_dir.join(CERT_FILE))?;
        fingerprint_from_pem(&cert_pem)
    }

    /// Assemble the rustls server configuration from a credential pair.
    pub fn server_config(info: &CertificateInfo) -> Result<Arc<rustls::ServerConfig>, CertError> {
        let cert_chain = rustls_pemfile::certs(&mut info.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::Pem(e.to_string()))?;
        if cert_chain.is_empty() {
            return Err(CertError::Pem("no certificate in PEM".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut info.key_pem.as_bytes())
            .map_err(|e| CertError::Pem(e.to_string()))?
            .ok_or_else(|| CertError::Pem("no private key in PEM".to_string()))?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| CertError::Tls(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

/// Generate an RSA-2048 key and a self-signed certificate around it.
fn generate_pair(additional_ip: Option<Ipv4Addr>) -> Result<CertificateInfo, CertError> {
    // rcgen signs with RSA keys but cannot generate them, so the key comes
    // from the rsa crate as PKCS#8 PEM.
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, 2048).map_err(|e| CertError::Generate(e.to_string()))?;
    let key_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CertError::Generate(e.to_string()))?
        .to_string();
    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CertError::Generate(e.to_string()))?;

    let mut sans = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    if let Some(ip) = additional_ip {
        sans.push(ip.to_string());
    }

    let mut params =
        CertificateParams::new(sans).map_err(|e| CertError::Generate(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, COMMON_NAME);
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(VALIDITY_DAYS);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generate(e.to_string()))?;
    let cert_pem = cert.pem();
    let fingerprint = fingerprint_from_pem(&cert_pem)?;

    Ok(CertificateInfo {
        cert_pem,
        key_pem,
        fingerprint,
    })
}

/// Write the private key readable only by the owning user.
fn write_key_file(path: &Path, key_pem: &str) -> Result<(), CertError> {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(key_pem.as_bytes())?;
    }
    #[cfg(not(unix))]
    std::fs::write(path, key_pem)?;
    Ok(())
}

/// SHA-256 over the DER decoded from the PEM body, formatted `AA:BB:...`.
pub fn fingerprint_from_pem(cert_pem: &str) -> Result<String, CertError> {
    let der = der_from_pem(cert_pem)?;
    let digest = Sha256::digest(&der);
    Ok(digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Strip the BEGIN/END armor and whitespace, base64-decode the body.
fn der_from_pem(cert_pem: &str) -> Result<Vec<u8>, CertError> {
    let body: String = cert_pem
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return Err(CertError::Pem("empty PEM body".to_string()));
    }
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| CertError::Pem(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let info = generate_pair(None).unwrap();
        // 32 bytes → 32 uppercase hex pairs joined by 31 colons.
        assert_eq!(info.fingerprint.len(), 95);
        assert!(info
            .fingerprint
            .split(':')
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit())));
        assert_eq!(info.fingerprint, info.fingerprint.to_uppercase());
    }

    #[test]
    fn test_manual_der_matches_pemfile_der() {
        // The hand-rolled PEM body decode must agree byte-for-byte with a
        // conformant PEM parser, otherwise pinning clients compute a
        // different fingerprint than the pairing payload advertises.
        let info = generate_pair(None).unwrap();
        let manual = der_from_pem(&info.cert_pem).unwrap();
        let parsed: Vec<_> = rustls_pemfile::certs(&mut info.cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(manual.as_slice(), parsed[0].as_ref());
    }

    #[test]
    fn test_initialize_loads_existing_pair() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CertManager::new(dir.path());
        let first = mgr.initialize(None).unwrap();
        let second = mgr.initialize(None).unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(mgr.fingerprint().unwrap(), first.fingerprint);
    }

    #[test]
    fn test_regenerate_replaces_pair() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CertManager::new(dir.path());
        let first = mgr.initialize(None).unwrap();
        let second = mgr.regenerate(None).unwrap();
        assert_ne!(first.fingerprint, second.fingerprint);
        assert_eq!(mgr.fingerprint().unwrap(), second.fingerprint);
    }

    #[test]
    fn test_key_file_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CertManager::new(dir.path());
        mgr.initialize(None).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("certs").join(KEY_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_server_config_builds() {
        let info = generate_pair(Some(Ipv4Addr::new(100, 100, 1, 2))).unwrap();
        CertManager::server_config(&info).unwrap();
    }

    #[test]
    fn test_der_from_pem_rejects_garbage() {
        assert!(der_from_pem("not a pem at all").is_err());
        assert!(der_from_pem("-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n").is_err());
    }
}
