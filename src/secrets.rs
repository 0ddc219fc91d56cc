//! Authentication token storage.
//!
//! The pairing token is 32 random bytes rendered as lowercase hex. It lives
//! in the platform secret store (keychain / Secret Service / credential
//! manager) under the `pagent` service; hosts without a usable secret store
//! fall back to a 0600 file in the user data directory. The full token is
//! never logged; use [`token_preview`] in diagnostics.

use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::warn;

const KEYRING_SERVICE: &str = "pagent";
const KEYRING_USER: &str = "gateway-token";
const TOKEN_FILE: &str = "token";

/// Handle to the stored auth token.
#[derive(Clone)]
pub struct SecretStore {
    data_dir: PathBuf,
}

impl SecretStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// The current auth token, generating and persisting one on first use.
    ///
    /// Keyring failures degrade to the fallback file with a warning; a hard
    /// error here means the fallback file itself could not be used.
    pub fn auth_token(&self) -> std::io::Result<String> {
        if let Some(token) = self.load()? {
            return Ok(token);
        }
        let token = generate_token();
        self.store(&token)?;
        Ok(token)
    }

    /// Replace the stored token with a freshly generated one.
    ///
    /// Every live connection authenticated against the old token must be
    /// re-paired; the gateway is expected to be restarted after rotation.
    pub fn rotate(&self) -> std::io::Result<String> {
        let token = generate_token();
        self.store(&token)?;
        Ok(token)
    }

    /// Import a token that leaked into the config file (legacy layout).
    pub fn import(&self, token: &str) -> std::io::Result<()> {
        self.store(token)
    }

    fn load(&self) -> std::io::Result<Option<String>> {
        match keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER) {
            Ok(entry) => match entry.get_password() {
                Ok(token) => return Ok(Some(token)),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    warn!("Secret store read failed ({e}), using token file");
                }
            },
            Err(e) => {
                warn!("Secret store unavailable ({e}), using token file");
            }
        }

        let path = self.token_path();
        if path.exists() {
            let token = std::fs::read_to_string(&path)?.trim().to_string();
            if !token.is_empty() {
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    fn store(&self, token: &str) -> std::io::Result<()> {
        if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER) {
            if entry.set_password(token).is_ok() {
                // Remove any stale fallback copy so there is one source of truth.
                let _ = std::fs::remove_file(self.token_path());
                return Ok(());
            }
            warn!("Secret store write failed, falling back to token file");
        }
        self.store_file(token)
    }

    /// Write the token to `<data_dir>/token`, readable only by the owner.
    fn store_file(&self, token: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let path = self.token_path();
        #[cfg(unix)]
        {
            use std::fs::OpenOptions;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.write_all(token.as_bytes())?;
        }
        #[cfg(not(unix))]
        std::fs::write(&path, token)?;
        Ok(())
    }

    fn token_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE)
    }
}

/// 32 bytes from the OS CSPRNG, lowercase hex.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// First 8 hex chars of a token, for log output.
pub fn token_preview(token: &str) -> &str {
    &token[..8.min(token.len())]
}
