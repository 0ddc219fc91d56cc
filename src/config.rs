//! Configuration loading and defaults.
//!
//! Configuration lives in `<userData>/config.json` and is meant to be
//! human-editable:
//!
//! ```json
//! {
//!   "connection": { "directPort": 9876, "restrictToTailscale": true },
//!   "services": [
//!     { "id": "relay", "name": "Relay", "command": "/usr/local/bin/relay",
//!       "args": ["--quiet"], "autoStart": true, "restartOnFailure": true }
//!   ],
//!   "autoLaunch": false,
//!   "startMinimized": false
//! }
//! ```
//!
//! Precedence (highest wins): `PAGENT_PORT` env var, then the file, then
//! compiled defaults. A malformed file is reported and replaced by defaults
//! in memory; it is never overwritten unless a save is required.
//!
//! The auth token does not belong in this file. Early deployments stored it
//! under `"authToken"`; when that key is present it is surfaced to the caller
//! for migration into the secret store and dropped from the next save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_FILE: &str = "config.json";

/// Top-level configuration, deserialized from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
    #[serde(default)]
    pub auto_launch: bool,
    #[serde(default)]
    pub start_minimized: bool,
    /// Legacy location of the auth token. Never serialized; drained by the
    /// startup migration.
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// TCP port the gateway binds on all interfaces (default 9876).
    #[serde(default = "default_port")]
    pub direct_port: u16,
    /// Restrict remote peers to loopback + the Tailscale CGNAT range
    /// (default true).
    #[serde(default = "default_restrict")]
    pub restrict_to_tailscale: bool,
}

/// A managed child process the supervisor may run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub id: String,
    pub name: String,
    /// Absolute path or PATH-resolvable binary.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Extra environment merged over the inherited one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub restart_on_failure: bool,
}

fn default_port() -> u16 {
    9876
}
fn default_restrict() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            direct_port: default_port(),
            restrict_to_tailscale: default_restrict(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            services: Vec::new(),
            auto_launch: false,
            start_minimized: false,
            auth_token: None,
        }
    }
}

impl Config {
    /// Load `<data_dir>/config.json`, falling back to defaults when the file
    /// is missing or malformed, then apply env overrides.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<Config>(&content) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("Failed to parse {}: {e}, using defaults", path.display());
                        Config::default()
                    }
                },
                Err(e) => {
                    warn!("Failed to read {}: {e}, using defaults", path.display());
                    Config::default()
                }
            }
        } else {
            Config::default()
        };

        if let Ok(port) = std::env::var("PAGENT_PORT") {
            match port.parse() {
                Ok(p) => config.connection.direct_port = p,
                Err(_) => warn!("Ignoring unparseable PAGENT_PORT={port}"),
            }
        }

        config
    }

    /// Write the configuration back as pretty JSON. The auth token is never
    /// part of the output.
    pub fn save(&self, data_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(data_dir.join(CONFIG_FILE), json)
    }
}

/// The user data directory: `$PAGENT_DATA_DIR`, or `~/.pagent`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PAGENT_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pagent")
}
