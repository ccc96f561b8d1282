//! Configuration for the relay harness.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tunmux_core::TunnelConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Peer link settings.
    pub link: LinkConfig,
    /// Tunnel tuning shared by every tunnel.
    pub tunnel: TunnelConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// How the peer link is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Accept exactly one peer on `address`.
    Listen,
    /// Dial the peer at `address`.
    Connect,
}

/// Peer link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub mode: LinkMode,
    /// `host:port` to listen on or connect to.
    pub address: String,
    /// Name this side gives the peer session.
    pub session: String,
    /// Id of the single tunnel the relay carries. Both sides must agree.
    pub tunnel_id: u64,
    /// Give up dialing after this long.
    pub connect_timeout_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::Listen,
            address: "127.0.0.1:7400".into(),
            session: "peer".into(),
            tunnel_id: 1,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl RelayConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}

// ── Tests ────────────────────────────────────────────────────────
