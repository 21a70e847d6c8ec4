//! Configuration for the PVRT sender.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pvrt_core::{BlobSpec, IprogOptions, PaletteConfig};

use crate::coordinator::Targets;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Shared blob both peers generate.
    pub blob: BlobSpec,
    /// Palette region indexed by the compiler.
    pub palette: PaletteConfig,
    /// Window partitioning and compile policy.
    pub iprog: IprogOptions,
    /// Receiver address and transport tuning.
    pub network: NetworkConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Receiver host name or address.
    pub host: String,
    /// Receiver QUIC (UDP) port.
    pub quic_port: u16,
    /// Receiver raw TCP port.
    pub tcp_port: u16,
    /// Receiver HTTP port (WebSocket, WebRTC signalling, `/ingest`).
    pub http_port: u16,
    /// Use `https://` / `wss://` for the HTTP-based transports.
    pub tls: bool,
    /// Per-attempt timeout in the fallback cascade.
    pub timeout_ms: u64,
    /// Time allowed for the QUIC / WebRTC race.
    pub race_timeout_ms: u64,
    /// Channel count for the multi-channel WebSocket transport.
    pub channels: u16,
    /// DATA frame payload size in bytes.
    pub frame_payload: usize,
    /// Binary WIN/END/DONE control frames instead of JSON.
    pub binary_control: bool,
    /// Pre-shared key. Empty means none.
    pub psk: String,
    /// Hex SHA-256 of the receiver's QUIC certificate. Empty accepts any.
    pub quic_cert_sha256: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            quic_port: 7443,
            tcp_port: 7444,
            http_port: 7480,
            tls: false,
            timeout_ms: 15_000,
            race_timeout_ms: 3_000,
            channels: 4,
            frame_payload: pvrt_core::sync::DEFAULT_CHUNK,
            binary_control: true,
            psk: String::new(),
            quic_cert_sha256: String::new(),
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

impl SenderConfig {
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

    pub fn psk(&self) -> Option<String> {
        Some(self.network.psk.clone()).filter(|p| !p.is_empty())
    }

    /// Pinned QUIC certificate digest, if configured.
    pub fn cert_pin(&self) -> Result<Option<[u8; 32]>, pvrt_core::PvrtError> {
        let pin = self.network.quic_cert_sha256.trim();
        if pin.is_empty() {
            return Ok(None);
        }
        pvrt_core::hash::parse_sha256(pin).map(Some)
    }

    /// Receiver addresses per transport.
    pub fn targets(&self) -> Targets {
        let n = &self.network;
        Targets {
            host: n.host.clone(),
            quic_port: n.quic_port,
            tcp_port: n.tcp_port,
            http_port: n.http_port,
            tls: n.tls,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.network.timeout_ms.max(1))
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.network.race_timeout_ms.max(1))
    }
}

// ── Tests ────────────────────────────────────────────────────────
