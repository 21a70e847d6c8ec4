//! Configuration for the PVRT receiver service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pvrt_core::{BlobSpec, ObjectStore, Registry, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Blob generated at startup.
    pub blob: BlobSpec,
    /// Object store and window cache.
    pub storage: StorageConfig,
    /// Listener settings.
    pub network: NetworkConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for verified objects. Empty keeps them in memory only.
    pub dir: String,
    /// Verified windows kept for NEED negotiation.
    pub window_cache: usize,
    /// Megabytes of verified objects held in memory.
    pub memory_mb: usize,
    /// Transfers whose outcome stays queryable.
    pub history: usize,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address every listener binds.
    pub bind: String,
    /// QUIC (UDP) port. 0 disables the listener.
    pub quic_port: u16,
    /// Raw TCP port. 0 disables the listener.
    pub tcp_port: u16,
    /// HTTP port (WebSocket, WebRTC signalling, `/ingest`, `/transfers`).
    pub http_port: u16,
    /// Required pre-shared key. Empty accepts any sender.
    pub psk: String,
    /// Generate blobs named by senders instead of rejecting them.
    pub accept_unknown_blobs: bool,
    /// Largest `/ingest` body in megabytes.
    pub max_body_mb: usize,
    /// A transfer waiting for channels longer than this is failed.
    pub session_timeout_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            window_cache: pvrt_core::registry::DEFAULT_WINDOW_CACHE,
            memory_mb: pvrt_core::registry::DEFAULT_OBJECT_MEMORY / (1024 * 1024),
            history: pvrt_core::registry::DEFAULT_HISTORY,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            quic_port: 7443,
            tcp_port: 7444,
            http_port: 7480,
            psk: String::new(),
            accept_unknown_blobs: false,
            max_body_mb: 512,
            session_timeout_ms: 60_000,
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

impl ReceiverConfig {
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

    pub fn max_body(&self) -> usize {
        self.network.max_body_mb.max(1) * 1024 * 1024
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.network.session_timeout_ms.max(1))
    }

    /// Registry with the configured store, cache and startup blob.
    pub fn build_registry(&self) -> Result<Registry> {
        let objects = if self.storage.dir.is_empty() {
            ObjectStore::in_memory()
        } else {
            ObjectStore::with_dir(&self.storage.dir)?
        };
        let objects = objects.with_memory_limit(self.storage.memory_mb * 1024 * 1024);
        let registry = Registry::new(objects, self.storage.window_cache)
            .history_limit(self.storage.history)
            .accept_unknown_blobs(self.network.accept_unknown_blobs);
        registry.create_or_attach(&self.blob, true)?;
        Ok(registry)
    }
}

// ── Tests ────────────────────────────────────────────────────────
