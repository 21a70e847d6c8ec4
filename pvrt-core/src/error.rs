//! Domain-specific error types for the PVRT transfer stack.
//!
//! All fallible operations return `Result<T, PvrtError>`.
//! No panics on malformed input: every error is typed so callers can
//! decide whether it is fatal (compile, range), message-local (format),
//! soft (window verification) or a trigger for transport fallback.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the PVRT stack.
#[derive(Debug, Error)]
pub enum PvrtError {
    // ── Compile / Blob Errors ────────────────────────────────────
    /// A tile had no palette match under the strict policy.
    #[error("no palette match for tile {tile} at file offset {offset}")]
    Compile { tile: usize, offset: u64 },

    /// A blob or window read fell outside its bounds.
    #[error("range error: {offset}+{length} outside [0, {size})")]
    Range { offset: u64, length: u64, size: u64 },

    /// No blob with the requested identity is registered.
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the expected magic.
    #[error("invalid magic bytes: expected {expected}")]
    InvalidMagic { expected: &'static str },

    /// A field was truncated or otherwise malformed.
    #[error("protocol format error: {0}")]
    ProtocolFormat(String),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The protocol version offered by the peer is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A session phase transition was attempted from the wrong phase.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    // ── Verification Errors ──────────────────────────────────────
    /// A window hash or the whole-object SHA-256 did not match.
    #[error("verification mismatch for {what}: expected {expected}, got {actual}")]
    VerificationMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// A frame referenced a transfer that has no live session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    // ── Transport Errors ─────────────────────────────────────────
    /// Connection refused, reset, or rejected by the peer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The TCP/IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled through its token.
    #[error("operation cancelled")]
    Cancelled,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl PvrtError {
    /// Shorthand for a [`PvrtError::ProtocolFormat`] error.
    pub fn format(msg: impl Into<String>) -> Self {
        PvrtError::ProtocolFormat(msg.into())
    }

    /// Returns `true` for errors the coordinator treats as transport failures
    /// (and therefore as a reason to try the next adapter).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PvrtError::Transport(_) | PvrtError::Io(_) | PvrtError::Timeout(_)
        )
    }
}

/// Convenient result alias.
pub type Result<T> = std::result::Result<T, PvrtError>;

// ── Convenient From implementations ──────────────────────────────

impl From<String> for PvrtError {
    fn from(s: String) -> Self {
        PvrtError::Other(s)
    }
}

impl From<&str> for PvrtError {
    fn from(s: &str) -> Self {
        PvrtError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PvrtError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PvrtError::Other("channel closed".into())
    }
}

impl From<Box<bincode::ErrorKind>> for PvrtError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        PvrtError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for PvrtError {
    fn from(e: serde_json::Error) -> Self {
        PvrtError::Encoding(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PvrtError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PvrtError::Timeout(Duration::ZERO)
    }
}
