//! # pvrt-send
//!
//! Sender side of blob-referenced window transfer: compiles a file into an
//! IPROG manifest and delivers it to a receiver over the first transport
//! that works.
//!
//! - [`config`]: TOML configuration
//! - [`transport`]: QUIC, WebRTC-style, WebSocket (single/multi), TCP and HTTP adapters
//! - [`coordinator`]: auto race + fallback cascade, transfer status tracking

pub mod config;
pub mod coordinator;
pub mod transport;

pub use config::SenderConfig;
pub use coordinator::{Coordinator, Mode, Targets, TransferState, TransferStatus};
pub use transport::{Endpoint, SendJob, SendReport, Transport, TransportKind};
