//! Transport adapters.
//!
//! Every adapter implements [`Transport`]: deliver one [`SendJob`] to one
//! [`Endpoint`] and return once the receiver has acknowledged it. An
//! `Err` is what the coordinator falls back on.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pvrt_core::{
    AckStatus, Control, Frame, FrameSequencer, Iprog, Preface, PvrtError, Result,
};

pub mod https;
pub mod link;
pub mod quic;
pub mod tcp;
pub mod webrtc;
pub mod ws;

pub use https::HttpsTransport;
pub use quic::QuicTransport;
pub use tcp::TcpTransport;
pub use webrtc::WebRtcTransport;
pub use ws::WsTransport;

// ── TransportKind ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Quic,
    #[serde(rename = "webrtc")]
    WebRtc,
    WsMulti,
    Ws,
    Tcp,
    Https,
}

impl TransportKind {
    pub const ALL: [TransportKind; 6] = [
        TransportKind::Quic,
        TransportKind::WebRtc,
        TransportKind::WsMulti,
        TransportKind::Ws,
        TransportKind::Tcp,
        TransportKind::Https,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Quic => "quic",
            TransportKind::WebRtc => "webrtc",
            TransportKind::WsMulti => "ws-multi",
            TransportKind::Ws => "ws",
            TransportKind::Tcp => "tcp",
            TransportKind::Https => "https",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = PvrtError;

    fn from_str(s: &str) -> Result<Self> {
        TransportKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PvrtError::Other(format!("unknown transport {s:?}")))
    }
}

// ── Endpoint / SendJob / SendReport ──────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Use TLS for the HTTP-based adapters (`wss://`, `https://`).
    pub tls: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }

    pub fn ws_url(&self, path: &str) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything an adapter needs to deliver one object.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub transfer_id: String,
    pub iprog: Arc<Iprog>,
    pub psk: Option<String>,
    /// Channel count for multi-channel adapters.
    pub channels: u16,
    /// Payload bytes per DATA frame.
    pub frame_payload: usize,
    pub binary_control: bool,
}

impl SendJob {
    pub fn new(transfer_id: impl Into<String>, iprog: Arc<Iprog>) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            iprog,
            psk: None,
            channels: 4,
            frame_payload: pvrt_core::sync::DEFAULT_CHUNK,
            binary_control: true,
        }
    }

    pub fn object_size(&self) -> u64 {
        self.iprog.size
    }

    /// Bytes of PVRT the transfer plans to move.
    pub fn plan_bytes(&self) -> u64 {
        self.iprog.metrics.pvrt_total
    }

    pub fn preface(&self, channels: u16, channel_id: u16, negotiate: bool) -> Result<Preface> {
        Ok(Preface {
            transfer_id: self.transfer_id.clone(),
            channels,
            channel_id,
            blob_fingerprint: self.iprog.blob.fingerprint(),
            object_sha256: self.iprog.sha256_bytes()?,
            psk: self.psk.clone(),
            anchor: self.iprog.anchor,
            negotiate,
            binary_control: self.binary_control,
        })
    }

    pub fn sequencer(&self) -> FrameSequencer {
        FrameSequencer::with_chunk(self.binary_control, self.frame_payload)
    }

    /// Frames for `windows`.
    pub fn window_frames(&self, seq: &mut FrameSequencer, windows: &[u32]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        for &idx in windows {
            let w = self
                .iprog
                .window(idx)
                .ok_or_else(|| PvrtError::format(format!("receiver asked for unknown window {idx}")))?;
            frames.extend(seq.window(idx, &w.pvrt, w.hash16)?);
        }
        Ok(frames)
    }

    pub fn done_frame(&self, seq: &mut FrameSequencer) -> Result<Frame> {
        seq.done(&self.iprog.manifest(), self.iprog.sha256_bytes()?)
    }

    /// The complete single-channel stream without negotiation: preface,
    /// MFST, every window, DONE.
    pub fn whole_payload(&self) -> Result<Vec<u8>> {
        let mut seq = self.sequencer();
        let mut out = self.preface(1, 0, false)?.to_bytes()?;
        let all: Vec<u32> = (0..self.iprog.total_windows()).collect();

        let mut frames = vec![seq.manifest(&self.iprog.manifest())?];
        frames.extend(self.window_frames(&mut seq, &all)?);
        frames.push(self.done_frame(&mut seq)?);
        for f in frames {
            out.extend_from_slice(&f.to_bytes()?);
        }
        Ok(out)
    }
}

/// Result of a delivered transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub transport: TransportKind,
    pub bytes_sent: u64,
    pub windows_sent: u32,
}

/// Turn a receiver reply into the adapter result.
pub(crate) fn expect_ack(reply: &Control) -> Result<AckStatus> {
    match reply {
        Control::Ack { status: AckStatus::Failed } => {
            Err(PvrtError::Transport("receiver reported the transfer failed".into()))
        }
        Control::Ack { status } => Ok(*status),
        other => Err(PvrtError::format(format!("expected ACK, got {other}"))),
    }
}

// ── Transport ────────────────────────────────────────────────────

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send(&self, endpoint: &Endpoint, job: &SendJob) -> Result<SendReport>;
}

/// Resolve `endpoint` to a socket address.
pub(crate) async fn resolve(endpoint: &Endpoint) -> Result<std::net::SocketAddr> {
    tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await?
        .next()
        .ok_or_else(|| PvrtError::Transport(format!("{endpoint} did not resolve")))
}
