//! Network listeners feeding the reassembler.
//!
//! - [`quic`]: one negotiated channel per bidirectional stream
//! - [`tcp`]: one length-delimited whole-stream message per connection
//! - [`http`]: WebSocket channels, data-channel signalling, `/ingest`
//!   and transfer status

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use pvrt_core::{
    AckStatus, ChannelIngest, Control, FrameSequencer, Preface, PvrtError, Reassembler, Result,
};

pub mod http;
pub mod quic;
pub mod tcp;

// ── ChannelSession ───────────────────────────────────────────────

/// Receiving end of one streamed channel: waits for the preface, then
/// hands frames to the reassembler and encodes its replies.
pub struct ChannelSession {
    reassembler: Reassembler,
    ingest: Option<ChannelIngest>,
    pending: BytesMut,
    replies: FrameSequencer,
}

impl ChannelSession {
    pub fn new(reassembler: Reassembler) -> Self {
        Self {
            reassembler,
            ingest: None,
            pending: BytesMut::new(),
            replies: FrameSequencer::new(false),
        }
    }

    pub fn preface(&self) -> Option<&Preface> {
        self.ingest.as_ref().map(ChannelIngest::preface)
    }

    /// Feed stream bytes; returns encoded reply frames.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>> {
        let controls = match self.ingest.as_mut() {
            Some(ingest) => ingest.feed(bytes)?,
            None => {
                self.pending.extend_from_slice(bytes);
                let Some(preface) = Preface::decode(&mut self.pending)? else {
                    return Ok(Vec::new());
                };
                let rest = self.pending.split();
                let ingest = self.ingest.insert(self.reassembler.open(preface)?);
                ingest.feed(&rest)?
            }
        };
        controls.iter().map(|c| self.reply(c)).collect()
    }

    /// End of stream: the encoded ACK frame. Errors become a `failed` ACK.
    pub fn finish(mut self) -> Result<Bytes> {
        let status = match self.ingest.take() {
            Some(ingest) => ingest.finish().unwrap_or_else(|e| {
                warn!("channel failed at end of stream: {e}");
                AckStatus::Failed
            }),
            None => {
                debug!("stream ended before a preface");
                AckStatus::Failed
            }
        };
        self.reply(&Control::Ack { status })
    }

    /// The ACK frame for a channel that failed mid-stream.
    pub fn reject(mut self, err: &PvrtError) -> Result<Bytes> {
        warn!(
            transfer_id = self.preface().map(|p| p.transfer_id.as_str()).unwrap_or("-"),
            "channel rejected: {err}"
        );
        self.reply(&Control::Ack {
            status: AckStatus::Failed,
        })
    }

    fn reply(&mut self, msg: &Control) -> Result<Bytes> {
        self.replies.control(msg)?.to_bytes()
    }
}

/// Encoded ACK frame for a whole-stream transport.
pub fn ack_frame(status: AckStatus) -> Result<Bytes> {
    FrameSequencer::new(false)
        .control(&Control::Ack { status })?
        .to_bytes()
}

/// Resolves when `running` becomes false.
pub async fn wait_for_stop(running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use pvrt_core::{Registry, parse_frames};

    use super::*;

    #[test]
    fn stream_without_preface_fails() {
        let session = ChannelSession::new(Reassembler::new(Arc::new(Registry::in_memory()), None));
        let ack = session.finish().unwrap();
        let frames = parse_frames(&ack).unwrap();
        assert_eq!(
            frames[0].control_message().unwrap(),
            Control::Ack {
                status: AckStatus::Failed
            }
        );
    }

    #[test]
    fn preface_may_arrive_in_pieces() {
        let registry = Arc::new(Registry::in_memory());
        let spec = pvrt_core::BlobSpec::new("pieces", 1 << 16, 1);
        registry.create_or_attach(&spec, true).unwrap();
        let reassembler = Reassembler::new(registry, None);
        let mut session = ChannelSession::new(reassembler.clone());

        let preface = Preface {
            transfer_id: "p".into(),
            channels: 1,
            channel_id: 0,
            blob_fingerprint: spec.fingerprint(),
            object_sha256: [0; 32],
            psk: None,
            anchor: None,
            negotiate: true,
            binary_control: false,
        }
        .to_bytes()
        .unwrap();
        let (a, b) = preface.split_at(5);
        assert!(session.feed(a).unwrap().is_empty());
        assert!(session.preface().is_none());
        assert!(session.feed(b).unwrap().is_empty());
        assert_eq!(session.preface().unwrap().transfer_id, "p");

        // A connection lost mid-stream leaves nothing behind.
        assert_eq!(reassembler.live_sessions(), 1);
        drop(session);
        assert_eq!(reassembler.live_sessions(), 0);
    }

    #[tokio::test]
    async fn wait_for_stop_returns_once_cleared() {
        let running = Arc::new(AtomicBool::new(true));
        let waiter = tokio::spawn(wait_for_stop(running.clone()));
        running.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
