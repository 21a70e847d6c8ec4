//! Negotiated channel driver shared by the streaming transports.
//!
//! A [`FrameLink`] is one ordered, bidirectional channel to the receiver:
//! a QUIC stream or a WebSocket. [`drive`] runs the handshake across one
//! or more links:
//!
//! ```text
//! every channel  : PREFACE
//! channel 0      : MFST  ──►  ◄── NEED
//! every channel  : WIN / DATA… / END for its round-robin share
//! last channel   : DONE
//! every channel  : end-of-stream  ──►  ◄── ACK
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use tracing::{debug, info};

use pvrt_core::{AckStatus, Control, FrameSequencer, PvrtError, Result, assign_round_robin};

use super::{SendJob, SendReport, TransportKind, expect_ack};

#[async_trait]
pub trait FrameLink: Send {
    /// Write one encoded preface or frame.
    async fn send_bytes(&mut self, bytes: Bytes) -> Result<()>;

    /// Next control message from the receiver.
    async fn recv_control(&mut self) -> Result<Control>;

    /// Signal end of this channel's stream.
    async fn finish(&mut self) -> Result<()>;
}

/// Counts what one channel wrote.
struct Channel<'a, L> {
    link: &'a mut L,
    seq: FrameSequencer,
    bytes: u64,
}

impl<L: FrameLink> Channel<'_, L> {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.bytes += bytes.len() as u64;
        self.link.send_bytes(bytes).await
    }

    /// Wait for the ACK, skipping anything else the receiver says.
    async fn ack(&mut self) -> Result<AckStatus> {
        loop {
            let reply = self.link.recv_control().await?;
            if matches!(reply, Control::Ack { .. }) {
                return expect_ack(&reply);
            }
            debug!(%reply, "ignoring control while waiting for ACK");
        }
    }
}

/// Run the full handshake over `links` (channel `i` is `links[i]`).
pub async fn drive<L: FrameLink>(
    kind: TransportKind,
    links: &mut [L],
    job: &SendJob,
) -> Result<SendReport> {
    let channels = u16::try_from(links.len())
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| PvrtError::Other(format!("cannot drive {} channels", links.len())))?;
    let manifest = job.iprog.manifest();

    let mut chans: Vec<Channel<'_, L>> = links
        .iter_mut()
        .map(|link| Channel {
            link,
            seq: job.sequencer(),
            bytes: 0,
        })
        .collect();

    for (id, ch) in chans.iter_mut().enumerate() {
        let preface = job.preface(channels, id as u16, true)?;
        ch.write(Bytes::from(preface.to_bytes()?)).await?;
    }

    let lead = &mut chans[0];
    let mfst = lead.seq.manifest(&manifest)?;
    lead.write(mfst.to_bytes()?).await?;
    let needed = match lead.link.recv_control().await? {
        Control::Need { needed } => needed,
        Control::Ack { status } => {
            return Err(PvrtError::Transport(format!(
                "receiver answered MFST with ACK {status}"
            )));
        }
        other => return Err(PvrtError::format(format!("expected NEED, got {other}"))),
    };
    info!(
        %kind,
        transfer_id = %job.transfer_id,
        needed = needed.len(),
        total = manifest.total_windows,
        channels,
        "receiver negotiated"
    );

    let plan = assign_round_robin(&needed, channels);
    let last = chans.len() - 1;
    let statuses = try_join_all(chans.iter_mut().zip(plan).enumerate().map(
        |(id, (ch, windows))| async move {
            for frame in job.window_frames(&mut ch.seq, &windows)? {
                ch.write(frame.to_bytes()?).await?;
            }
            if id == last {
                let done = job.done_frame(&mut ch.seq)?;
                ch.write(done.to_bytes()?).await?;
            }
            ch.link.finish().await?;
            ch.ack().await
        },
    ))
    .await?;

    if !statuses.contains(&AckStatus::Done) {
        return Err(PvrtError::Transport(
            "no channel reported the transfer done".into(),
        ));
    }
    Ok(SendReport {
        transport: kind,
        bytes_sent: chans.iter().map(|c| c.bytes).sum(),
        windows_sent: needed.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pvrt_core::{
        Blob, BlobSpec, IprogOptions, Palette, PaletteConfig, Reassembler, Registry, build_iprog,
    };
    use tokio::sync::mpsc;

    use super::*;

    /// In-process link feeding a receiver-side task through channels.
    struct MemLink {
        tx: Option<mpsc::UnboundedSender<Bytes>>,
        rx: mpsc::UnboundedReceiver<Control>,
    }

    #[async_trait]
    impl FrameLink for MemLink {
        async fn send_bytes(&mut self, bytes: Bytes) -> Result<()> {
            self.tx
                .as_ref()
                .ok_or_else(|| PvrtError::Transport("finished".into()))?
                .send(bytes)
                .map_err(|_| PvrtError::Transport("receiver gone".into()))
        }

        async fn recv_control(&mut self) -> Result<Control> {
            self.rx
                .recv()
                .await
                .ok_or_else(|| PvrtError::Transport("closed".into()))
        }

        async fn finish(&mut self) -> Result<()> {
            self.tx.take();
            Ok(())
        }
    }

    fn mem_link(reassembler: Reassembler) -> MemLink {
        let (tx, mut inbound) = mpsc::unbounded_channel::<Bytes>();
        let (reply, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut ingest = None;
            while let Some(chunk) = inbound.recv().await {
                if ingest.is_none() {
                    let preface = pvrt_core::Preface::from_bytes(&chunk).unwrap();
                    ingest = Some(reassembler.open(preface).unwrap());
                    continue;
                }
                for c in ingest.as_mut().unwrap().feed(&chunk).unwrap() {
                    reply.send(c).unwrap();
                }
            }
            let status = ingest.unwrap().finish().unwrap();
            let _ = reply.send(Control::Ack { status });
        });
        MemLink { tx: Some(tx), rx }
    }

    fn job() -> (Vec<u8>, SendJob) {
        let spec = BlobSpec::new("link", 2 << 20, 9);
        let blob = Blob::new(spec).unwrap();
        let palette = Palette::from_blob(
            &blob,
            PaletteConfig {
                len: 512 * 1024,
                ..Default::default()
            },
        )
        .unwrap();
        let data = blob.read(4096, 100_000).unwrap();
        let options = IprogOptions {
            window_size: 16_384,
            ..Default::default()
        };
        let iprog = build_iprog("link.bin", &data, &blob, &palette, &options).unwrap();
        (data, SendJob::new("link-1", Arc::new(iprog)))
    }

    #[tokio::test]
    async fn drives_three_channels_to_done() {
        let registry = Arc::new(Registry::in_memory());
        registry
            .create_or_attach(&BlobSpec::new("link", 2 << 20, 9), true)
            .unwrap();
        let reassembler = Reassembler::new(registry.clone(), None);
        let (data, job) = job();

        let mut links: Vec<MemLink> = (0..3).map(|_| mem_link(reassembler.clone())).collect();
        let report = drive(TransportKind::WsMulti, &mut links, &job).await.unwrap();

        assert_eq!(report.windows_sent, job.iprog.total_windows());
        assert!(report.bytes_sent > job.plan_bytes());
        let outcome = registry.outcome("link-1").unwrap();
        let stored = registry.objects().get(&outcome.sha256.unwrap()).unwrap().unwrap();
        assert_eq!(stored.as_slice(), &data[..]);
    }

    #[tokio::test]
    async fn zero_links_is_an_error() {
        let (_, job) = job();
        let mut links: Vec<MemLink> = Vec::new();
        tokio_test::assert_err!(drive(TransportKind::Ws, &mut links, &job).await);
    }
}
