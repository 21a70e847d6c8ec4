//! Raw TCP transport.
//!
//! No negotiation: the whole single-channel stream (preface, MFST, every
//! window, DONE) goes out as one length-delimited message and the receiver
//! answers with one length-delimited ACK frame.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use pvrt_core::{Frame, PvrtError, Result, whole_message_codec};

use super::{Endpoint, SendJob, SendReport, Transport, TransportKind, expect_ack, resolve};

#[derive(Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn send(&self, endpoint: &Endpoint, job: &SendJob) -> Result<SendReport> {
        let payload = job.whole_payload()?;
        let bytes_sent = payload.len() as u64;

        let stream = TcpStream::connect(resolve(endpoint).await?).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, whole_message_codec());
        framed.send(Bytes::from(payload)).await?;
        debug!(%endpoint, bytes = bytes_sent, "TCP payload written");

        let mut reply = framed
            .next()
            .await
            .ok_or_else(|| PvrtError::Transport(format!("{endpoint} closed without a reply")))??;
        let frame = Frame::decode(&mut reply)?
            .ok_or_else(|| PvrtError::format("truncated reply frame"))?;
        let status = expect_ack(&frame.control_message()?)?;
        info!(transfer_id = %job.transfer_id, %status, "TCP transfer acknowledged");

        Ok(SendReport {
            transport: TransportKind::Tcp,
            bytes_sent,
            windows_sent: job.iprog.total_windows(),
        })
    }
}
