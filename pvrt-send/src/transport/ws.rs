//! WebSocket transports, single- and multi-channel.
//!
//! Each channel is its own WebSocket to `GET /ws`. Every preface and frame
//! travels as one binary message; the receiver's replies come back the
//! same way. A text message `fin` ends the channel's stream.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use pvrt_core::{Control, Frame, PvrtError, Result};

use super::link::{FrameLink, drive};
use super::{Endpoint, SendJob, SendReport, Transport, TransportKind};

/// Text message closing a channel's stream.
pub const END_OF_STREAM: &str = "fin";

pub struct WsTransport {
    multi: bool,
}

impl WsTransport {
    /// One channel, windows in order.
    pub fn single() -> Self {
        Self { multi: false }
    }

    /// `job.channels` parallel channels.
    pub fn multi() -> Self {
        Self { multi: true }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        if self.multi {
            TransportKind::WsMulti
        } else {
            TransportKind::Ws
        }
    }

    async fn send(&self, endpoint: &Endpoint, job: &SendJob) -> Result<SendReport> {
        let channels = if self.multi { job.channels.max(1) } else { 1 };
        let url = endpoint.ws_url("/ws");
        let mut links = try_join_all((0..channels).map(|_| WsLink::connect(&url))).await?;
        debug!(%url, channels, "WebSocket channels open");

        let result = drive(self.kind(), &mut links, job).await;
        for link in &mut links {
            link.close().await;
        }
        if let Ok(report) = &result {
            info!(
                transport = %self.kind(),
                transfer_id = %job.transfer_id,
                bytes = report.bytes_sent,
                "WebSocket transfer acknowledged"
            );
        }
        result
    }
}

/// One WebSocket channel.
pub(crate) struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsLink {
    pub(crate) async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| PvrtError::Transport(format!("WebSocket connect {url}: {e}")))?;
        Ok(Self { ws })
    }

    pub(crate) async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("WebSocket close: {e}");
        }
    }
}

#[async_trait]
impl FrameLink for WsLink {
    async fn send_bytes(&mut self, bytes: Bytes) -> Result<()> {
        self.ws
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| PvrtError::Transport(format!("WebSocket send: {e}")))
    }

    async fn recv_control(&mut self) -> Result<Control> {
        while let Some(msg) = self.ws.next().await {
            match msg.map_err(|e| PvrtError::Transport(format!("WebSocket read: {e}")))? {
                Message::Binary(data) => {
                    let mut buf = BytesMut::from(&data[..]);
                    let frame = Frame::decode(&mut buf)?
                        .ok_or_else(|| PvrtError::format("WebSocket message holds a partial frame"))?;
                    return frame.control_message();
                }
                Message::Close(reason) => {
                    return Err(PvrtError::Transport(format!(
                        "receiver closed the WebSocket: {reason:?}"
                    )));
                }
                _ => {}
            }
        }
        Err(PvrtError::Transport("WebSocket ended before a reply".into()))
    }

    async fn finish(&mut self) -> Result<()> {
        self.ws
            .send(Message::Text(END_OF_STREAM.into()))
            .await
            .map_err(|e| PvrtError::Transport(format!("WebSocket send: {e}")))
    }
}
