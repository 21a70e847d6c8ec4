//! WebRTC-style transport.
//!
//! Signalling is an HTTP offer/answer: `POST /rtc/offer` returns the path
//! of a one-shot data channel. The data channel is a WebSocket carrying
//! the single-stream handshake.

use async_trait::async_trait;
use tracing::debug;

use pvrt_core::{PvrtError, Result, RtcAnswer, RtcOffer};

use super::link::drive;
use super::ws::WsLink;
use super::{Endpoint, SendJob, SendReport, Transport, TransportKind};

pub struct WebRtcTransport {
    http: reqwest::Client,
}

impl WebRtcTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn negotiate(&self, endpoint: &Endpoint, job: &SendJob) -> Result<RtcAnswer> {
        let url = endpoint.http_url("/rtc/offer");
        let resp = self
            .http
            .post(&url)
            .json(&RtcOffer {
                transfer_id: job.transfer_id.clone(),
            })
            .send()
            .await
            .map_err(|e| PvrtError::Transport(format!("offer to {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(PvrtError::Transport(format!(
                "offer to {url} rejected: HTTP {}",
                resp.status()
            )));
        }
        resp.json::<RtcAnswer>()
            .await
            .map_err(|e| PvrtError::format(format!("bad answer from {url}: {e}")))
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }

    async fn send(&self, endpoint: &Endpoint, job: &SendJob) -> Result<SendReport> {
        let answer = self.negotiate(endpoint, job).await?;
        if !answer.channel.starts_with('/') {
            return Err(PvrtError::format(format!(
                "answer names channel {:?}, expected a path",
                answer.channel
            )));
        }
        debug!(channel = %answer.channel, "data channel offered");

        let mut link = WsLink::connect(&endpoint.ws_url(&answer.channel)).await?;
        let result = drive(TransportKind::WebRtc, std::slice::from_mut(&mut link), job).await;
        link.close().await;
        result
    }
}
