//! HTTP(S) transport, the last resort.
//!
//! The whole single-channel stream is streamed as the body of
//! `POST /ingest`. The receiver answers with the JSON ACK: `200` when the
//! object verified, `500` otherwise.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use tracing::info;

use pvrt_core::{Control, PvrtError, Result};

use super::{Endpoint, SendJob, SendReport, Transport, TransportKind, expect_ack};

/// Body chunk size.
const CHUNK: usize = 256 * 1024;

pub struct HttpsTransport {
    http: reqwest::Client,
}

impl HttpsTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for HttpsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Https
    }

    async fn send(&self, endpoint: &Endpoint, job: &SendJob) -> Result<SendReport> {
        let payload = Bytes::from(job.whole_payload()?);
        let bytes_sent = payload.len() as u64;
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = (0..payload.len())
            .step_by(CHUNK)
            .map(|at| Ok(payload.slice(at..(at + CHUNK).min(payload.len()))))
            .collect();

        let url = endpoint.http_url("/ingest");
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream::iter(chunks)))
            .send()
            .await
            .map_err(|e| PvrtError::Transport(format!("POST {url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PvrtError::Transport(format!("POST {url}: HTTP {status}")));
        }
        let reply: Control = resp
            .json()
            .await
            .map_err(|e| PvrtError::format(format!("bad reply from {url}: {e}")))?;
        let ack = expect_ack(&reply)?;
        info!(transfer_id = %job.transfer_id, status = %ack, "HTTP transfer acknowledged");

        Ok(SendReport {
            transport: TransportKind::Https,
            bytes_sent,
            windows_sent: job.iprog.total_windows(),
        })
    }
}
