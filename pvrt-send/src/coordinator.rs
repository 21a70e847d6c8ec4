//! Transfer coordinator.
//!
//! Picks the transport for a [`SendJob`] and records a [`TransferStatus`]
//! per transfer id:
//!
//! - **Auto**: race QUIC against WebRTC under the race timeout; the first
//!   success wins and the loser is dropped. If both fail, cascade through
//!   WS-multi → WS → TCP → HTTPS, each attempt under its own timeout.
//! - **Explicit**: exactly one transport.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tracing::{info, warn};

use pvrt_core::{PvrtError, Result};

use crate::config::SenderConfig;
use crate::transport::{
    Endpoint, HttpsTransport, QuicTransport, SendJob, SendReport, TcpTransport, Transport,
    TransportKind, WebRtcTransport, WsTransport,
};

/// Raced first in auto mode.
const RACE: [TransportKind; 2] = [TransportKind::Quic, TransportKind::WebRtc];

/// Tried in order once the race is lost.
const CASCADE: [TransportKind; 4] = [
    TransportKind::WsMulti,
    TransportKind::Ws,
    TransportKind::Tcp,
    TransportKind::Https,
];

// ── Targets / Mode ───────────────────────────────────────────────

/// Receiver ports per transport family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    pub host: String,
    pub quic_port: u16,
    pub tcp_port: u16,
    /// WebSocket, WebRTC signalling and `/ingest`.
    pub http_port: u16,
    pub tls: bool,
}

impl Targets {
    pub fn endpoint(&self, kind: TransportKind) -> Endpoint {
        let port = match kind {
            TransportKind::Quic => self.quic_port,
            TransportKind::Tcp => self.tcp_port,
            TransportKind::WebRtc | TransportKind::WsMulti | TransportKind::Ws | TransportKind::Https => {
                self.http_port
            }
        };
        Endpoint {
            host: self.host.clone(),
            port,
            tls: self.tls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Auto,
    Explicit(TransportKind),
}

impl FromStr for Mode {
    type Err = PvrtError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Mode::Auto),
            other => other.parse().map(Mode::Explicit),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Auto => f.write_str("auto"),
            Mode::Explicit(kind) => kind.fmt(f),
        }
    }
}

// ── TransferStatus ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Running,
    Success,
    Failed,
}

/// One transport attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub transport: TransportKind,
    pub elapsed_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStatus {
    pub transfer_id: String,
    pub state: TransferState,
    pub object_size: u64,
    pub plan_bytes: u64,
    pub elapsed_s: f64,
    pub eff_bytes_per_s: f64,
    pub plan_bytes_per_s: f64,
    pub speedup_vs_raw: f64,
    /// Transport that delivered the object.
    pub path: Option<TransportKind>,
    pub bytes_sent: u64,
    pub attempts: Vec<Attempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferStatus {
    fn running(job: &SendJob) -> Self {
        Self {
            transfer_id: job.transfer_id.clone(),
            state: TransferState::Running,
            object_size: job.object_size(),
            plan_bytes: job.plan_bytes(),
            elapsed_s: 0.0,
            eff_bytes_per_s: 0.0,
            plan_bytes_per_s: 0.0,
            speedup_vs_raw: 0.0,
            path: None,
            bytes_sent: 0,
            attempts: Vec::new(),
            error: None,
        }
    }

    fn finish(&mut self, elapsed: Duration, attempts: Vec<Attempt>, result: Result<SendReport>) {
        let secs = elapsed.as_secs_f64().max(1e-9);
        self.elapsed_s = elapsed.as_secs_f64();
        self.attempts = attempts;
        match result {
            Ok(report) => {
                self.state = TransferState::Success;
                self.path = Some(report.transport);
                self.bytes_sent = report.bytes_sent;
                self.eff_bytes_per_s = self.object_size as f64 / secs;
                self.plan_bytes_per_s = self.plan_bytes as f64 / secs;
                if self.plan_bytes > 0 {
                    self.speedup_vs_raw = self.object_size as f64 / self.plan_bytes as f64;
                }
            }
            Err(e) => {
                self.state = TransferState::Failed;
                self.error = Some(e.to_string());
            }
        }
    }
}

// ── Coordinator ──────────────────────────────────────────────────

pub struct Coordinator {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    targets: Targets,
    attempt_timeout: Duration,
    race_timeout: Duration,
    statuses: Mutex<HashMap<String, TransferStatus>>,
}

impl Coordinator {
    /// A coordinator with no transports registered.
    pub fn new(targets: Targets, attempt_timeout: Duration, race_timeout: Duration) -> Self {
        Self {
            transports: HashMap::new(),
            targets,
            attempt_timeout,
            race_timeout,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// All six transports, configured from `config`.
    pub fn from_config(config: &SenderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PvrtError::Transport(format!("HTTP client: {e}")))?;
        Ok(Self::new(config.targets(), config.attempt_timeout(), config.race_timeout())
            .with_transport(Arc::new(QuicTransport::new(config.cert_pin()?)))
            .with_transport(Arc::new(WebRtcTransport::new(http.clone())))
            .with_transport(Arc::new(WsTransport::multi()))
            .with_transport(Arc::new(WsTransport::single()))
            .with_transport(Arc::new(TcpTransport))
            .with_transport(Arc::new(HttpsTransport::new(http))))
    }

    /// Register (or replace) the transport for its kind.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    pub fn status(&self, transfer_id: &str) -> Option<TransferStatus> {
        self.lock().get(transfer_id).cloned()
    }

    /// Deliver `job` and return its final status.
    pub async fn run(&self, job: SendJob, mode: Mode) -> TransferStatus {
        let mut status = TransferStatus::running(&job);
        self.lock().insert(job.transfer_id.clone(), status.clone());
        info!(transfer_id = %job.transfer_id, %mode, size = job.object_size(), plan = job.plan_bytes(), "transfer started");

        let start = Instant::now();
        let mut attempts = Vec::new();
        let result = match mode {
            Mode::Explicit(kind) => self.attempt(kind, &job, self.attempt_timeout, &mut attempts).await,
            Mode::Auto => self.auto(&job, &mut attempts).await,
        };
        status.finish(start.elapsed(), attempts, result);

        match status.state {
            TransferState::Success => info!(
                transfer_id = %status.transfer_id,
                path = ?status.path,
                elapsed_s = status.elapsed_s,
                speedup = status.speedup_vs_raw,
                "transfer delivered"
            ),
            _ => warn!(
                transfer_id = %status.transfer_id,
                error = status.error.as_deref().unwrap_or(""),
                "transfer failed"
            ),
        }
        self.lock().insert(status.transfer_id.clone(), status.clone());
        status
    }

    /// Run `job` in the background; poll it with [`status`](Self::status).
    pub fn spawn(self: &Arc<Self>, job: SendJob, mode: Mode) -> String {
        let transfer_id = job.transfer_id.clone();
        self.lock()
            .insert(transfer_id.clone(), TransferStatus::running(&job));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(job, mode).await;
        });
        transfer_id
    }

    async fn auto(&self, job: &SendJob, attempts: &mut Vec<Attempt>) -> Result<SendReport> {
        match self.race(job, attempts).await {
            Ok(report) => return Ok(report),
            Err(e) => info!(transfer_id = %job.transfer_id, "race lost ({e}); falling back"),
        }
        let mut last = None;
        for kind in CASCADE {
            match self.attempt(kind, job, self.attempt_timeout, attempts).await {
                Ok(report) => return Ok(report),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| PvrtError::Transport("no transports registered".into())))
    }

    /// QUIC and WebRTC concurrently; the first success wins.
    async fn race(&self, job: &SendJob, attempts: &mut Vec<Attempt>) -> Result<SendReport> {
        let mut racing: FuturesUnordered<_> = RACE
            .into_iter()
            .map(|kind| async move {
                let mut log = Vec::new();
                let result = self.attempt(kind, job, self.race_timeout, &mut log).await;
                (log, result)
            })
            .collect();

        let mut last = None;
        while let Some((log, result)) = racing.next().await {
            attempts.extend(log);
            match result {
                Ok(report) => return Ok(report),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| PvrtError::Transport("race had no entrants".into())))
    }

    async fn attempt(
        &self,
        kind: TransportKind,
        job: &SendJob,
        limit: Duration,
        attempts: &mut Vec<Attempt>,
    ) -> Result<SendReport> {
        let start = Instant::now();
        let result = match self.transports.get(&kind) {
            Some(transport) => {
                let endpoint = self.targets.endpoint(kind);
                tokio::time::timeout(limit, transport.send(&endpoint, job))
                    .await
                    .unwrap_or(Err(PvrtError::Timeout(limit)))
            }
            None => Err(PvrtError::Transport(format!("{kind} transport not available"))),
        };
        if let Err(e) = &result {
            warn!(transfer_id = %job.transfer_id, transport = %kind, "attempt failed: {e}");
        }
        attempts.push(Attempt {
            transport: kind,
            elapsed_s: start.elapsed().as_secs_f64(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TransferStatus>> {
        self.statuses.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── Tests ────────────────────────────────────────────────────────
