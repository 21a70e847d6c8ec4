//! Receiver service core logic.
//!
//! Binds the QUIC, TCP and HTTP listeners around one shared
//! [`Reassembler`], expires transfers whose channels never all arrive,
//! and shuts everything down when the stop handle clears.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pvrt_core::{Blob, Reassembler, Registry, Result};

use crate::config::ReceiverConfig;
use crate::listener::{http, quic::QuicListener, tcp, wait_for_stop};

// ── ReceiverService ──────────────────────────────────────────────

/// Addresses the listeners actually bound (port 0 resolves here).
#[derive(Debug, Clone, Default)]
pub struct Bound {
    pub quic: Option<SocketAddr>,
    pub quic_cert_sha256: Option<[u8; 32]>,
    pub tcp: Option<SocketAddr>,
    pub http: Option<SocketAddr>,
}

pub struct ReceiverService {
    config: ReceiverConfig,
    reassembler: Reassembler,
    running: Arc<AtomicBool>,
}

impl ReceiverService {
    /// Create the service: builds the registry and generates the blob.
    pub fn new(config: ReceiverConfig) -> Result<Self> {
        let registry = Arc::new(config.build_registry()?);
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: ReceiverConfig, registry: Arc<Registry>) -> Self {
        let reassembler = Reassembler::new(registry, config.psk());
        Self {
            config,
            reassembler,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run the service until stopped.
    pub async fn run(&self) -> Result<()> {
        self.start().await?.join().await;
        Ok(())
    }

    /// Bind every enabled listener and spawn it. The returned handle
    /// reports the bound addresses and waits for shutdown.
    pub async fn start(&self) -> Result<Running> {
        self.running.store(true, Ordering::SeqCst);
        let net = &self.config.network;
        let mut tasks = JoinSet::new();
        let mut bound = Bound::default();

        if let Some(blob) = self.reassembler.registry().blob(&self.config.blob.fingerprint()) {
            tasks.spawn(fill_blob(blob, self.stop_handle()));
        }
        if net.quic_port != 0 {
            let listener = QuicListener::bind(addr(&net.bind, net.quic_port)?)?;
            bound.quic = Some(listener.local_addr()?);
            bound.quic_cert_sha256 = Some(listener.cert_sha256());
            tasks.spawn(listener.serve(self.reassembler.clone(), self.stop_handle()));
        }
        if net.tcp_port != 0 {
            let listener = TcpListener::bind(addr(&net.bind, net.tcp_port)?).await?;
            bound.tcp = Some(listener.local_addr()?);
            tasks.spawn(tcp::serve(listener, self.reassembler.clone(), self.stop_handle()));
        }
        if net.http_port != 0 {
            let listener = TcpListener::bind(addr(&net.bind, net.http_port)?).await?;
            bound.http = Some(listener.local_addr()?);
            let (reassembler, max_body, running) =
                (self.reassembler.clone(), self.config.max_body(), self.stop_handle());
            tasks.spawn(async move {
                if let Err(e) = http::serve(listener, reassembler, max_body, running).await {
                    error!("HTTP listener error: {e}");
                }
            });
        }
        tasks.spawn(prune_loop(
            self.reassembler.clone(),
            self.config.session_timeout(),
            self.stop_handle(),
        ));

        info!(quic = ?bound.quic, tcp = ?bound.tcp, http = ?bound.http, "receiver started");
        Ok(Running { bound, tasks })
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// A started service.
pub struct Running {
    pub bound: Bound,
    tasks: JoinSet<()>,
}

impl Running {
    /// Wait for every listener to stop.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!("listener task ended abnormally: {e}");
            }
        }
        info!("receiver stopped");
    }
}

fn addr(bind: &str, port: u16) -> Result<SocketAddr> {
    format!("{bind}:{port}")
        .parse()
        .map_err(|e| pvrt_core::PvrtError::Other(format!("bad bind address {bind}:{port}: {e}")))
}

/// Materialise the startup blob, giving up if the service stops first.
async fn fill_blob(blob: Arc<Blob>, running: Arc<AtomicBool>) {
    let cancel = CancellationToken::new();
    let fill = blob.ensure_filled(&cancel);
    tokio::pin!(fill);
    let result = tokio::select! {
        result = &mut fill => result,
        _ = wait_for_stop(running) => {
            cancel.cancel();
            fill.await
        }
    };
    if let Err(e) = result {
        warn!(blob = %blob.fingerprint(), "blob fill stopped: {e}");
    }
}

/// Expire transfers stuck waiting for channels.
async fn prune_loop(reassembler: Reassembler, timeout: std::time::Duration, running: Arc<AtomicBool>) {
    let period = (timeout / 4).max(std::time::Duration::from_millis(50));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = reassembler.prune(timeout);
                if expired > 0 {
                    info!(expired, "stalled transfers expired");
                }
            }
            _ = wait_for_stop(running.clone()) => break,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
