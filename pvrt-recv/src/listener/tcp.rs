//! Raw TCP listener.
//!
//! Each length-delimited message is a complete single-channel stream,
//! ingested whole and answered with one ACK frame.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use pvrt_core::{AckStatus, PvrtError, Reassembler, Result, whole_message_codec};

use super::{ack_frame, wait_for_stop};

/// Accept connections until `running` clears.
pub async fn serve(listener: TcpListener, reassembler: Reassembler, running: Arc<AtomicBool>) {
    info!(addr = ?listener.local_addr().ok(), "TCP listener ready");
    loop {
        let accept = tokio::select! {
            result = listener.accept() => result,
            _ = wait_for_stop(running.clone()) => break,
        };
        let (stream, peer) = match accept {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept error: {e}");
                continue;
            }
        };
        debug!(%peer, "TCP sender connected");
        let reassembler = reassembler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, reassembler).await {
                warn!(%peer, "TCP session error: {e}");
            }
        });
    }
    info!("TCP listener stopped");
}

async fn handle(stream: TcpStream, reassembler: Reassembler) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, whole_message_codec());
    while let Some(message) = framed.next().await {
        let payload = message?.freeze();
        let r = reassembler.clone();
        let status = tokio::task::spawn_blocking(move || r.ingest_whole(&payload))
            .await
            .map_err(|e| PvrtError::Other(format!("ingest task: {e}")))?
            .unwrap_or_else(|e| {
                warn!("whole-stream ingest failed: {e}");
                AckStatus::Failed
            });
        framed.send(ack_frame(status)?).await?;
    }
    Ok(())
}
