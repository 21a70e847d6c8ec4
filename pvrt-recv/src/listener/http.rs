//! HTTP listener (axum).
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /ws` | one WebSocket channel per connection |
//! | `POST /rtc/offer` | data-channel signalling: returns a one-shot channel path |
//! | `GET /rtc/{token}` | the offered data channel (WebSocket) |
//! | `POST /ingest` | whole single-channel stream as the request body |
//! | `GET /transfers/{id}` | outcome, phase and window failures of a transfer |
//!
//! WebSocket channels carry one preface or frame per binary message; a
//! text message `fin` ends the sender's stream and is answered with the
//! ACK frame.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use pvrt_core::{
    AckStatus, Control, PvrtError, Reassembler, Result, RtcAnswer, RtcOffer, TransferOutcome,
    WindowFailure,
};

use super::{ChannelSession, wait_for_stop};

/// Text message ending a WebSocket channel.
pub const END_OF_STREAM: &str = "fin";

/// Offered data channels not opened within this time are discarded.
const OFFER_TTL: Duration = Duration::from_secs(30);

// ── State ────────────────────────────────────────────────────────

struct Offer {
    transfer_id: String,
    issued: Instant,
}

#[derive(Clone)]
pub struct AppState {
    reassembler: Reassembler,
    offers: Arc<Mutex<HashMap<String, Offer>>>,
}

impl AppState {
    pub fn new(reassembler: Reassembler) -> Self {
        Self {
            reassembler,
            offers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn offers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Offer>> {
        self.offers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub fn router(state: AppState, max_body: usize) -> Router {
    Router::new()
        .route("/ws", get(ws_channel))
        .route("/rtc/offer", post(rtc_offer))
        .route("/rtc/{token}", get(rtc_channel))
        .route("/ingest", post(ingest).layer(DefaultBodyLimit::max(max_body)))
        .route("/transfers/{id}", get(transfer))
        .with_state(state)
}

/// Serve until `running` clears.
pub async fn serve(
    listener: TcpListener,
    reassembler: Reassembler,
    max_body: usize,
    running: Arc<AtomicBool>,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "HTTP listener ready");
    axum::serve(listener, router(AppState::new(reassembler), max_body))
        .with_graceful_shutdown(wait_for_stop(running))
        .await?;
    info!("HTTP listener stopped");
    Ok(())
}

// ── WebSocket channels ───────────────────────────────────────────

async fn ws_channel(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_channel(socket, state.reassembler))
}

async fn rtc_offer(State(state): State<AppState>, Json(offer): Json<RtcOffer>) -> Json<RtcAnswer> {
    let token = uuid::Uuid::new_v4().simple().to_string();
    let mut offers = state.offers();
    offers.retain(|_, o| o.issued.elapsed() < OFFER_TTL);
    debug!(transfer_id = %offer.transfer_id, %token, "data channel offered");
    offers.insert(
        token.clone(),
        Offer {
            transfer_id: offer.transfer_id,
            issued: Instant::now(),
        },
    );
    Json(RtcAnswer {
        channel: format!("/rtc/{token}"),
    })
}

async fn rtc_channel(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let offer = state.offers().remove(&token);
    match offer {
        Some(offer) if offer.issued.elapsed() < OFFER_TTL => {
            debug!(transfer_id = %offer.transfer_id, "data channel opened");
            ws.on_upgrade(move |socket| run_channel(socket, state.reassembler))
        }
        _ => (StatusCode::NOT_FOUND, "unknown or expired data channel").into_response(),
    }
}

async fn run_channel(mut socket: WebSocket, reassembler: Reassembler) {
    if let Err(e) = channel_loop(&mut socket, reassembler).await {
        debug!("WebSocket channel ended: {e}");
    }
    // Let the sender close once it has the ACK.
    while let Some(Ok(msg)) = socket.recv().await {
        if let Message::Close(_) = msg {
            break;
        }
    }
}

async fn channel_loop(socket: &mut WebSocket, reassembler: Reassembler) -> Result<()> {
    let mut session = ChannelSession::new(reassembler);
    while let Some(msg) = socket.recv().await {
        match msg.map_err(|e| PvrtError::Transport(format!("WebSocket read: {e}")))? {
            Message::Binary(data) => match session.feed(&data) {
                Ok(replies) => {
                    for reply in replies {
                        send(socket, reply).await?;
                    }
                }
                Err(e) => {
                    let ack = session.reject(&e)?;
                    return send(socket, ack).await;
                }
            },
            Message::Text(text) if text.as_str() == END_OF_STREAM => {
                let ack = tokio::task::spawn_blocking(move || session.finish())
                    .await
                    .map_err(|e| PvrtError::Other(format!("assembly task: {e}")))??;
                return send(socket, ack).await;
            }
            Message::Close(_) => {
                if let Some(p) = session.preface() {
                    warn!(transfer_id = %p.transfer_id, channel = p.channel_id, "channel closed without end of stream");
                }
                return Ok(());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn send(socket: &mut WebSocket, bytes: Bytes) -> Result<()> {
    socket
        .send(Message::Binary(bytes))
        .await
        .map_err(|e| PvrtError::Transport(format!("WebSocket send: {e}")))
}

// ── Whole-stream ingest ──────────────────────────────────────────

async fn ingest(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<Control>) {
    let reassembler = state.reassembler.clone();
    let result = tokio::task::spawn_blocking(move || reassembler.ingest_whole(&body))
        .await
        .map_err(|e| PvrtError::Other(format!("ingest task: {e}")))
        .and_then(|r| r);
    let status = match result {
        Ok(status) => status,
        Err(e) => {
            warn!("HTTP ingest failed: {e}");
            AckStatus::Failed
        }
    };
    let code = if status == AckStatus::Failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (code, Json(Control::Ack { status }))
}

// ── Transfer status ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct TransferReport {
    pub transfer_id: String,
    /// Live session phase, or the recorded outcome state.
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TransferOutcome>,
    pub window_failures: Vec<WindowFailure>,
}

async fn transfer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let registry = state.reassembler.registry();
    let outcome = registry.outcome(&id);
    let phase = match (&outcome, state.reassembler.phase(&id)) {
        (_, Ok(phase)) => phase.to_string(),
        (Some(o), Err(_)) => o.state.to_string(),
        (None, Err(_)) => return (StatusCode::NOT_FOUND, "unknown transfer").into_response(),
    };
    Json(TransferReport {
        window_failures: registry.window_failures(&id),
        transfer_id: id,
        phase,
        outcome,
    })
    .into_response()
}
