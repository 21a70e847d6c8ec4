//! Receiver reassembler.
//!
//! Each incoming channel is driven through a [`ChannelIngest`]: the
//! preface is validated on [`Reassembler::open`], frames are checked as
//! they arrive (channel 0 answers the manifest with NEED), and the raw
//! frame bytes are buffered. When the channel's byte stream ends,
//! [`ChannelIngest::finish`] deposits the buffer with its transfer
//! session. The session assembles exactly once, inside its lock, when the
//! last of its channels has been deposited.
//!
//! A channel dropped before `finish` gives its session up if no other
//! channel holds or has deposited anything, and a preface whose parameters
//! differ from the live session for its transfer id replaces that session.
//! Either way a later attempt with the same transfer id starts clean.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::blob::{Blob, BlobSpec};
use crate::control::{AckStatus, Control, Manifest};
use crate::error::{PvrtError, Result};
use crate::frame::{Frame, Preface, parse_frames};
use crate::hash::{Hash16, sha256};
use crate::iprog::decode_window;
use crate::registry::{OutcomeState, Registry, TransferOutcome};
use crate::session::SessionPhase;
use crate::sync::needed;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── TransferSession ──────────────────────────────────────────────

#[derive(Debug)]
struct TransferSession {
    transfer_id: String,
    channels: u16,
    object_sha256: [u8; 32],
    anchor: Option<u64>,
    blob: Arc<Blob>,
    phase: SessionPhase,
    /// Raw frame bytes per channel id.
    received: BTreeMap<u16, Vec<u8>>,
    /// Channels opened and not yet finished or dropped.
    open_channels: usize,
}

impl TransferSession {
    fn matches(&self, preface: &Preface) -> bool {
        self.channels == preface.channels
            && self.object_sha256 == preface.object_sha256
            && self.anchor == preface.anchor
            && self.blob.fingerprint() == preface.blob_fingerprint
    }
}

// ── Reassembler ──────────────────────────────────────────────────

/// Entry point for every receiver listener. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Reassembler {
    registry: Arc<Registry>,
    psk: Option<Arc<str>>,
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<TransferSession>>>>>,
}

impl Reassembler {
    pub fn new(registry: Arc<Registry>, psk: Option<String>) -> Self {
        Self {
            registry,
            psk: psk.filter(|p| !p.is_empty()).map(Arc::from),
            sessions: Arc::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Validate `preface` and attach a new channel to its session.
    pub fn open(&self, preface: Preface) -> Result<ChannelIngest> {
        if preface.channel_id >= preface.channels {
            return Err(PvrtError::format(format!(
                "channel {} outside 0..{}",
                preface.channel_id, preface.channels
            )));
        }
        if let Some(expected) = &self.psk {
            if preface.psk.as_deref() != Some(&**expected) {
                warn!(transfer_id = %preface.transfer_id, "channel rejected: pre-shared key mismatch");
                return Err(PvrtError::Transport("pre-shared key rejected".into()));
            }
        }
        let spec = BlobSpec::parse_fingerprint(&preface.blob_fingerprint)?;
        let blob = self.registry.attach(&spec)?;

        let session = {
            let mut sessions = lock(&self.sessions);
            let superseded = sessions
                .get(&preface.transfer_id)
                .is_some_and(|existing| !lock(existing).matches(&preface));
            if superseded {
                info!(
                    transfer_id = %preface.transfer_id,
                    channels = preface.channels,
                    "new attempt replaces unfinished session"
                );
                sessions.remove(&preface.transfer_id);
            }
            sessions
                .entry(preface.transfer_id.clone())
                .or_insert_with(|| {
                    debug!(transfer_id = %preface.transfer_id, channels = preface.channels, "session created");
                    Arc::new(Mutex::new(TransferSession {
                        transfer_id: preface.transfer_id.clone(),
                        channels: preface.channels,
                        object_sha256: preface.object_sha256,
                        anchor: preface.anchor,
                        blob,
                        phase: SessionPhase::Init,
                        received: BTreeMap::new(),
                        open_channels: 0,
                    }))
                })
                .clone()
        };

        {
            let mut s = lock(&session);
            if !s.matches(&preface) {
                return Err(PvrtError::format(format!(
                    "channel {} disagrees with transfer {} on its parameters",
                    preface.channel_id, preface.transfer_id
                )));
            }
            if !s.phase.is_terminal() {
                s.phase.accept_channel()?;
            }
            s.open_channels += 1;
        }

        debug!(
            transfer_id = %preface.transfer_id,
            channel = preface.channel_id,
            of = preface.channels,
            "channel opened"
        );
        Ok(ChannelIngest {
            reassembler: self.clone(),
            session,
            preface,
            pending: BytesMut::new(),
            buffer: Vec::new(),
            need_sent: false,
            finished: false,
        })
    }

    /// Ingest a whole channel stream (preface + frames) in one call.
    pub fn ingest_whole(&self, bytes: &[u8]) -> Result<AckStatus> {
        let mut buf = BytesMut::from(bytes);
        let preface = Preface::decode(&mut buf)?
            .ok_or_else(|| PvrtError::format("payload ends inside the preface"))?;
        let mut ingest = self.open(preface)?;
        ingest.feed(&buf)?;
        ingest.finish()
    }

    /// Phase of a live session.
    pub fn phase(&self, transfer_id: &str) -> Result<SessionPhase> {
        let sessions = lock(&self.sessions);
        let session = sessions
            .get(transfer_id)
            .ok_or_else(|| PvrtError::SessionNotFound(transfer_id.to_string()))?;
        Ok(lock(session).phase.clone())
    }

    pub fn live_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Fail and drop sessions that have waited for channels longer than
    /// `max_wait`. Returns how many were dropped.
    pub fn prune(&self, max_wait: Duration) -> usize {
        let mut sessions = lock(&self.sessions);
        let mut expired = Vec::new();
        for (tid, session) in sessions.iter() {
            let mut s = lock(session);
            if s.phase.waiting_for().is_some_and(|w| w >= max_wait) {
                let reason = format!(
                    "only {} of {} channels arrived within {max_wait:?}",
                    s.received.len(),
                    s.channels
                );
                let _ = s.phase.fail(reason.clone());
                warn!(transfer_id = %tid, %reason, "session expired");
                self.registry.record_outcome(TransferOutcome {
                    transfer_id: tid.clone(),
                    state: OutcomeState::Failed,
                    size: 0,
                    sha256: None,
                    reason: Some(reason),
                    windows_sent: 0,
                    windows_cached: 0,
                });
                expired.push(tid.clone());
            }
        }
        for tid in &expired {
            sessions.remove(tid);
        }
        expired.len()
    }

    /// Drop `session` from the map unless a newer attempt already
    /// replaced it.
    fn remove(&self, transfer_id: &str, session: &Arc<Mutex<TransferSession>>) {
        let mut sessions = lock(&self.sessions);
        if sessions.get(transfer_id).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(transfer_id);
        }
    }
}

// ── ChannelIngest ────────────────────────────────────────────────

/// One channel of a transfer, from preface to end of stream.
#[derive(Debug)]
pub struct ChannelIngest {
    reassembler: Reassembler,
    session: Arc<Mutex<TransferSession>>,
    preface: Preface,
    /// Bytes of a frame not yet complete.
    pending: BytesMut,
    /// Complete frames, as received.
    buffer: Vec<u8>,
    need_sent: bool,
    /// Set once `finish` got past the framing check.
    finished: bool,
}

impl ChannelIngest {
    pub fn preface(&self) -> &Preface {
        &self.preface
    }

    /// Feed raw stream bytes; returns replies to send back on this channel.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Control>> {
        self.pending.extend_from_slice(bytes);
        let mut replies = Vec::new();
        while let Some(frame) = Frame::decode(&mut self.pending)? {
            if let Some(reply) = self.on_frame(&frame)? {
                replies.push(reply);
            }
        }
        Ok(replies)
    }

    /// Handle one decoded frame.
    ///
    /// Control frames are decoded here so a malformed message fails the
    /// channel early. On channel 0 of a negotiating transfer the first
    /// MFST is answered with NEED.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<Option<Control>> {
        let mut raw = BytesMut::with_capacity(frame.encoded_len());
        frame.encode_into(&mut raw)?;
        self.buffer.extend_from_slice(&raw);

        if !frame.is_control() {
            return Ok(None);
        }
        let msg = frame.control_message()?;
        debug!(
            transfer_id = %self.preface.transfer_id,
            channel = self.preface.channel_id,
            seq = frame.seq,
            %msg,
            "control frame"
        );
        match msg {
            Control::Manifest(manifest)
                if self.preface.channel_id == 0 && self.preface.negotiate && !self.need_sent =>
            {
                manifest.validate()?;
                let local = self.reassembler.registry.windows().local_view(&manifest.hashes);
                let needed = needed(&local, &manifest.hashes);
                info!(
                    transfer_id = %self.preface.transfer_id,
                    total = manifest.total_windows,
                    needed = needed.len(),
                    "manifest received"
                );
                self.need_sent = true;
                Ok(Some(Control::Need { needed }))
            }
            _ => Ok(None),
        }
    }

    /// End of this channel's stream: deposit and, if this was the last
    /// channel, assemble.
    pub fn finish(mut self) -> Result<AckStatus> {
        if !self.pending.is_empty() {
            return Err(PvrtError::format(format!(
                "channel {} ended inside a frame ({} bytes pending)",
                self.preface.channel_id,
                self.pending.len()
            )));
        }
        self.finished = true;
        let tid = self.preface.transfer_id.clone();
        let channel_id = self.preface.channel_id;
        let registry = self.reassembler.registry.clone();

        let mut session = lock(&self.session);
        session.open_channels = session.open_channels.saturating_sub(1);
        match &session.phase {
            SessionPhase::Done => {
                debug!(transfer_id = %tid, channel = channel_id, "late channel for finished transfer dropped");
                return Ok(AckStatus::Done);
            }
            SessionPhase::Failed { .. } => {
                debug!(transfer_id = %tid, channel = channel_id, "late channel for failed transfer dropped");
                return Ok(AckStatus::Failed);
            }
            _ => {}
        }
        if session.received.contains_key(&channel_id) {
            debug!(transfer_id = %tid, channel = channel_id, "duplicate channel ignored");
            return Ok(AckStatus::Ok);
        }
        session.received.insert(channel_id, std::mem::take(&mut self.buffer));
        if session.received.len() < session.channels as usize {
            debug!(
                transfer_id = %tid,
                received = session.received.len(),
                of = session.channels,
                "channel deposited"
            );
            return Ok(AckStatus::Ok);
        }

        let outcome = assemble(&mut session, &registry);
        drop(session);
        self.reassembler.remove(&tid, &self.session);

        let status = match outcome.state {
            OutcomeState::Done => AckStatus::Done,
            OutcomeState::Failed => AckStatus::Failed,
        };
        registry.record_outcome(outcome);
        Ok(status)
    }
}

impl Drop for ChannelIngest {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let tid = &self.preface.transfer_id;
        let mut sessions = lock(&self.reassembler.sessions);
        let mut session = lock(&self.session);
        session.open_channels = session.open_channels.saturating_sub(1);
        let abandoned =
            session.open_channels == 0 && session.received.is_empty() && !session.phase.is_terminal();
        if abandoned && sessions.get(tid).is_some_and(|s| Arc::ptr_eq(s, &self.session)) {
            debug!(transfer_id = %tid, channel = self.preface.channel_id, "channel aborted, session released");
            sessions.remove(tid);
        }
    }
}

// ── Assembly ─────────────────────────────────────────────────────

#[derive(Default)]
struct Replay {
    manifest: Option<Manifest>,
    open: Option<(u32, Vec<u8>)>,
    decoded: BTreeMap<u32, Vec<u8>>,
    done: Option<[u8; 32]>,
}

/// Replay every channel's frames and verify the object. Always leaves the
/// session in a terminal phase.
fn assemble(session: &mut TransferSession, registry: &Registry) -> TransferOutcome {
    let mut outcome = TransferOutcome {
        transfer_id: session.transfer_id.clone(),
        state: OutcomeState::Failed,
        size: 0,
        sha256: None,
        reason: None,
        windows_sent: 0,
        windows_cached: 0,
    };

    match try_assemble(session, registry, &mut outcome) {
        Ok(()) => {
            outcome.state = OutcomeState::Done;
            info!(
                transfer_id = %outcome.transfer_id,
                size = outcome.size,
                sent = outcome.windows_sent,
                cached = outcome.windows_cached,
                "transfer verified"
            );
        }
        Err(e) => {
            warn!(transfer_id = %outcome.transfer_id, error = %e, "transfer failed");
            let _ = session.phase.fail(e.to_string());
            outcome.reason = Some(e.to_string());
        }
    }
    outcome
}

fn try_assemble(
    session: &mut TransferSession,
    registry: &Registry,
    outcome: &mut TransferOutcome,
) -> Result<()> {
    session.phase.begin_assembly()?;

    let mut stream = Vec::with_capacity(session.received.values().map(Vec::len).sum());
    for bytes in session.received.values() {
        stream.extend_from_slice(bytes);
    }
    let frames = parse_frames(&stream)?;

    let mut replay = Replay::default();
    for frame in &frames {
        replay_frame(session, registry, &mut replay, frame)?;
    }
    if let Some((idx, _)) = replay.open {
        return Err(PvrtError::format(format!("window {idx} never closed")));
    }
    let manifest = replay
        .manifest
        .ok_or_else(|| PvrtError::format("stream carried no MFST"))?;
    let done_sha = replay
        .done
        .ok_or_else(|| PvrtError::format("stream ended without DONE"))?;

    session.phase.begin_verify()?;

    let mut object = Vec::new();
    for (idx, hash) in manifest.hashes.iter().enumerate() {
        let idx = idx as u32;
        if let Some(bytes) = replay.decoded.get(&idx) {
            object.extend_from_slice(bytes);
            outcome.windows_sent += 1;
        } else if let Some(bytes) = registry.windows().get(hash) {
            object.extend_from_slice(&bytes);
            outcome.windows_cached += 1;
        } else {
            return Err(PvrtError::VerificationMismatch {
                what: format!("window {idx}"),
                expected: hash.to_hex(),
                actual: "missing".into(),
            });
        }
    }
    let short = manifest.size.saturating_sub(object.len() as u64);
    if short >= manifest.window_size.max(1) as u64 {
        return Err(PvrtError::format(format!(
            "windows carry {} bytes, manifest declares {}",
            object.len(),
            manifest.size
        )));
    }
    object.resize(manifest.size as usize, 0);

    let actual = sha256(&object);
    for (what, expected) in [("object (DONE)", done_sha), ("object (preface)", session.object_sha256)] {
        if actual != expected {
            return Err(PvrtError::VerificationMismatch {
                what: what.into(),
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
    }

    outcome.size = object.len() as u64;
    outcome.sha256 = Some(registry.objects().put(object)?);
    session.phase.complete()?;
    Ok(())
}

fn replay_frame(
    session: &TransferSession,
    registry: &Registry,
    replay: &mut Replay,
    frame: &Frame,
) -> Result<()> {
    if !frame.is_control() {
        let Some((_, window)) = replay.open.as_mut() else {
            return Err(PvrtError::format(format!("DATA frame {} outside a window", frame.seq)));
        };
        window.extend_from_slice(&frame.payload);
        return Ok(());
    }

    match frame.control_message()? {
        Control::Manifest(m) => {
            m.validate()?;
            match &replay.manifest {
                Some(existing) if *existing != m => {
                    return Err(PvrtError::format("conflicting manifests"));
                }
                _ => replay.manifest = Some(m),
            }
        }
        Control::Win { idx } => {
            if let Some((open, _)) = &replay.open {
                return Err(PvrtError::format(format!("WIN {idx} while window {open} is open")));
            }
            replay.open = Some((idx, Vec::new()));
        }
        Control::End { idx, hash16 } => {
            let Some((open, pvrt)) = replay.open.take() else {
                return Err(PvrtError::format(format!("END {idx} without WIN")));
            };
            if open != idx {
                return Err(PvrtError::format(format!("END {idx} closes window {open}")));
            }
            complete_window(session, registry, replay, idx, &hash16, &pvrt);
        }
        Control::Done { sha256, .. } => replay.done = Some(sha256),
        other => debug!(transfer_id = %session.transfer_id, %other, "control frame ignored in replay"),
    }
    Ok(())
}

/// Decode one window. A bad window is a soft failure: it is recorded and
/// left out, and the final digest check decides the transfer.
fn complete_window(
    session: &TransferSession,
    registry: &Registry,
    replay: &mut Replay,
    idx: u32,
    hash16: &Hash16,
    pvrt: &[u8],
) {
    let listed = replay
        .manifest
        .as_ref()
        .and_then(|m| m.hashes.get(idx as usize));
    if listed.is_some_and(|h| h != hash16) {
        registry.record_window_failure(&session.transfer_id, idx, "END hash differs from manifest");
        return;
    }
    match decode_window(pvrt, &session.blob, session.anchor, idx, hash16) {
        Ok(bytes) => {
            registry.windows().insert(*hash16, bytes.clone());
            replay.decoded.insert(idx, bytes);
        }
        Err(e) => {
            warn!(transfer_id = %session.transfer_id, idx, error = %e, "window rejected");
            registry.record_window_failure(&session.transfer_id, idx, e.to_string());
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iprog::{IprogOptions, build_iprog, compile_window};
    use crate::palette::{Palette, PaletteConfig};
    use crate::sync::{FrameSequencer, assign_round_robin};

    struct Fixture {
        registry: Arc<Registry>,
        blob: Arc<Blob>,
        palette: Palette,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::in_memory());
        let blob = registry
            .create_or_attach(&BlobSpec::new("reasm", 2 << 20, 9), true)
            .unwrap();
        let palette = Palette::from_blob(
            &blob,
            PaletteConfig {
                len: 512 * 1024,
                ..Default::default()
            },
        )
        .unwrap();
        Fixture { registry, blob, palette }
    }

    fn data(blob: &Blob, len: usize) -> Vec<u8> {
        let mut d = blob.read(4096, len).unwrap();
        d[10] ^= 0x55;
        d
    }

    fn preface(fx: &Fixture, tid: &str, channels: u16, object: &[u8]) -> Preface {
        Preface {
            transfer_id: tid.into(),
            channels,
            channel_id: 0,
            blob_fingerprint: fx.blob.fingerprint(),
            object_sha256: sha256(object),
            psk: None,
            anchor: None,
            negotiate: false,
            binary_control: true,
        }
    }

    /// Frames for each channel: MFST on channel 0, windows round-robin,
    /// DONE on the last channel.
    fn channel_frames(fx: &Fixture, object: &[u8], channels: u16) -> Vec<Vec<u8>> {
        let options = IprogOptions {
            window_size: 4096,
            ..Default::default()
        };
        let iprog = build_iprog("obj", object, &fx.blob, &fx.palette, &options).unwrap();
        let manifest = iprog.manifest();
        let all: Vec<u32> = (0..iprog.total_windows()).collect();
        let plan = assign_round_robin(&all, channels);

        plan.iter()
            .enumerate()
            .map(|(ch, windows)| {
                let mut seq = FrameSequencer::new(true);
                let mut frames = Vec::new();
                if ch == 0 {
                    frames.push(seq.manifest(&manifest).unwrap());
                }
                for &idx in windows {
                    let w = iprog.window(idx).unwrap();
                    frames.extend(seq.window(idx, &w.pvrt, w.hash16).unwrap());
                }
                if ch == channels as usize - 1 {
                    frames.push(seq.done(&manifest, iprog.sha256_bytes().unwrap()).unwrap());
                }
                let mut buf = BytesMut::new();
                for f in frames {
                    f.encode_into(&mut buf).unwrap();
                }
                buf.to_vec()
            })
            .collect()
    }

    #[test]
    fn single_channel_round_trip() {
        let fx = fixture();
        let object = data(&fx.blob, 10_000);
        let streams = channel_frames(&fx, &object, 1);
        let r = Reassembler::new(fx.registry.clone(), None);

        let mut ingest = r.open(preface(&fx, "t1", 1, &object)).unwrap();
        assert!(ingest.feed(&streams[0]).unwrap().is_empty());
        assert_eq!(ingest.finish().unwrap(), AckStatus::Done);

        let outcome = fx.registry.outcome("t1").unwrap();
        assert_eq!(outcome.state, OutcomeState::Done);
        assert_eq!(outcome.windows_sent, 3);
        let key = outcome.sha256.unwrap();
        assert_eq!(fx.registry.objects().get(&key).unwrap().unwrap().as_slice(), &object[..]);
        assert_eq!(r.live_sessions(), 0);
    }

    #[test]
    fn assembles_once_when_all_channels_arrive() {
        let fx = fixture();
        let object = data(&fx.blob, 20_000);
        let streams = channel_frames(&fx, &object, 3);
        let r = Reassembler::new(fx.registry.clone(), None);
        let base = preface(&fx, "t3", 3, &object);

        // Channels finish out of order; only the last completes the transfer.
        let mut statuses = Vec::new();
        for ch in [2u16, 0, 1] {
            let mut ingest = r.open(base.for_channel(ch)).unwrap();
            ingest.feed(&streams[ch as usize]).unwrap();
            statuses.push(ingest.finish().unwrap());
        }
        assert_eq!(statuses, vec![AckStatus::Ok, AckStatus::Ok, AckStatus::Done]);
        assert_eq!(fx.registry.outcome("t3").unwrap().state, OutcomeState::Done);
    }

    #[test]
    fn duplicate_channel_is_ignored() {
        let fx = fixture();
        let object = data(&fx.blob, 9000);
        let streams = channel_frames(&fx, &object, 2);
        let r = Reassembler::new(fx.registry.clone(), None);
        let base = preface(&fx, "dup", 2, &object);

        for _ in 0..2 {
            let mut ingest = r.open(base.for_channel(0)).unwrap();
            ingest.feed(&streams[0]).unwrap();
            assert_eq!(ingest.finish().unwrap(), AckStatus::Ok);
        }
        assert!(matches!(r.phase("dup").unwrap(), SessionPhase::AwaitChannels { .. }));

        let mut last = r.open(base.for_channel(1)).unwrap();
        last.feed(&streams[1]).unwrap();
        assert_eq!(last.finish().unwrap(), AckStatus::Done);
        assert!(matches!(r.phase("dup"), Err(PvrtError::SessionNotFound(_))));
    }

    #[test]
    fn negotiation_skips_cached_windows() {
        let fx = fixture();
        let object = data(&fx.blob, 12_288);
        let r = Reassembler::new(fx.registry.clone(), None);

        // First transfer warms the window cache.
        let streams = channel_frames(&fx, &object, 1);
        assert_eq!(
            r.ingest_whole(&[preface(&fx, "warm", 1, &object).to_bytes().unwrap(), streams[0].clone()].concat())
                .unwrap(),
            AckStatus::Done
        );

        // Second transfer of a changed object only needs the changed window.
        let mut changed = object.clone();
        changed[5000] ^= 0xFF;
        let options = IprogOptions {
            window_size: 4096,
            ..Default::default()
        };
        let iprog = build_iprog("obj", &changed, &fx.blob, &fx.palette, &options).unwrap();
        let manifest = iprog.manifest();

        let mut p = preface(&fx, "delta", 1, &changed);
        p.negotiate = true;
        let mut ingest = r.open(p).unwrap();
        let mut seq = FrameSequencer::new(true);
        let reply = ingest.on_frame(&seq.manifest(&manifest).unwrap()).unwrap();
        let Some(Control::Need { needed }) = reply else {
            panic!("expected NEED, got {reply:?}");
        };
        assert_eq!(needed, vec![1]);

        let w = iprog.window(1).unwrap();
        for f in seq.window(1, &w.pvrt, w.hash16).unwrap() {
            assert!(ingest.on_frame(&f).unwrap().is_none());
        }
        ingest.on_frame(&seq.done(&manifest, iprog.sha256_bytes().unwrap()).unwrap()).unwrap();
        assert_eq!(ingest.finish().unwrap(), AckStatus::Done);

        let outcome = fx.registry.outcome("delta").unwrap();
        assert_eq!((outcome.windows_sent, outcome.windows_cached), (1, 2));
    }

    #[test]
    fn corrupted_window_fails_the_transfer() {
        let fx = fixture();
        let object = data(&fx.blob, 8192);
        let options = IprogOptions {
            window_size: 4096,
            ..Default::default()
        };
        let iprog = build_iprog("obj", &object, &fx.blob, &fx.palette, &options).unwrap();
        let manifest = iprog.manifest();
        let r = Reassembler::new(fx.registry.clone(), None);
        let mut ingest = r.open(preface(&fx, "bad", 1, &object)).unwrap();

        let mut seq = FrameSequencer::new(false);
        ingest.on_frame(&seq.manifest(&manifest).unwrap()).unwrap();
        for idx in 0..2 {
            let w = iprog.window(idx).unwrap();
            // Window 1 claims the hash of window 0.
            let hash = iprog.windows[0].hash16;
            for f in seq.window(idx, &w.pvrt, if idx == 1 { hash } else { w.hash16 }).unwrap() {
                ingest.on_frame(&f).unwrap();
            }
        }
        ingest.on_frame(&seq.done(&manifest, iprog.sha256_bytes().unwrap()).unwrap()).unwrap();
        assert_eq!(ingest.finish().unwrap(), AckStatus::Failed);

        let failures = fx.registry.window_failures("bad");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].idx, 1);
        assert_eq!(fx.registry.outcome("bad").unwrap().state, OutcomeState::Failed);
    }

    #[test]
    fn preface_checks() {
        let fx = fixture();
        let object = b"x";
        let r = Reassembler::new(fx.registry.clone(), Some("k".into()));

        let mut p = preface(&fx, "psk", 1, object);
        assert!(matches!(r.open(p.clone()), Err(PvrtError::Transport(_))));
        p.psk = Some("k".into());
        assert!(r.open(p.clone()).is_ok());

        p.blob_fingerprint = "other:1024:1".into();
        p.transfer_id = "psk2".into();
        assert!(matches!(r.open(p), Err(PvrtError::BlobNotFound(_))));
    }

    #[test]
    fn stalled_sessions_are_pruned() {
        let fx = fixture();
        let r = Reassembler::new(fx.registry.clone(), None);
        let _ingest = r.open(preface(&fx, "slow", 2, b"abc")).unwrap();
        assert_eq!(r.prune(Duration::from_secs(60)), 0);
        assert_eq!(r.prune(Duration::ZERO), 1);
        assert_eq!(fx.registry.outcome("slow").unwrap().state, OutcomeState::Failed);
        assert_eq!(r.live_sessions(), 0);
    }

    fn whole(p: &Preface, stream: &[u8]) -> Vec<u8> {
        [p.to_bytes().unwrap(), stream.to_vec()].concat()
    }

    #[test]
    fn aborted_channel_releases_its_session() {
        let fx = fixture();
        let object = data(&fx.blob, 10_000);
        let r = Reassembler::new(fx.registry.clone(), None);

        // An attempt over four channels opens one and dies.
        drop(r.open(preface(&fx, "retry", 4, &object)).unwrap());
        assert_eq!(r.live_sessions(), 0);

        let single = channel_frames(&fx, &object, 1);
        let status = r.ingest_whole(&whole(&preface(&fx, "retry", 1, &object), &single[0]));
        assert_eq!(status.unwrap(), AckStatus::Done);
        assert_eq!(fx.registry.outcome("retry").unwrap().state, OutcomeState::Done);
    }

    #[test]
    fn aborted_channel_keeps_session_while_others_are_open() {
        let fx = fixture();
        let object = data(&fx.blob, 9000);
        let streams = channel_frames(&fx, &object, 2);
        let r = Reassembler::new(fx.registry.clone(), None);
        let base = preface(&fx, "half", 2, &object);

        let mut first = r.open(base.for_channel(0)).unwrap();
        drop(r.open(base.for_channel(1)).unwrap());
        assert_eq!(r.live_sessions(), 1);

        first.feed(&streams[0]).unwrap();
        assert_eq!(first.finish().unwrap(), AckStatus::Ok);
        let mut again = r.open(base.for_channel(1)).unwrap();
        again.feed(&streams[1]).unwrap();
        assert_eq!(again.finish().unwrap(), AckStatus::Done);
    }

    #[test]
    fn new_attempt_replaces_unfinished_session() {
        let fx = fixture();
        let object = data(&fx.blob, 20_000);
        let r = Reassembler::new(fx.registry.clone(), None);

        // Three-channel attempt deposits one channel, then stalls.
        let multi = channel_frames(&fx, &object, 3);
        let mut ch0 = r.open(preface(&fx, "again", 3, &object)).unwrap();
        ch0.feed(&multi[0]).unwrap();
        assert_eq!(ch0.finish().unwrap(), AckStatus::Ok);

        let single = channel_frames(&fx, &object, 1);
        let status = r.ingest_whole(&whole(&preface(&fx, "again", 1, &object), &single[0]));
        assert_eq!(status.unwrap(), AckStatus::Done);
        assert_eq!(r.live_sessions(), 0);
    }

    #[test]
    fn oversized_manifest_fails_without_allocating() {
        let fx = fixture();
        let r = Reassembler::new(fx.registry.clone(), None);
        let windows = 256u32;
        let manifest = Manifest {
            window_size: u32::MAX,
            total_windows: windows,
            size: windows as u64 * u32::MAX as u64,
            hashes: vec![Hash16::of(b"w"); windows as usize],
        };
        let mut seq = FrameSequencer::new(true);
        let mut stream = BytesMut::new();
        seq.manifest(&manifest).unwrap().encode_into(&mut stream).unwrap();
        seq.done(&manifest, [0; 32]).unwrap().encode_into(&mut stream).unwrap();

        let status = r.ingest_whole(&whole(&preface(&fx, "huge", 1, b"huge"), &stream));
        assert_eq!(status.unwrap(), AckStatus::Failed);
        let outcome = fx.registry.outcome("huge").unwrap();
        assert!(outcome.reason.unwrap().contains("window size"));
    }

    #[test]
    fn short_windows_are_not_padded_past_one_window() {
        let fx = fixture();
        let r = Reassembler::new(fx.registry.clone(), None);
        let piece = data(&fx.blob, 100);
        let pvrt = compile_window(&fx.palette, &piece, 0, &IprogOptions::default()).unwrap();
        let hash = Hash16::of(&piece);
        let manifest = Manifest {
            window_size: 4096,
            total_windows: 2,
            size: 8192,
            hashes: vec![hash, hash],
        };

        let mut seq = FrameSequencer::new(true);
        let mut frames = vec![seq.manifest(&manifest).unwrap()];
        for idx in 0..2 {
            frames.extend(seq.window(idx, &pvrt, hash).unwrap());
        }
        frames.push(seq.done(&manifest, [0; 32]).unwrap());
        let mut stream = BytesMut::new();
        for f in frames {
            f.encode_into(&mut stream).unwrap();
        }

        let status = r.ingest_whole(&whole(&preface(&fx, "short", 1, b"short"), &stream));
        assert_eq!(status.unwrap(), AckStatus::Failed);
        let reason = fx.registry.outcome("short").unwrap().reason.unwrap();
        assert!(reason.contains("windows carry 200 bytes"), "{reason}");
    }
}
