//! Window sync: which windows to send and how they become frames.

use crate::control::{Control, Manifest};
use crate::error::Result;
use crate::frame::Frame;
use crate::hash::Hash16;

/// Default payload bytes per DATA frame.
pub const DEFAULT_CHUNK: usize = 16 * 1024;

/// Indices `i` where `local[i]` is absent or differs from `remote[i]`.
///
/// Comparison is positional; a short or empty `local` needs every
/// remaining index.
pub fn needed(local: &[Option<Hash16>], remote: &[Hash16]) -> Vec<u32> {
    remote
        .iter()
        .enumerate()
        .filter(|(i, h)| local.get(*i).copied().flatten().as_ref() != Some(*h))
        .map(|(i, _)| i as u32)
        .collect()
}

/// Deal `windows` across `channels` round-robin, preserving order within
/// each channel.
pub fn assign_round_robin(windows: &[u32], channels: u16) -> Vec<Vec<u32>> {
    let channels = channels.max(1) as usize;
    let mut out = vec![Vec::new(); channels];
    for (i, &idx) in windows.iter().enumerate() {
        out[i % channels].push(idx);
    }
    out
}

/// Numbers frames for one channel and cuts window payloads into DATA frames.
#[derive(Debug, Clone)]
pub struct FrameSequencer {
    next_seq: u64,
    binary: bool,
    chunk: usize,
}

impl FrameSequencer {
    pub fn new(binary: bool) -> Self {
        Self::with_chunk(binary, DEFAULT_CHUNK)
    }

    pub fn with_chunk(binary: bool, chunk: usize) -> Self {
        Self {
            next_seq: 0,
            binary,
            chunk: chunk.clamp(1, crate::frame::MAX_FRAME_PAYLOAD),
        }
    }

    fn seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn control(&mut self, msg: &Control) -> Result<Frame> {
        let seq = self.seq();
        Frame::control(seq, msg, self.binary)
    }

    pub fn manifest(&mut self, manifest: &Manifest) -> Result<Frame> {
        self.control(&Control::Manifest(manifest.clone()))
    }

    /// `WIN{idx}`, the PVRT bytes as DATA frames, `END{idx, hash16}`.
    pub fn window(&mut self, idx: u32, pvrt: &[u8], hash16: Hash16) -> Result<Vec<Frame>> {
        let mut frames = Vec::with_capacity(2 + pvrt.len().div_ceil(self.chunk));
        frames.push(self.control(&Control::Win { idx })?);
        for chunk in pvrt.chunks(self.chunk) {
            let seq = self.seq();
            frames.push(Frame::data(seq, chunk.to_vec()));
        }
        frames.push(self.control(&Control::End { idx, hash16 })?);
        Ok(frames)
    }

    pub fn done(&mut self, manifest: &Manifest, sha256: [u8; 32]) -> Result<Frame> {
        self.control(&Control::Done {
            sha256,
            total_windows: Some(manifest.total_windows),
            window_size: Some(manifest.window_size),
        })
    }
}
