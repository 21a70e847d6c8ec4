//! Deterministic shared reference buffer.
//!
//! A [`Blob`] is identified by `(name, size, seed)`. Its content is a pure
//! function of those three fields: every 8-byte word is produced by a
//! SplitMix64 step over a key derived from the fingerprint, using only
//! fixed-width `u64` arithmetic. Two processes on different architectures
//! therefore see the same bytes without exchanging them.
//!
//! The generator is position-addressable, so [`Blob::read`] works before
//! the buffer is materialised. [`Blob::ensure_filled`] materialises it once
//! (progressively, cancellably) and reads become plain slice copies.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PvrtError, Result};
use crate::rate::RateEstimator;

/// Golden-ratio increment used by SplitMix64.
const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Bytes generated between progress updates / cancellation checks.
const FILL_CHUNK: usize = 4 * 1024 * 1024;

// ── BlobSpec ─────────────────────────────────────────────────────

/// Identity of a blob: its content is fully determined by these fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobSpec {
    pub name: String,
    pub size: u64,
    pub seed: u64,
}

impl BlobSpec {
    pub fn new(name: impl Into<String>, size: u64, seed: u64) -> Self {
        Self {
            name: name.into(),
            size,
            seed,
        }
    }

    /// `"name:size:seed"`.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.name, self.size, self.seed)
    }

    /// Parse a fingerprint back into a spec. The name may itself contain `:`.
    pub fn parse_fingerprint(fp: &str) -> Result<Self> {
        let mut parts = fp.rsplitn(3, ':');
        let seed = parts.next();
        let size = parts.next();
        let name = parts.next();
        match (name, size, seed) {
            (Some(name), Some(size), Some(seed)) if !name.is_empty() => Ok(Self {
                name: name.to_string(),
                size: size
                    .parse()
                    .map_err(|_| PvrtError::format(format!("bad blob size in {fp:?}")))?,
                seed: seed
                    .parse()
                    .map_err(|_| PvrtError::format(format!("bad blob seed in {fp:?}")))?,
            }),
            _ => Err(PvrtError::format(format!("malformed blob fingerprint {fp:?}"))),
        }
    }
}

impl Default for BlobSpec {
    fn default() -> Self {
        Self {
            name: "pvrt".into(),
            size: 256 * 1024 * 1024,
            seed: 0,
        }
    }
}

// ── FillProgress ─────────────────────────────────────────────────

/// Snapshot of a running (or finished) fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FillProgress {
    pub filled: u64,
    pub size: u64,
    pub pct: f64,
    pub bps: u64,
    /// Estimated seconds remaining; `None` until a rate is known.
    pub eta: Option<f64>,
}

impl FillProgress {
    fn start(size: u64) -> Self {
        Self {
            filled: 0,
            size,
            pct: 0.0,
            bps: 0,
            eta: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.filled >= self.size
    }
}

// ── Generator ────────────────────────────────────────────────────

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn word_at(key: u64, word: u64) -> u64 {
    splitmix64(key.wrapping_add(word.wrapping_mul(GOLDEN_GAMMA)))
}

fn derive_key(spec: &BlobSpec) -> u64 {
    let digest = blake3::hash(spec.fingerprint().as_bytes());
    let mut key = [0u8; 8];
    key.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(key)
}

/// Write the generator output for `[offset, offset + out.len())` into `out`.
fn generate_into(key: u64, offset: u64, out: &mut [u8]) {
    let mut pos = offset;
    let mut i = 0;
    while i < out.len() {
        let skip = (pos % 8) as usize;
        let bytes = word_at(key, pos / 8).to_le_bytes();
        let take = (8 - skip).min(out.len() - i);
        out[i..i + take].copy_from_slice(&bytes[skip..skip + take]);
        i += take;
        pos += take as u64;
    }
}

// ── Blob ─────────────────────────────────────────────────────────

/// Read-only deterministic buffer shared by every component of a process.
#[derive(Debug)]
pub struct Blob {
    spec: BlobSpec,
    key: u64,
    data: OnceLock<Box<[u8]>>,
    filling: AtomicBool,
    progress: watch::Sender<FillProgress>,
}

impl Blob {
    /// Create a blob handle. Nothing is allocated until [`ensure_filled`].
    ///
    /// [`ensure_filled`]: Self::ensure_filled
    pub fn new(spec: BlobSpec) -> Result<Self> {
        if spec.size == 0 {
            return Err(PvrtError::format("blob size must be non-zero"));
        }
        let key = derive_key(&spec);
        let (progress, _) = watch::channel(FillProgress::start(spec.size));
        Ok(Self {
            spec,
            key,
            data: OnceLock::new(),
            filling: AtomicBool::new(false),
            progress,
        })
    }

    pub fn spec(&self) -> &BlobSpec {
        &self.spec
    }

    pub fn fingerprint(&self) -> String {
        self.spec.fingerprint()
    }

    pub fn size(&self) -> u64 {
        self.spec.size
    }

    pub fn is_filled(&self) -> bool {
        self.data.get().is_some()
    }

    /// Subscribe to fill progress updates.
    pub fn progress(&self) -> watch::Receiver<FillProgress> {
        self.progress.subscribe()
    }

    /// Bounds-checked read of `length` bytes at `offset`.
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; length];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    /// Bounds-checked read into a caller-supplied buffer.
    pub fn read_into(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let length = out.len() as u64;
        let end = offset.checked_add(length);
        if (offset >= self.spec.size && length > 0) || end.is_none_or(|e| e > self.spec.size) {
            return Err(PvrtError::Range {
                offset,
                length,
                size: self.spec.size,
            });
        }
        match self.data.get() {
            Some(data) => {
                // Filled buffers are exactly `size` bytes, so these casts fit.
                let start = offset as usize;
                out.copy_from_slice(&data[start..start + out.len()]);
            }
            None => generate_into(self.key, offset, out),
        }
        Ok(())
    }

    /// Materialise the whole buffer. Idempotent.
    ///
    /// Only one filler runs per blob; a concurrent caller waits for it. The
    /// fill yields to the runtime between chunks and stops with
    /// [`PvrtError::Cancelled`] when `cancel` fires.
    pub async fn ensure_filled(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_filled() {
            return Ok(());
        }
        if self
            .filling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return self.wait_for_filler(cancel).await;
        }

        let result = self.fill(cancel).await;
        self.filling.store(false, Ordering::SeqCst);
        // Wake waiters even when the fill was cancelled.
        self.progress.send_modify(|_| {});
        result
    }

    async fn wait_for_filler(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.progress.subscribe();
        loop {
            if self.is_filled() {
                return Ok(());
            }
            if !self.filling.load(Ordering::SeqCst) {
                return Err(PvrtError::Cancelled);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(PvrtError::Cancelled);
                    }
                }
                _ = cancel.cancelled() => return Err(PvrtError::Cancelled),
            }
        }
    }

    async fn fill(&self, cancel: &CancellationToken) -> Result<()> {
        let size = usize::try_from(self.spec.size).map_err(|_| PvrtError::PayloadTooLarge {
            size: usize::MAX,
            max: usize::MAX,
        })?;
        info!(blob = %self.fingerprint(), size, "filling blob");

        let mut buf = vec![0u8; size];
        let mut rate = RateEstimator::with_window(Duration::from_secs(3));
        rate.observe(0);
        let mut filled = 0usize;

        while filled < size {
            if cancel.is_cancelled() {
                debug!(blob = %self.fingerprint(), filled, "blob fill cancelled");
                return Err(PvrtError::Cancelled);
            }
            let end = (filled + FILL_CHUNK).min(size);
            generate_into(self.key, filled as u64, &mut buf[filled..end]);
            filled = end;
            rate.observe(filled as u64);

            let remaining = (size - filled) as u64;
            self.progress.send_replace(FillProgress {
                filled: filled as u64,
                size: size as u64,
                pct: filled as f64 * 100.0 / size as f64,
                bps: rate.bytes_per_sec(),
                eta: rate.eta(remaining).map(|d| d.as_secs_f64()),
            });
            tokio::task::yield_now().await;
        }

        let _ = self.data.set(buf.into_boxed_slice());
        info!(blob = %self.fingerprint(), "blob filled");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
