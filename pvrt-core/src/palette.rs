//! Palette matcher — bounded tile index over a region of the blob.
//!
//! The palette splits `[offset, offset + len)` of the blob into aligned
//! tiles and indexes them by content. Lookups try, in order:
//!
//! 1. **Identity**: exact content match (a short final tile may match the
//!    prefix of a palette tile).
//! 2. **Soft identity**: optional and lossy: a candidate sharing the first
//!    8 bytes is accepted when enough bytes agree over a bounded prefix.
//! 3. **XOR**: a constant-byte input tile against a constant-byte palette
//!    tile, with an immediate in `0..=31`.
//! 4. **ADD**: as XOR, with a wrapping additive immediate.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob::Blob;
use crate::error::{PvrtError, Result};
use crate::segment::{MAX_IMM, Transform};

/// Default tile size in bytes.
pub const DEFAULT_TILE_SIZE: usize = 256;

// ── PaletteConfig ────────────────────────────────────────────────

/// Region and matching parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaletteConfig {
    /// First blob byte of the indexed region.
    pub offset: u64,
    /// Region length in bytes (clamped to the blob).
    pub len: u64,
    /// Tile size in bytes.
    pub tile_size: usize,
    /// Bytes verified for XOR / ADD candidates.
    pub confirm_len: usize,
    /// Similarity threshold (0.0–1.0) enabling soft identity; `None` disables it.
    pub soft_identity: Option<f64>,
    /// Bytes compared when scoring a soft-identity candidate.
    pub soft_confirm_len: usize,
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self {
            offset: 0,
            len: 4 * 1024 * 1024,
            tile_size: DEFAULT_TILE_SIZE,
            confirm_len: 64,
            soft_identity: None,
            soft_confirm_len: 128,
        }
    }
}

// ── TileMatch ────────────────────────────────────────────────────

/// Where a tile was found and how it must be transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMatch {
    /// Absolute blob offset.
    pub offset: u64,
    pub transform: Transform,
}

// ── Palette ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Palette {
    config: PaletteConfig,
    /// Absolute blob offset of `region[0]`.
    base: u64,
    region: Vec<u8>,
    /// BLAKE3 of tile content → region offset of its first occurrence.
    exact: HashMap<[u8; 32], usize>,
    /// First 8 bytes → region offset (soft identity candidates).
    prefixes: HashMap<[u8; 8], usize>,
    /// Constant byte value → region offset of the first constant tile.
    constants: BTreeMap<u8, usize>,
}

impl Palette {
    /// Read the configured region from `blob` and index it.
    pub fn from_blob(blob: &Blob, config: PaletteConfig) -> Result<Self> {
        if config.offset >= blob.size() {
            return Err(PvrtError::Range {
                offset: config.offset,
                length: config.len,
                size: blob.size(),
            });
        }
        let len = config.len.min(blob.size() - config.offset);
        let len = usize::try_from(len).map_err(|_| PvrtError::PayloadTooLarge {
            size: usize::MAX,
            max: usize::MAX,
        })?;
        let region = blob.read(config.offset, len)?;
        let base = config.offset;
        Self::index(region, base, config)
    }

    /// Index an explicit region whose first byte sits at blob offset `base`.
    pub fn index(region: Vec<u8>, base: u64, config: PaletteConfig) -> Result<Self> {
        if config.tile_size == 0 {
            return Err(PvrtError::format("palette tile size must be non-zero"));
        }
        let ts = config.tile_size;
        let mut exact = HashMap::new();
        let mut prefixes = HashMap::new();
        let mut constants = BTreeMap::new();

        for (i, tile) in region.chunks_exact(ts).enumerate() {
            let at = i * ts;
            exact.entry(*blake3::hash(tile).as_bytes()).or_insert(at);
            if config.soft_identity.is_some() && ts >= 8 {
                let mut key = [0u8; 8];
                key.copy_from_slice(&tile[..8]);
                prefixes.entry(key).or_insert(at);
            }
            if is_constant(tile) {
                constants.entry(tile[0]).or_insert(at);
            }
        }

        debug!(
            base,
            tiles = region.len() / ts,
            constant_tiles = constants.len(),
            "palette indexed"
        );

        Ok(Self {
            config,
            base,
            region,
            exact,
            prefixes,
            constants,
        })
    }

    pub fn config(&self) -> &PaletteConfig {
        &self.config
    }

    pub fn tile_size(&self) -> usize {
        self.config.tile_size
    }

    /// Number of full tiles in the region.
    pub fn tile_count(&self) -> usize {
        self.region.len() / self.config.tile_size
    }

    /// Constant-byte tiles usable as XOR / ADD bases: `(byte, blob offset)`.
    pub fn constant_bases(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        self.constants
            .iter()
            .map(|(&byte, &at)| (byte, self.base + at as u64))
    }

    /// Find `tile` in the palette, trying identity, soft identity, XOR and ADD.
    pub fn find(&self, tile: &[u8]) -> Option<TileMatch> {
        if tile.is_empty() || tile.len() > self.config.tile_size {
            return None;
        }
        self.identity(tile)
            .or_else(|| self.soft_identity(tile))
            .or_else(|| self.transformed(tile))
    }

    fn at(&self, region_offset: usize, transform: Transform) -> TileMatch {
        TileMatch {
            offset: self.base + region_offset as u64,
            transform,
        }
    }

    fn identity(&self, tile: &[u8]) -> Option<TileMatch> {
        let ts = self.config.tile_size;
        if tile.len() == ts {
            let &at = self.exact.get(blake3::hash(tile).as_bytes())?;
            return (self.region[at..at + ts] == *tile).then(|| self.at(at, Transform::Identity));
        }
        // Short final tile: first palette tile with a matching prefix.
        (0..self.tile_count())
            .map(|i| i * ts)
            .find(|&at| self.region[at..at + tile.len()] == *tile)
            .map(|at| self.at(at, Transform::Identity))
    }

    fn soft_identity(&self, tile: &[u8]) -> Option<TileMatch> {
        let threshold = self.config.soft_identity?;
        if tile.len() != self.config.tile_size || tile.len() < 8 {
            return None;
        }
        let mut key = [0u8; 8];
        key.copy_from_slice(&tile[..8]);
        let &at = self.prefixes.get(&key)?;

        let n = self.config.soft_confirm_len.clamp(1, tile.len());
        let same = self.region[at..at + n]
            .iter()
            .zip(&tile[..n])
            .filter(|(a, b)| a == b)
            .count();
        (same as f64 / n as f64 >= threshold).then(|| self.at(at, Transform::Identity))
    }

    fn transformed(&self, tile: &[u8]) -> Option<TileMatch> {
        if !is_constant(tile) {
            return None;
        }
        let value = tile[0];
        let n = self.config.confirm_len.clamp(1, tile.len());

        let xor = self.constants.iter().find_map(|(&c, &at)| {
            let imm = value ^ c;
            (imm <= MAX_IMM && self.confirm(at, &tile[..n], |b| b ^ imm))
                .then(|| self.at(at, Transform::Xor(imm)))
        });
        xor.or_else(|| {
            self.constants.iter().find_map(|(&c, &at)| {
                let imm = value.wrapping_sub(c);
                (imm <= MAX_IMM && self.confirm(at, &tile[..n], |b| b.wrapping_add(imm)))
                    .then(|| self.at(at, Transform::Add(imm)))
            })
        })
    }

    fn confirm(&self, at: usize, expected: &[u8], f: impl Fn(u8) -> u8) -> bool {
        self.region[at..at + expected.len()]
            .iter()
            .zip(expected)
            .all(|(&b, &e)| f(b) == e)
    }
}

fn is_constant(bytes: &[u8]) -> bool {
    bytes.first().is_some_and(|&first| bytes.iter().all(|&b| b == first))
}

// ── Tests ────────────────────────────────────────────────────────
