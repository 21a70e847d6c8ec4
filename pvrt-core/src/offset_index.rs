//! Computed offset index.
//!
//! A [`ModuleDescriptor`] replaces a long list of blob offsets with a
//! formula: a single stride when the offsets form an arithmetic
//! progression modulo the blob size, otherwise per-block anchors with
//! `i32` deltas. The descriptor carries a BLAKE3 integrity hash over its
//! bincode payload.

use serde::{Deserialize, Serialize};

use crate::error::{PvrtError, Result};
use crate::segment::resolve_relative;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetMode {
    /// `offset(i) = (base + i * stride) mod blob_size`
    Stride { base: u64, stride: u64 },
    /// Block `b` covers indices `b*span .. (b+1)*span`; its first offset is
    /// `anchors[b]`, the rest are `anchors[b] + deltas[b][j-1]`.
    DeltaBlock {
        block_span: u32,
        anchors: Vec<u64>,
        deltas: Vec<Vec<i32>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Payload {
    module_id: String,
    seed: u64,
    mode: OffsetMode,
    instruction_count: u64,
    blob_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    payload: Payload,
    integrity_hash: [u8; 32],
}

impl ModuleDescriptor {
    pub fn from_offsets(
        module_id: impl Into<String>,
        seed: u64,
        offsets: &[u64],
        blob_size: u64,
        block_span: u32,
    ) -> Result<Self> {
        if blob_size == 0 {
            return Err(PvrtError::Other("blob size must be non-zero".into()));
        }
        if let Some(&bad) = offsets.iter().find(|&&o| o >= blob_size) {
            return Err(PvrtError::Range {
                offset: bad,
                length: 1,
                size: blob_size,
            });
        }

        let mode = match stride_of(offsets, blob_size) {
            Some((base, stride)) => OffsetMode::Stride { base, stride },
            None => delta_blocks(offsets, blob_size, block_span)?,
        };
        let payload = Payload {
            module_id: module_id.into(),
            seed,
            mode,
            instruction_count: offsets.len() as u64,
            blob_size,
        };
        let integrity_hash = digest(&payload)?;
        Ok(Self {
            payload,
            integrity_hash,
        })
    }

    pub fn module_id(&self) -> &str {
        &self.payload.module_id
    }

    pub fn seed(&self) -> u64 {
        self.payload.seed
    }

    pub fn mode(&self) -> &OffsetMode {
        &self.payload.mode
    }

    pub fn instruction_count(&self) -> u64 {
        self.payload.instruction_count
    }

    pub fn blob_size(&self) -> u64 {
        self.payload.blob_size
    }

    pub fn integrity_hash(&self) -> &[u8; 32] {
        &self.integrity_hash
    }

    /// Offset of instruction `i`.
    pub fn offset(&self, i: u64) -> Result<u64> {
        let p = &self.payload;
        if i >= p.instruction_count {
            return Err(PvrtError::Range {
                offset: i,
                length: 1,
                size: p.instruction_count,
            });
        }
        match &p.mode {
            OffsetMode::Stride { base, stride } => {
                let v = (*base as u128 + i as u128 * *stride as u128) % p.blob_size as u128;
                Ok(v as u64)
            }
            OffsetMode::DeltaBlock {
                block_span,
                anchors,
                deltas,
            } => {
                let span = *block_span as u64;
                if span == 0 {
                    return Err(PvrtError::format("descriptor block span is zero"));
                }
                let (b, j) = ((i / span) as usize, (i % span) as usize);
                let anchor = *anchors
                    .get(b)
                    .ok_or_else(|| PvrtError::format(format!("descriptor lacks block {b}")))?;
                if j == 0 {
                    return Ok(anchor);
                }
                let delta = deltas
                    .get(b)
                    .and_then(|d| d.get(j - 1))
                    .ok_or_else(|| PvrtError::format(format!("descriptor lacks delta {b}/{j}")))?;
                Ok(resolve_relative(anchor, *delta as i64, p.blob_size))
            }
        }
    }

    /// All offsets, in order.
    pub fn offsets(&self) -> Result<Vec<u64>> {
        (0..self.instruction_count()).map(|i| self.offset(i)).collect()
    }

    /// Recompute the integrity hash.
    pub fn verify(&self) -> Result<()> {
        let actual = digest(&self.payload)?;
        if actual != self.integrity_hash {
            return Err(PvrtError::VerificationMismatch {
                what: format!("module descriptor {}", self.payload.module_id),
                expected: hex::encode(self.integrity_hash),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let descriptor: Self = bincode::deserialize(bytes)?;
        descriptor.verify()?;
        descriptor.payload.check_shape()?;
        Ok(descriptor)
    }
}

impl Payload {
    /// The invariants `from_offsets` establishes, for payloads read back
    /// from bytes.
    fn check_shape(&self) -> Result<()> {
        if self.blob_size == 0 {
            return Err(PvrtError::format("descriptor blob size is zero"));
        }
        match &self.mode {
            OffsetMode::Stride { base, .. } => {
                if self.instruction_count > 0 && *base >= self.blob_size {
                    return Err(PvrtError::format(format!(
                        "descriptor base {base} outside blob of {} bytes",
                        self.blob_size
                    )));
                }
            }
            OffsetMode::DeltaBlock {
                block_span,
                anchors,
                deltas,
            } => {
                if *block_span == 0 {
                    return Err(PvrtError::format("descriptor block span is zero"));
                }
                let span = *block_span as u64;
                let blocks = self.instruction_count.div_ceil(span);
                if anchors.len() as u64 != blocks || deltas.len() as u64 != blocks {
                    return Err(PvrtError::format(format!(
                        "descriptor has {} anchors and {} delta blocks, {} instructions need {blocks}",
                        anchors.len(),
                        deltas.len(),
                        self.instruction_count
                    )));
                }
                for (b, (anchor, block)) in anchors.iter().zip(deltas).enumerate() {
                    let len = span.min(self.instruction_count - b as u64 * span);
                    if *anchor >= self.blob_size || block.len() as u64 != len - 1 {
                        return Err(PvrtError::format(format!("descriptor block {b} is malformed")));
                    }
                }
            }
        }
        Ok(())
    }
}

fn digest(payload: &Payload) -> Result<[u8; 32]> {
    Ok(*blake3::hash(&bincode::serialize(payload)?).as_bytes())
}

/// `(base, stride)` if `offsets` is an arithmetic progression mod `size`.
fn stride_of(offsets: &[u64], size: u64) -> Option<(u64, u64)> {
    let (&base, rest) = match offsets.split_first() {
        Some(split) => split,
        None => return Some((0, 0)),
    };
    let stride = match rest.first() {
        Some(&next) => ((next as u128 + size as u128 - base as u128) % size as u128) as u64,
        None => 0,
    };
    let fits = offsets.iter().enumerate().all(|(i, &o)| {
        (base as u128 + i as u128 * stride as u128) % size as u128 == o as u128
    });
    fits.then_some((base, stride))
}

fn delta_blocks(offsets: &[u64], size: u64, block_span: u32) -> Result<OffsetMode> {
    if block_span == 0 {
        return Err(PvrtError::Other("block span must be non-zero".into()));
    }
    let mut anchors = Vec::new();
    let mut deltas = Vec::new();
    for block in offsets.chunks(block_span as usize) {
        let anchor = block[0];
        let block_deltas = block[1..]
            .iter()
            .map(|&o| {
                let d = o as i128 - anchor as i128;
                i32::try_from(d).map_err(|_| {
                    PvrtError::Encoding(format!(
                        "offset {o} is {d} bytes from its block anchor {anchor}; use a smaller block span"
                    ))
                })
            })
            .collect::<Result<Vec<i32>>>()?;
        anchors.push(anchor);
        deltas.push(block_deltas);
    }
    Ok(OffsetMode::DeltaBlock {
        block_span,
        anchors,
        deltas,
    })
}
