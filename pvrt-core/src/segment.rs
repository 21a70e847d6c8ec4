//! Blob reference segments (BREF) and their transform flags.
//!
//! On the wire a segment is `offset:u64 length:u32 flags:u8`. The flag
//! byte is laid out deterministically:
//!
//! ```text
//! bit 7      relative (offset is a signed delta from the session anchor)
//! bits 2..6  imm5 (XOR / ADD immediate)
//! bits 0..1  transform kind: 0 Identity, 1 Xor, 2 Add, 3 Literal
//! ```
//!
//! In memory the transform and the relative bit are kept apart.

use crate::error::{PvrtError, Result};

/// Largest immediate accepted by the XOR / ADD transforms.
pub const MAX_IMM: u8 = 31;

const KIND_MASK: u8 = 0b0000_0011;
const IMM_SHIFT: u8 = 2;
const IMM_MASK: u8 = 0b0111_1100;
const RELATIVE_BIT: u8 = 0b1000_0000;

/// Encoded size of a segment on the wire.
pub const SEGMENT_WIRE_SIZE: usize = 13;

// ── Transform ────────────────────────────────────────────────────

/// How segment bytes are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    /// Blob bytes are used unchanged.
    Identity,
    /// Every blob byte is XOR-ed with the immediate.
    Xor(u8),
    /// The immediate is added (wrapping) to every blob byte.
    Add(u8),
    /// Bytes come from the window's literal pool, not the blob.
    Literal,
}

impl Transform {
    /// Apply the transform in place to bytes read from the blob.
    pub fn apply(&self, bytes: &mut [u8]) {
        match *self {
            Transform::Identity | Transform::Literal => {}
            Transform::Xor(imm) => bytes.iter_mut().for_each(|b| *b ^= imm),
            Transform::Add(imm) => bytes.iter_mut().for_each(|b| *b = b.wrapping_add(imm)),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Transform::Literal)
    }
}

// ── Segment ──────────────────────────────────────────────────────

/// One `(offset, length, flags)` reference.
///
/// For blob transforms `offset` is an absolute blob offset. With
/// `relative` set it is a two's-complement delta from the session anchor.
/// For [`Transform::Literal`] it indexes the literal pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub length: u32,
    pub transform: Transform,
    pub relative: bool,
}

impl Segment {
    pub fn new(offset: u64, length: u32, transform: Transform) -> Self {
        Self {
            offset,
            length,
            transform,
            relative: false,
        }
    }

    pub fn literal(pool_offset: u64, length: u32) -> Self {
        Self::new(pool_offset, length, Transform::Literal)
    }

    /// Encode the transform + relative bit into the wire flag byte.
    pub fn flags(&self) -> u8 {
        let (kind, imm) = match self.transform {
            Transform::Identity => (0u8, 0u8),
            Transform::Xor(imm) => (1, imm),
            Transform::Add(imm) => (2, imm),
            Transform::Literal => (3, 0),
        };
        let mut flags = kind | ((imm << IMM_SHIFT) & IMM_MASK);
        if self.relative {
            flags |= RELATIVE_BIT;
        }
        flags
    }

    /// Decode a wire triple.
    pub fn from_wire(offset: u64, length: u32, flags: u8) -> Result<Self> {
        let imm = (flags & IMM_MASK) >> IMM_SHIFT;
        let transform = match flags & KIND_MASK {
            0 => Transform::Identity,
            1 => Transform::Xor(imm),
            2 => Transform::Add(imm),
            _ => Transform::Literal,
        };
        if matches!(transform, Transform::Identity | Transform::Literal) && imm != 0 {
            return Err(PvrtError::format(format!(
                "segment flags {flags:#04x} carry an immediate without a transform"
            )));
        }
        let relative = flags & RELATIVE_BIT != 0;
        if relative && transform.is_literal() {
            return Err(PvrtError::format("literal segments cannot be relative"));
        }
        Ok(Self {
            offset,
            length,
            transform,
            relative,
        })
    }

    /// Whether `next` directly continues this segment and can be merged.
    pub fn continues_with(&self, next: &Segment) -> bool {
        self.transform == next.transform
            && self.relative == next.relative
            && self.offset.checked_add(self.length as u64) == Some(next.offset)
            && (self.length as u64 + next.length as u64) <= u32::MAX as u64
    }

    /// Absolute blob offset of this segment for a blob of `blob_size` bytes.
    pub fn absolute_offset(&self, anchor: Option<u64>, blob_size: u64) -> Result<u64> {
        if !self.relative {
            return Ok(self.offset);
        }
        let anchor = anchor.ok_or_else(|| {
            PvrtError::format("relative segment without a session anchor")
        })?;
        Ok(resolve_relative(anchor, self.offset as i64, blob_size))
    }
}

/// `(anchor + delta) mod blob_size`, always in `[0, blob_size)`.
pub fn resolve_relative(anchor: u64, delta: i64, blob_size: u64) -> u64 {
    let sum = anchor as i128 + delta as i128;
    sum.rem_euclid(blob_size as i128) as u64
}

/// Signed delta that maps `anchor` to `absolute`, if it is shorter than the
/// absolute offset itself.
pub fn relative_delta(anchor: u64, absolute: u64) -> Option<i64> {
    let delta = absolute as i128 - anchor as i128;
    if delta.unsigned_abs() < absolute as u128 {
        i64::try_from(delta).ok()
    } else {
        None
    }
}

/// Merge adjacent segments with identical flags and contiguous offsets.
pub fn coalesce(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        match out.last_mut() {
            Some(prev) if prev.continues_with(&seg) => prev.length += seg.length,
            _ => out.push(seg),
        }
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_byte_layout() {
        let mut seg = Segment::new(0, 1, Transform::Xor(5));
        assert_eq!(seg.flags(), 0b0001_0101);
        seg.relative = true;
        assert_eq!(seg.flags(), 0b1001_0101);
        assert_eq!(Segment::new(0, 1, Transform::Identity).flags(), 0);
        assert_eq!(Segment::literal(0, 1).flags(), 3);
    }

    #[test]
    fn flags_decode() {
        for transform in [
            Transform::Identity,
            Transform::Xor(0),
            Transform::Xor(31),
            Transform::Add(17),
            Transform::Literal,
        ] {
            let seg = Segment::new(9, 4, transform);
            assert_eq!(Segment::from_wire(9, 4, seg.flags()).unwrap(), seg);
        }
        // Identity with a stray immediate is rejected.
        assert!(Segment::from_wire(0, 1, 0b0000_0100).is_err());
        // Relative literal is rejected.
        assert!(Segment::from_wire(0, 1, 0b1000_0011).is_err());
    }

    #[test]
    fn transforms_apply() {
        let mut bytes = [0x10u8, 0xFF];
        Transform::Xor(0x01).apply(&mut bytes);
        assert_eq!(bytes, [0x11, 0xFE]);
        Transform::Add(2).apply(&mut bytes);
        assert_eq!(bytes, [0x13, 0x00]);
    }

    #[test]
    fn relative_offset_wraps_into_blob() {
        let size = 1u64 << 30;
        assert_eq!(resolve_relative(500_000_000, -12, size), 499_999_988 % size);
        assert_eq!(resolve_relative(5, -10, 100), 95);
        assert_eq!(resolve_relative(95, 10, 100), 5);

        let mut seg = Segment::new((-12i64) as u64, 8, Transform::Identity);
        seg.relative = true;
        assert_eq!(seg.absolute_offset(Some(500_000_000), size).unwrap(), 499_999_988);
        assert!(seg.absolute_offset(None, size).is_err());
    }

    #[test]
    fn relative_delta_only_when_shorter() {
        assert_eq!(relative_delta(500_000_000, 499_999_988), Some(-12));
        assert_eq!(relative_delta(500_000_000, 10), None);
    }

    #[test]
    fn coalesce_merges_contiguous_runs() {
        let segs = vec![
            Segment::new(100, 256, Transform::Identity),
            Segment::new(356, 256, Transform::Identity),
            Segment::new(612, 256, Transform::Xor(3)),
            Segment::new(2000, 256, Transform::Identity),
        ];
        let merged = coalesce(segs);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0], Segment::new(100, 512, Transform::Identity));
    }
}
