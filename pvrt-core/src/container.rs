//! PVRT container: the per-window encoding of a compiled byte range.
//!
//! ```text
//! "PVRT" ver:u8 count:u8
//! count × ( tag:u8 len:u32 body[len] )
//! ```
//!
//! | tag  | section | body                                             |
//! |------|---------|--------------------------------------------------|
//! | 0x01 | RAW     | literal pool, uncompressed                       |
//! | 0x02 | PROTO   | literal pool, zstd-compressed                    |
//! | 0x03 | BREF    | `count:u16` + `count × (offset u64, length u32, flags u8)` |
//!
//! Every section appears at most once; RAW and PROTO are mutually
//! exclusive.

use crate::blob::Blob;
use crate::compiler::{Segments, materialize};
use crate::error::{PvrtError, Result};
use crate::segment::{SEGMENT_WIRE_SIZE, Segment, relative_delta};
use crate::wire::Reader;

pub const PVRT_MAGIC: &[u8; 4] = b"PVRT";
pub const PVRT_VERSION: u8 = 1;

/// Most segments a BREF section can carry.
pub const MAX_BREF_SEGMENTS: usize = u16::MAX as usize;

/// Upper bound for a decompressed literal pool.
pub const MAX_LITERAL_POOL: usize = 64 * 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;

/// Section tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionTag {
    Raw = 0x01,
    Proto = 0x02,
    Bref = 0x03,
}

impl TryFrom<u8> for SectionTag {
    type Error = PvrtError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(SectionTag::Raw),
            0x02 => Ok(SectionTag::Proto),
            0x03 => Ok(SectionTag::Bref),
            v => Err(PvrtError::UnknownVariant {
                type_name: "SectionTag",
                value: v as u64,
            }),
        }
    }
}

/// One section handed to [`build_container`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Raw(Vec<u8>),
    /// Already compressed bytes.
    Proto(Vec<u8>),
    Bref(Vec<Segment>),
}

impl Section {
    pub fn tag(&self) -> SectionTag {
        match self {
            Section::Raw(_) => SectionTag::Raw,
            Section::Proto(_) => SectionTag::Proto,
            Section::Bref(_) => SectionTag::Bref,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        match self {
            Section::Raw(bytes) | Section::Proto(bytes) => Ok(bytes.clone()),
            Section::Bref(segments) => {
                let count = u16::try_from(segments.len()).map_err(|_| PvrtError::PayloadTooLarge {
                    size: segments.len(),
                    max: u16::MAX as usize,
                })?;
                let mut body = Vec::with_capacity(2 + segments.len() * SEGMENT_WIRE_SIZE);
                body.extend_from_slice(&count.to_le_bytes());
                for seg in segments {
                    body.extend_from_slice(&seg.offset.to_le_bytes());
                    body.extend_from_slice(&seg.length.to_le_bytes());
                    body.push(seg.flags());
                }
                Ok(body)
            }
        }
    }
}

/// Serialize `sections` into a PVRT container.
pub fn build_container(sections: &[Section]) -> Result<Vec<u8>> {
    let count = u8::try_from(sections.len()).map_err(|_| PvrtError::PayloadTooLarge {
        size: sections.len(),
        max: u8::MAX as usize,
    })?;

    let mut out = Vec::new();
    out.extend_from_slice(PVRT_MAGIC);
    out.push(PVRT_VERSION);
    out.push(count);
    for section in sections {
        let body = section.encode_body()?;
        let len = u32::try_from(body.len()).map_err(|_| PvrtError::PayloadTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;
        out.push(section.tag() as u8);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&body);
    }
    Ok(out)
}

// ── Container ────────────────────────────────────────────────────

/// A parsed PVRT container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub raw: Option<Vec<u8>>,
    pub proto: Option<Vec<u8>>,
    pub bref: Option<Vec<Segment>>,
}

/// Parse a PVRT container.
pub fn parse_container(bytes: &[u8]) -> Result<Container> {
    let mut r = Reader::new(bytes, "PVRT container");
    if r.take(4)? != PVRT_MAGIC {
        return Err(PvrtError::InvalidMagic { expected: "PVRT" });
    }
    let version = r.u8()?;
    if version != PVRT_VERSION {
        return Err(PvrtError::UnsupportedVersion(version));
    }
    let count = r.u8()?;

    let mut container = Container::default();
    for _ in 0..count {
        let tag = SectionTag::try_from(r.u8()?)
            .map_err(|e| PvrtError::format(format!("PVRT section: {e}")))?;
        let len = r.u32()? as usize;
        let body = r.take(len)?;

        let duplicate = match tag {
            SectionTag::Raw => container.raw.replace(body.to_vec()).is_some(),
            SectionTag::Proto => container.proto.replace(body.to_vec()).is_some(),
            SectionTag::Bref => container.bref.replace(parse_bref(body)?).is_some(),
        };
        if duplicate {
            return Err(PvrtError::format(format!("duplicate PVRT section {tag:?}")));
        }
    }
    if r.remaining() != 0 {
        return Err(PvrtError::format(format!(
            "{} trailing bytes after PVRT sections",
            r.remaining()
        )));
    }
    if container.raw.is_some() && container.proto.is_some() {
        return Err(PvrtError::format("PVRT carries both RAW and PROTO"));
    }
    Ok(container)
}

fn parse_bref(body: &[u8]) -> Result<Vec<Segment>> {
    let mut r = Reader::new(body, "BREF section");
    let count = r.u16()? as usize;
    if r.remaining() != count * SEGMENT_WIRE_SIZE {
        return Err(PvrtError::format(format!(
            "BREF declares {count} segments but carries {} bytes",
            r.remaining()
        )));
    }
    (0..count)
        .map(|_| {
            let offset = r.u64()?;
            let length = r.u32()?;
            let flags = r.u8()?;
            Segment::from_wire(offset, length, flags)
        })
        .collect()
}

impl Container {
    /// Build the container for a compiled range.
    ///
    /// With an `anchor`, blob segments are rewritten as anchor-relative
    /// deltas whenever that is shorter. The literal pool is stored as PROTO
    /// when compression makes it smaller, otherwise as RAW.
    pub fn from_segments(compiled: &Segments, anchor: Option<u64>) -> Result<Self> {
        let bref = compiled
            .segments
            .iter()
            .map(|seg| match (anchor, seg.transform.is_literal()) {
                (Some(anchor), false) => match relative_delta(anchor, seg.offset) {
                    Some(delta) => Segment {
                        offset: delta as u64,
                        relative: true,
                        ..*seg
                    },
                    None => *seg,
                },
                _ => *seg,
            })
            .collect();

        let mut container = Container {
            bref: Some(bref),
            ..Default::default()
        };
        if !compiled.literals.is_empty() {
            let packed = zstd::bulk::compress(&compiled.literals, ZSTD_LEVEL)?;
            if packed.len() < compiled.literals.len() {
                container.proto = Some(packed);
            } else {
                container.raw = Some(compiled.literals.clone());
            }
        }
        Ok(container)
    }

    /// Sections in tag order.
    pub fn sections(&self) -> Vec<Section> {
        let mut sections = Vec::with_capacity(3);
        if let Some(raw) = &self.raw {
            sections.push(Section::Raw(raw.clone()));
        }
        if let Some(proto) = &self.proto {
            sections.push(Section::Proto(proto.clone()));
        }
        if let Some(bref) = &self.bref {
            sections.push(Section::Bref(bref.clone()));
        }
        sections
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        build_container(&self.sections())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        parse_container(bytes)
    }

    /// The literal pool, decompressed if carried as PROTO.
    pub fn literal_pool(&self) -> Result<Vec<u8>> {
        match (&self.raw, &self.proto) {
            (Some(raw), _) => Ok(raw.clone()),
            (None, Some(proto)) => zstd::bulk::decompress(proto, MAX_LITERAL_POOL)
                .map_err(|e| PvrtError::format(format!("PROTO section: {e}"))),
            (None, None) => Ok(Vec::new()),
        }
    }

    /// Rebuild the window bytes against `blob`.
    pub fn resolve(&self, blob: &Blob, anchor: Option<u64>) -> Result<Vec<u8>> {
        let Some(segments) = &self.bref else {
            // A RAW-only container is the window itself.
            return self.literal_pool();
        };
        let pool = self.literal_pool()?;
        materialize(segments, &pool, blob, anchor)
    }
}

/// Parse and resolve in one step.
pub fn resolve(container: &[u8], blob: &Blob, anchor: Option<u64>) -> Result<Vec<u8>> {
    parse_container(container)?.resolve(blob, anchor)
}

// ── Tests ────────────────────────────────────────────────────────
