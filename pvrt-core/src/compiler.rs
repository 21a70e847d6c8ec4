//! Segment compiler — turns file bytes into blob references.
//!
//! Input is cut into palette-sized tiles; every tile is looked up in the
//! [`Palette`]. Under [`CompilePolicy::Strict`] a miss aborts the compile;
//! under [`CompilePolicy::Lenient`] the tile is carried as a literal.
//! Adjacent segments that continue each other are coalesced.

use serde::{Deserialize, Serialize};

use crate::blob::Blob;
use crate::error::{PvrtError, Result};
use crate::palette::Palette;
use crate::segment::{Segment, Transform, coalesce};

/// How unmatched tiles are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilePolicy {
    /// Every tile must match; no literal escape.
    Strict,
    /// Unmatched tiles become literal segments.
    #[default]
    Lenient,
}

impl std::fmt::Display for CompilePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompilePolicy::Strict => write!(f, "strict"),
            CompilePolicy::Lenient => write!(f, "lenient"),
        }
    }
}

impl std::str::FromStr for CompilePolicy {
    type Err = PvrtError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(CompilePolicy::Strict),
            "lenient" => Ok(CompilePolicy::Lenient),
            other => Err(PvrtError::Other(format!("unknown compile policy {other:?}"))),
        }
    }
}

/// Compiled form of a byte range: ordered segments plus the literal pool
/// that [`Transform::Literal`] segments index into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segments {
    pub segments: Vec<Segment>,
    pub literals: Vec<u8>,
}

impl Segments {
    /// Total number of bytes described.
    pub fn output_len(&self) -> u64 {
        self.segments.iter().map(|s| s.length as u64).sum()
    }

    /// Bytes expressed as blob references (everything but literals).
    pub fn referenced_len(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| !s.transform.is_literal())
            .map(|s| s.length as u64)
            .sum()
    }
}

/// Compile `data` against `palette`.
///
/// `file_offset` is only used to report where a strict compile failed.
pub fn compile(
    palette: &Palette,
    data: &[u8],
    file_offset: u64,
    policy: CompilePolicy,
) -> Result<Segments> {
    let ts = palette.tile_size();
    if u32::try_from(ts).is_err() {
        return Err(PvrtError::format("tile size does not fit a segment length"));
    }

    let mut segments = Vec::with_capacity(data.len() / ts + 1);
    let mut literals = Vec::new();

    for (tile_index, tile) in data.chunks(ts).enumerate() {
        let length = tile.len() as u32;
        match palette.find(tile) {
            Some(m) => segments.push(Segment::new(m.offset, length, m.transform)),
            None => match policy {
                CompilePolicy::Strict => {
                    return Err(PvrtError::Compile {
                        tile: tile_index,
                        offset: file_offset + (tile_index * ts) as u64,
                    });
                }
                CompilePolicy::Lenient => {
                    segments.push(Segment::literal(literals.len() as u64, length));
                    literals.extend_from_slice(tile);
                }
            },
        }
    }

    Ok(Segments {
        segments: coalesce(segments),
        literals,
    })
}

/// Rebuild the bytes described by `segments`.
///
/// Blob segments are read from `blob` (relative ones resolved against
/// `anchor`) and transformed; literal segments are copied from `literals`.
pub fn materialize(
    segments: &[Segment],
    literals: &[u8],
    blob: &Blob,
    anchor: Option<u64>,
) -> Result<Vec<u8>> {
    let total: u64 = segments.iter().map(|s| s.length as u64).sum();
    let mut out = Vec::with_capacity(total as usize);

    for seg in segments {
        let len = seg.length as usize;
        match seg.transform {
            Transform::Literal => {
                let start = seg.offset;
                let end = start.checked_add(len as u64).filter(|&e| e <= literals.len() as u64);
                let Some(end) = end else {
                    return Err(PvrtError::Range {
                        offset: start,
                        length: len as u64,
                        size: literals.len() as u64,
                    });
                };
                out.extend_from_slice(&literals[start as usize..end as usize]);
            }
            transform => {
                let offset = seg.absolute_offset(anchor, blob.size())?;
                let at = out.len();
                out.resize(at + len, 0);
                blob.read_into(offset, &mut out[at..])?;
                transform.apply(&mut out[at..]);
            }
        }
    }
    Ok(out)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobSpec;
    use crate::palette::PaletteConfig;

    fn setup() -> (Blob, Palette) {
        let blob = Blob::new(BlobSpec::new("compile", 1 << 20, 11)).unwrap();
        let palette = Palette::from_blob(
            &blob,
            PaletteConfig {
                offset: 4096,
                len: 64 * 1024,
                ..Default::default()
            },
        )
        .unwrap();
        (blob, palette)
    }

    #[test]
    fn adjacent_matches_coalesce() {
        let (blob, palette) = setup();
        let data = blob.read(4096 + 256 * 10, 512).unwrap();
        let compiled = compile(&palette, &data, 0, CompilePolicy::Strict).unwrap();
        assert_eq!(compiled.segments, vec![Segment::new(4096 + 2560, 512, Transform::Identity)]);
        assert!(compiled.literals.is_empty());
        assert_eq!(materialize(&compiled.segments, &[], &blob, None).unwrap(), data);
    }

    #[test]
    fn strict_policy_rejects_unmatched_tile() {
        let (blob, palette) = setup();
        let mut data = blob.read(4096, 256).unwrap();
        data.extend((0..256u32).map(|i| (i * 31 % 251) as u8));

        match compile(&palette, &data, 65536, CompilePolicy::Strict) {
            Err(PvrtError::Compile { tile, offset }) => {
                assert_eq!(tile, 1);
                assert_eq!(offset, 65536 + 256);
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[test]
    fn lenient_policy_emits_literals() {
        let (blob, palette) = setup();
        let noise: Vec<u8> = (0..300u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut data = blob.read(4096 + 256, 256).unwrap();
        data.extend_from_slice(&noise);

        let compiled = compile(&palette, &data, 0, CompilePolicy::Lenient).unwrap();
        assert_eq!(compiled.literals, noise);
        // One identity run, then the two literal tiles merged into one segment.
        assert_eq!(compiled.segments.len(), 2);
        assert_eq!(compiled.segments[1], Segment::literal(0, 300));
        assert_eq!(compiled.referenced_len(), 256);
        assert_eq!(compiled.output_len(), data.len() as u64);

        let rebuilt = materialize(&compiled.segments, &compiled.literals, &blob, None).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn materialize_rejects_literal_overrun() {
        let (blob, _) = setup();
        let segs = [Segment::literal(4, 8)];
        assert!(matches!(
            materialize(&segs, &[0u8; 10], &blob, None),
            Err(PvrtError::Range { .. })
        ));
    }

    #[test]
    fn policy_parses() {
        assert_eq!("strict".parse::<CompilePolicy>().unwrap(), CompilePolicy::Strict);
        assert_eq!(CompilePolicy::default(), CompilePolicy::Lenient);
        assert!("loose".parse::<CompilePolicy>().is_err());
    }
}
