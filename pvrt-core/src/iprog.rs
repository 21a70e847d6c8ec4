//! IPROG: windowed, blob-referenced encoding of a whole file.
//!
//! The file is cut into fixed-size windows. Each window gets a `hash16`
//! (first 16 bytes of its SHA-256) and a PVRT container compiled against
//! the palette. The JSON manifest records everything a sender needs to
//! drive the window sync protocol.

use std::ops::Range;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::blob::{Blob, BlobSpec};
use crate::compiler::{CompilePolicy, Segments, compile};
use crate::container::{Container, MAX_BREF_SEGMENTS, resolve};
use crate::control::{MAX_WINDOW_SIZE, Manifest};
use crate::error::{PvrtError, Result};
use crate::hash::{Hash16, parse_sha256, sha256, sha256_hex};
use crate::palette::Palette;
use crate::segment::Segment;

pub const DEFAULT_WINDOW_SIZE: usize = 65536;

/// Build parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IprogOptions {
    pub window_size: usize,
    pub policy: CompilePolicy,
    /// Write blob segments relative to this offset when shorter.
    pub anchor: Option<u64>,
}

impl Default for IprogOptions {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            policy: CompilePolicy::Lenient,
            anchor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub index: u32,
    pub hash16: Hash16,
    pub len: u32,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub pvrt: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneInfo {
    pub sha256: String,
    pub total_windows: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub pvrt_total: u64,
    pub tx_ratio: f64,
}

/// The IPROG manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iprog {
    pub file: String,
    pub size: u64,
    pub sha256: String,
    pub window_size: u32,
    pub blob: BlobSpec,
    pub windows: Vec<WindowEntry>,
    pub done: DoneInfo,
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<u64>,
    #[serde(default)]
    pub policy: CompilePolicy,
}

/// Byte ranges of the windows of a `len`-byte file.
pub fn partition(len: usize, window_size: usize) -> Vec<Range<usize>> {
    if window_size == 0 {
        return Vec::new();
    }
    (0..len.div_ceil(window_size))
        .map(|i| i * window_size..((i + 1) * window_size).min(len))
        .collect()
}

/// Compile one window into PVRT bytes.
pub fn compile_window(
    palette: &Palette,
    window: &[u8],
    file_offset: u64,
    options: &IprogOptions,
) -> Result<Vec<u8>> {
    let compiled = compile(palette, window, file_offset, options.policy)?;
    Container::from_segments(&fit_bref(compiled, window), options.anchor)?.to_bytes()
}

/// A window too fragmented for one BREF section goes out as a single
/// literal run.
fn fit_bref(compiled: Segments, window: &[u8]) -> Segments {
    if compiled.segments.len() <= MAX_BREF_SEGMENTS {
        return compiled;
    }
    debug!(
        segments = compiled.segments.len(),
        len = window.len(),
        "window stored as literals"
    );
    Segments {
        segments: vec![Segment::literal(0, window.len() as u32)],
        literals: window.to_vec(),
    }
}

/// Resolve a window's PVRT bytes and check them against `expected`.
pub fn decode_window(
    pvrt: &[u8],
    blob: &Blob,
    anchor: Option<u64>,
    idx: u32,
    expected: &Hash16,
) -> Result<Vec<u8>> {
    let bytes = resolve(pvrt, blob, anchor)?;
    let actual = Hash16::of(&bytes);
    if actual != *expected {
        return Err(PvrtError::VerificationMismatch {
            what: format!("window {idx}"),
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(bytes)
}

/// Build the IPROG for `data`.
pub fn build_iprog(
    file: &str,
    data: &[u8],
    blob: &Blob,
    palette: &Palette,
    options: &IprogOptions,
) -> Result<Iprog> {
    if options.window_size == 0 || options.window_size > MAX_WINDOW_SIZE as usize {
        return Err(PvrtError::Other(format!(
            "window size {} out of range",
            options.window_size
        )));
    }

    let ranges = partition(data.len(), options.window_size);
    let mut windows = Vec::with_capacity(ranges.len());
    let mut pvrt_total = 0u64;

    for (index, range) in ranges.into_iter().enumerate() {
        let window = &data[range.clone()];
        let pvrt = compile_window(palette, window, range.start as u64, options)?;
        pvrt_total += pvrt.len() as u64;
        debug!(index, len = window.len(), pvrt = pvrt.len(), "window compiled");
        windows.push(WindowEntry {
            index: index as u32,
            hash16: Hash16::of(window),
            len: window.len() as u32,
            pvrt,
        });
    }

    let size = data.len() as u64;
    let tx_ratio = if size == 0 {
        0.0
    } else {
        pvrt_total as f64 / size as f64
    };
    let sha = sha256_hex(data);
    info!(file, size, windows = windows.len(), pvrt_total, tx_ratio, "iprog built");

    Ok(Iprog {
        file: file.to_string(),
        size,
        sha256: sha.clone(),
        window_size: options.window_size as u32,
        blob: blob.spec().clone(),
        done: DoneInfo {
            sha256: sha,
            total_windows: windows.len() as u32,
        },
        windows,
        metrics: Metrics { pvrt_total, tx_ratio },
        anchor: options.anchor,
        policy: options.policy,
    })
}

impl Iprog {
    pub fn total_windows(&self) -> u32 {
        self.windows.len() as u32
    }

    pub fn hashes(&self) -> Vec<Hash16> {
        self.windows.iter().map(|w| w.hash16).collect()
    }

    pub fn manifest(&self) -> Manifest {
        Manifest {
            window_size: self.window_size,
            total_windows: self.total_windows(),
            size: self.size,
            hashes: self.hashes(),
        }
    }

    pub fn sha256_bytes(&self) -> Result<[u8; 32]> {
        parse_sha256(&self.sha256)
    }

    pub fn window(&self, idx: u32) -> Option<&WindowEntry> {
        self.windows.get(idx as usize)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let iprog: Iprog = serde_json::from_str(json)?;
        iprog.manifest().validate()?;
        Ok(iprog)
    }

    /// Decode every window against `blob` and check the object digest.
    pub fn reassemble(&self, blob: &Blob) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size as usize);
        for w in &self.windows {
            out.extend(decode_window(&w.pvrt, blob, self.anchor, w.index, &w.hash16)?);
        }
        let actual = sha256(&out);
        if actual != self.sha256_bytes()? {
            return Err(PvrtError::VerificationMismatch {
                what: "object".into(),
                expected: self.sha256.clone(),
                actual: hex::encode(actual),
            });
        }
        Ok(out)
    }
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    BASE64.decode(s).map_err(serde::de::Error::custom)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::PaletteConfig;

    fn setup() -> (Blob, Palette) {
        let blob = Blob::new(BlobSpec::new("iprog", 4 << 20, 21)).unwrap();
        let palette = Palette::from_blob(
            &blob,
            PaletteConfig {
                offset: 0,
                len: 1 << 20,
                ..Default::default()
            },
        )
        .unwrap();
        (blob, palette)
    }

    /// Blob-backed bytes with a noisy stretch in the middle.
    fn sample(blob: &Blob, len: usize) -> Vec<u8> {
        let mut data = blob.read(8192, len).unwrap();
        for (i, b) in data[1000..1600].iter_mut().enumerate() {
            *b = (i * 37 % 253) as u8;
        }
        data
    }

    #[test]
    fn partition_sizes() {
        let lens: Vec<usize> = partition(150_000, 65536).iter().map(|r| r.len()).collect();
        assert_eq!(lens, vec![65536, 65536, 18928]);
        assert!(partition(0, 65536).is_empty());
        assert_eq!(partition(65536, 65536).len(), 1);
    }

    #[test]
    fn build_and_reassemble() {
        let (blob, palette) = setup();
        let data = sample(&blob, 150_000);
        let iprog = build_iprog("sample.bin", &data, &blob, &palette, &IprogOptions::default()).unwrap();

        assert_eq!(iprog.total_windows(), 3);
        assert_eq!(iprog.done.total_windows, 3);
        assert_eq!(iprog.windows[2].len, 18928);
        assert_eq!(iprog.sha256, sha256_hex(&data));
        assert!(iprog.metrics.tx_ratio > 0.0 && iprog.metrics.tx_ratio < 1.0);
        assert_eq!(
            iprog.metrics.pvrt_total,
            iprog.windows.iter().map(|w| w.pvrt.len() as u64).sum::<u64>()
        );
        assert_eq!(iprog.reassemble(&blob).unwrap(), data);
    }

    #[test]
    fn empty_file() {
        let (blob, palette) = setup();
        let iprog = build_iprog("empty", &[], &blob, &palette, &IprogOptions::default()).unwrap();
        assert_eq!(iprog.total_windows(), 0);
        assert_eq!(iprog.metrics.tx_ratio, 0.0);
        assert!(iprog.reassemble(&blob).unwrap().is_empty());
    }

    #[test]
    fn json_round_trip_keeps_windows() {
        let (blob, palette) = setup();
        let data = sample(&blob, 70_000);
        let options = IprogOptions {
            anchor: Some(8192),
            ..Default::default()
        };
        let iprog = build_iprog("a", &data, &blob, &palette, &options).unwrap();
        let json = iprog.to_json().unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["windows"][0]["hash16"], iprog.windows[0].hash16.to_hex());
        assert_eq!(value["policy"], "lenient");
        assert_eq!(value["anchor"], 8192);

        let back = Iprog::from_json(&json).unwrap();
        assert_eq!(back.windows, iprog.windows);
        assert_eq!(back.reassemble(&blob).unwrap(), data);
    }

    #[test]
    fn strict_policy_fails_on_noise() {
        let (blob, palette) = setup();
        let data = sample(&blob, 4096);
        let options = IprogOptions {
            policy: CompilePolicy::Strict,
            ..Default::default()
        };
        match build_iprog("s", &data, &blob, &palette, &options) {
            Err(PvrtError::Compile { tile, .. }) => assert_eq!(tile, 3),
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[test]
    fn corrupted_window_is_detected() {
        let (blob, palette) = setup();
        let data = sample(&blob, 2048);
        let window = compile_window(&palette, &data, 0, &IprogOptions::default()).unwrap();
        let wrong = Hash16::of(b"other");
        assert!(matches!(
            decode_window(&window, &blob, None, 0, &wrong),
            Err(PvrtError::VerificationMismatch { .. })
        ));
        assert_eq!(decode_window(&window, &blob, None, 0, &Hash16::of(&data)).unwrap(), data);
    }

    #[test]
    fn fragmented_window_falls_back_to_literals() {
        let blob = Blob::new(BlobSpec::new("frag", 1 << 20, 2)).unwrap();
        let window: Vec<u8> = (0..MAX_BREF_SEGMENTS + 10).map(|i| (i % 251) as u8).collect();
        let compiled = Segments {
            segments: (0..window.len() as u64).map(|i| Segment::literal(i, 1)).collect(),
            literals: window.clone(),
        };
        assert!(Container::from_segments(&compiled, None).unwrap().to_bytes().is_err());

        let fitted = fit_bref(compiled, &window);
        assert_eq!(fitted.segments.len(), 1);
        let bytes = Container::from_segments(&fitted, None).unwrap().to_bytes().unwrap();
        assert_eq!(decode_window(&bytes, &blob, None, 0, &Hash16::of(&window)).unwrap(), window);
    }
}
