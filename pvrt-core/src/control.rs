//! Window-sync control messages.
//!
//! Control messages travel as the payload of frames with
//! [`FrameFlags::CONTROL`](crate::frame::FrameFlags::CONTROL) set. Two
//! encodings exist and are told apart by the first byte:
//!
//! - JSON objects tagged by `"type"` (`{"type":"NEED","needed":[1,4]}`)
//! - compact binary codes for the per-window hot path:
//!
//! ```text
//! 0xA1 WIN   idx:u32
//! 0xA2 END   idx:u32 hash16[16]
//! 0xA3 DONE  sha256[32]
//! ```
//!
//! Messages are decoded once at the boundary into [`Control`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PvrtError, Result};
use crate::hash::Hash16;
use crate::wire::Reader;

// ── ControlCode ──────────────────────────────────────────────────

/// Leading byte of a binary control message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    Win = 0xA1,
    End = 0xA2,
    Done = 0xA3,
}

impl TryFrom<u8> for ControlCode {
    type Error = PvrtError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xA1 => Ok(ControlCode::Win),
            0xA2 => Ok(ControlCode::End),
            0xA3 => Ok(ControlCode::Done),
            _ => Err(PvrtError::UnknownVariant {
                type_name: "ControlCode",
                value: value as u64,
            }),
        }
    }
}

// ── Manifest ─────────────────────────────────────────────────────

/// Largest window a manifest may declare.
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Window layout of the object being sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub window_size: u32,
    pub total_windows: u32,
    pub size: u64,
    pub hashes: Vec<Hash16>,
}

impl Manifest {
    /// Byte length of window `idx`.
    pub fn window_len(&self, idx: u32) -> Option<usize> {
        if idx >= self.total_windows {
            return None;
        }
        let start = idx as u64 * self.window_size as u64;
        Some(self.size.saturating_sub(start).min(self.window_size as u64) as usize)
    }

    /// Structural consistency: hash count and window count agree with `size`,
    /// and the window size is within [`MAX_WINDOW_SIZE`].
    pub fn validate(&self) -> Result<()> {
        if self.hashes.len() != self.total_windows as usize {
            return Err(PvrtError::format(format!(
                "manifest lists {} hashes for {} windows",
                self.hashes.len(),
                self.total_windows
            )));
        }
        if self.window_size == 0 && self.size > 0 {
            return Err(PvrtError::format("manifest window size is zero"));
        }
        if self.window_size > MAX_WINDOW_SIZE {
            return Err(PvrtError::format(format!(
                "manifest window size {} exceeds {MAX_WINDOW_SIZE}",
                self.window_size
            )));
        }
        let expected = if self.size == 0 {
            0
        } else {
            self.size.div_ceil(self.window_size as u64)
        };
        if expected != self.total_windows as u64 {
            return Err(PvrtError::format(format!(
                "manifest declares {} windows, size {} needs {expected}",
                self.total_windows, self.size
            )));
        }
        Ok(())
    }
}

// ── AckStatus ────────────────────────────────────────────────────

/// Receiver verdict for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Object assembled and verified.
    Done,
    /// Channel accepted; other channels still pending.
    Ok,
    /// Assembly or verification failed.
    Failed,
}

impl AckStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, AckStatus::Failed)
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckStatus::Done => write!(f, "done"),
            AckStatus::Ok => write!(f, "ok"),
            AckStatus::Failed => write!(f, "failed"),
        }
    }
}

// ── Control ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Control {
    #[serde(rename = "MFST")]
    Manifest(Manifest),

    #[serde(rename = "NEED")]
    Need { needed: Vec<u32> },

    #[serde(rename = "WIN")]
    Win { idx: u32 },

    #[serde(rename = "END")]
    End { idx: u32, hash16: Hash16 },

    #[serde(rename = "DONE")]
    Done {
        #[serde(with = "hex")]
        sha256: [u8; 32],
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_windows: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window_size: Option<u32>,
    },

    #[serde(rename = "ACK")]
    Ack { status: AckStatus },
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Manifest(m) => write!(f, "MFST({} windows)", m.total_windows),
            Control::Need { needed } => write!(f, "NEED({} windows)", needed.len()),
            Control::Win { idx } => write!(f, "WIN({idx})"),
            Control::End { idx, .. } => write!(f, "END({idx})"),
            Control::Done { .. } => write!(f, "DONE"),
            Control::Ack { status } => write!(f, "ACK({status})"),
        }
    }
}

impl Control {
    /// Encode; WIN / END / DONE use binary codes when `binary` is set.
    pub fn encode(&self, binary: bool) -> Result<Vec<u8>> {
        if binary {
            match self {
                Control::Win { idx } => {
                    let mut out = Vec::with_capacity(5);
                    out.push(ControlCode::Win as u8);
                    out.extend_from_slice(&idx.to_le_bytes());
                    return Ok(out);
                }
                Control::End { idx, hash16 } => {
                    let mut out = Vec::with_capacity(21);
                    out.push(ControlCode::End as u8);
                    out.extend_from_slice(&idx.to_le_bytes());
                    out.extend_from_slice(hash16.as_bytes());
                    return Ok(out);
                }
                Control::Done { sha256, .. } => {
                    let mut out = Vec::with_capacity(33);
                    out.push(ControlCode::Done as u8);
                    out.extend_from_slice(sha256);
                    return Ok(out);
                }
                _ => {}
            }
        }
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode either encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some(&first) = bytes.first() else {
            return Err(PvrtError::format("empty control message"));
        };
        if first == b'{' {
            return serde_json::from_slice(bytes)
                .map_err(|e| PvrtError::format(format!("control JSON: {e}")));
        }

        let code = ControlCode::try_from(first)?;
        let mut r = Reader::new(&bytes[1..], "binary control");
        let msg = match code {
            ControlCode::Win => Control::Win { idx: r.u32()? },
            ControlCode::End => Control::End {
                idx: r.u32()?,
                hash16: Hash16(r.array()?),
            },
            ControlCode::Done => Control::Done {
                sha256: r.array()?,
                total_windows: None,
                window_size: None,
            },
        };
        if r.remaining() != 0 {
            return Err(PvrtError::format(format!(
                "{} trailing bytes after binary {code:?}",
                r.remaining()
            )));
        }
        Ok(msg)
    }
}

// ── Data-channel signalling ──────────────────────────────────────

/// Body of `POST /rtc/offer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcOffer {
    pub transfer_id: String,
}

/// Answer to an [`RtcOffer`]: the path of a one-shot data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcAnswer {
    pub channel: String,
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            window_size: 65536,
            total_windows: 3,
            size: 150_000,
            hashes: vec![Hash16::of(b"a"), Hash16::of(b"b"), Hash16::of(b"c")],
        }
    }

    #[test]
    fn json_uses_type_tag() {
        let need = Control::Need { needed: vec![1, 4] };
        let json = String::from_utf8(need.encode(false).unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"NEED","needed":[1,4]}"#);

        let ack: Control = Control::decode(br#"{"type":"ACK","status":"done"}"#).unwrap();
        assert_eq!(ack, Control::Ack { status: AckStatus::Done });

        let mfst = Control::Manifest(manifest());
        let bytes = mfst.encode(true).unwrap();
        // Manifests are always JSON.
        assert_eq!(bytes[0], b'{');
        assert!(String::from_utf8_lossy(&bytes).contains(r#""type":"MFST""#));
        assert_eq!(Control::decode(&bytes).unwrap(), mfst);
    }

    #[test]
    fn binary_codes() {
        let win = Control::Win { idx: 7 }.encode(true).unwrap();
        assert_eq!(win, vec![0xA1, 7, 0, 0, 0]);
        assert_eq!(Control::decode(&win).unwrap(), Control::Win { idx: 7 });

        let h = Hash16::of(b"window");
        let end = Control::End { idx: 2, hash16: h }.encode(true).unwrap();
        assert_eq!(end.len(), 21);
        assert_eq!(Control::decode(&end).unwrap(), Control::End { idx: 2, hash16: h });

        let done = Control::Done {
            sha256: [9; 32],
            total_windows: Some(3),
            window_size: None,
        };
        let bin = done.encode(true).unwrap();
        assert_eq!(bin.len(), 33);
        match Control::decode(&bin).unwrap() {
            Control::Done { sha256, total_windows, .. } => {
                assert_eq!(sha256, [9; 32]);
                assert_eq!(total_windows, None);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn done_json_carries_hex_digest() {
        let done = Control::Done {
            sha256: [0xAB; 32],
            total_windows: Some(3),
            window_size: Some(65536),
        };
        let json = String::from_utf8(done.encode(false).unwrap()).unwrap();
        assert!(json.contains(&"ab".repeat(32)));
        assert_eq!(Control::decode(json.as_bytes()).unwrap(), done);
    }

    #[test]
    fn malformed_control_is_rejected() {
        assert!(Control::decode(&[]).is_err());
        assert!(Control::decode(&[0xA1, 1, 2]).is_err());
        assert!(Control::decode(&[0xA1, 1, 0, 0, 0, 0]).is_err());
        assert!(matches!(
            Control::decode(&[0x55]),
            Err(PvrtError::UnknownVariant { .. })
        ));
        assert!(Control::decode(br#"{"type":"NOPE"}"#).is_err());
    }

    #[test]
    fn manifest_window_lengths() {
        let m = manifest();
        m.validate().unwrap();
        assert_eq!(m.window_len(0), Some(65536));
        assert_eq!(m.window_len(2), Some(18928));
        assert_eq!(m.window_len(3), None);

        let bad = Manifest { total_windows: 2, ..manifest() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn inconsistent_manifest_window_len_does_not_underflow() {
        // Not validated: more windows than the size covers.
        let m = Manifest {
            window_size: 1000,
            total_windows: 4,
            size: 1500,
            hashes: vec![Hash16::of(b"x"); 4],
        };
        assert!(m.validate().is_err());
        assert_eq!(m.window_len(1), Some(500));
        assert_eq!(m.window_len(2), Some(0));
        assert_eq!(m.window_len(3), Some(0));
    }

    #[test]
    fn oversized_window_is_rejected() {
        let windows = 256u32;
        let m = Manifest {
            window_size: u32::MAX,
            total_windows: windows,
            size: windows as u64 * u32::MAX as u64,
            hashes: vec![Hash16::of(b"big"); windows as usize],
        };
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");

        let at_limit = Manifest {
            window_size: MAX_WINDOW_SIZE,
            total_windows: 1,
            size: MAX_WINDOW_SIZE as u64,
            hashes: vec![Hash16::of(b"ok")],
        };
        at_limit.validate().unwrap();
    }
}
