//! Window and object digests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{PvrtError, Result};

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Lower-case hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Decode a 64-character hex SHA-256.
pub fn parse_sha256(s: &str) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| PvrtError::Encoding(format!("sha256 {s:?}: {e}")))?;
    Ok(out)
}

/// First 16 bytes of a window's SHA-256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash16(pub [u8; 16]);

impl Hash16 {
    pub fn of(window: &[u8]) -> Self {
        let mut out = [0u8; 16];
        out.copy_from_slice(&sha256(window)[..16]);
        Hash16(out)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash16({})", self.to_hex())
    }
}

impl FromStr for Hash16 {
    type Err = PvrtError;

    fn from_str(s: &str) -> Result<Self> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| PvrtError::Encoding(format!("hash16 {s:?}: {e}")))?;
        Ok(Hash16(out))
    }
}

impl Serialize for Hash16 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash16 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash16_is_sha256_prefix() {
        let full = sha256_hex(b"window");
        let h = Hash16::of(b"window");
        assert_eq!(h.to_hex(), full[..32]);
        assert_eq!(h.to_hex().parse::<Hash16>().unwrap(), h);
    }

    #[test]
    fn hash16_serializes_as_hex() {
        let h = Hash16::of(b"");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        assert_eq!(serde_json::from_str::<Hash16>(&json).unwrap(), h);
        assert!(serde_json::from_str::<Hash16>("\"abc\"").is_err());
    }

    #[test]
    fn sha256_hex_round_trips() {
        let hex = sha256_hex(b"abc");
        assert_eq!(
            hex,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(parse_sha256(&hex).unwrap(), sha256(b"abc"));
        assert!(parse_sha256("zz").is_err());
    }
}
