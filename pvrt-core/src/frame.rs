//! Channel wire format: one preface followed by frames.
//!
//! ```text
//! Preface (once per channel, LE):
//!   "PVRT" ver:u8 flags:u8 channels:u16 channel_id:u16
//!   [len:u16 transfer_id] [len:u16 blob_fingerprint]
//!   [len:u16 object_sha256(32)] [len:u16 psk]
//!   [len:u8=8 anchor:u64]          (only with PrefaceFlags::ANCHOR)
//!
//! Frame:
//!   "PF" seq:u64 len:u32 flags:u8 payload[len]     (len ≤ 1 MiB)
//! ```
//!
//! [`FrameCodec`] drives both through `tokio_util::codec`.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::control::Control;
use crate::error::{PvrtError, Result};
use crate::wire::{Reader, put_short_bytes};

pub const PREFACE_MAGIC: &[u8; 4] = b"PVRT";
pub const PREFACE_VERSION: u8 = 1;

pub const FRAME_MAGIC: &[u8; 2] = b"PF";
pub const FRAME_HEADER_SIZE: usize = 15;
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

bitflags! {
    /// Per-frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// Payload is a control message; otherwise window data.
        const CONTROL = 0x01;
    }
}

bitflags! {
    /// Preface flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PrefaceFlags: u8 {
        const ANCHOR = 0x01;
        /// Sender will not wait for NEED; all windows follow MFST.
        const NO_NEGOTIATE = 0x02;
        const BINARY_CONTROL = 0x04;
    }
}

// ── Frame ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(seq: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            flags: FrameFlags::empty(),
            payload: payload.into(),
        }
    }

    pub fn control(seq: u64, msg: &Control, binary: bool) -> Result<Self> {
        Ok(Self {
            seq,
            flags: FrameFlags::CONTROL,
            payload: msg.encode(binary)?.into(),
        })
    }

    pub fn is_control(&self) -> bool {
        self.flags.contains(FrameFlags::CONTROL)
    }

    /// Decode the payload of a control frame.
    pub fn control_message(&self) -> Result<Control> {
        if !self.is_control() {
            return Err(PvrtError::format(format!("frame {} is not a control frame", self.seq)));
        }
        Control::decode(&self.payload)
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(PvrtError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }
        dst.reserve(self.encoded_len());
        dst.put_slice(FRAME_MAGIC);
        dst.put_u64_le(self.seq);
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_u8(self.flags.bits());
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Take one complete frame off the front of `src`, if present.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        if &src[..2] != FRAME_MAGIC {
            return Err(PvrtError::InvalidMagic { expected: "PF" });
        }
        let mut header = &src[2..FRAME_HEADER_SIZE];
        let seq = header.get_u64_le();
        let len = header.get_u32_le() as usize;
        let raw_flags = header.get_u8();

        if len > MAX_FRAME_PAYLOAD {
            return Err(PvrtError::PayloadTooLarge {
                size: len,
                max: MAX_FRAME_PAYLOAD,
            });
        }
        let flags = FrameFlags::from_bits(raw_flags).ok_or(PvrtError::UnknownVariant {
            type_name: "FrameFlags",
            value: raw_flags as u64,
        })?;
        if src.len() < FRAME_HEADER_SIZE + len {
            src.reserve(FRAME_HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        Ok(Some(Self { seq, flags, payload }))
    }
}

/// Parse a buffer holding back-to-back frames and nothing else.
pub fn parse_frames(bytes: &[u8]) -> Result<Vec<Frame>> {
    let mut buf = BytesMut::from(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = Frame::decode(&mut buf)? {
        frames.push(frame);
    }
    if !buf.is_empty() {
        return Err(PvrtError::format(format!("{} bytes of truncated frame", buf.len())));
    }
    Ok(frames)
}

// ── Preface ──────────────────────────────────────────────────────

/// Channel preface: identifies the transfer and this channel's place in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preface {
    pub transfer_id: String,
    pub channels: u16,
    pub channel_id: u16,
    pub blob_fingerprint: String,
    pub object_sha256: [u8; 32],
    pub psk: Option<String>,
    pub anchor: Option<u64>,
    pub negotiate: bool,
    pub binary_control: bool,
}

impl Preface {
    pub fn flags(&self) -> PrefaceFlags {
        let mut flags = PrefaceFlags::empty();
        flags.set(PrefaceFlags::ANCHOR, self.anchor.is_some());
        flags.set(PrefaceFlags::NO_NEGOTIATE, !self.negotiate);
        flags.set(PrefaceFlags::BINARY_CONTROL, self.binary_control);
        flags
    }

    /// Same preface, addressed to another channel.
    pub fn for_channel(&self, channel_id: u16) -> Self {
        Self {
            channel_id,
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64 + self.transfer_id.len() + self.blob_fingerprint.len());
        out.extend_from_slice(PREFACE_MAGIC);
        out.push(PREFACE_VERSION);
        out.push(self.flags().bits());
        out.extend_from_slice(&self.channels.to_le_bytes());
        out.extend_from_slice(&self.channel_id.to_le_bytes());
        put_short_bytes(&mut out, self.transfer_id.as_bytes())?;
        put_short_bytes(&mut out, self.blob_fingerprint.as_bytes())?;
        put_short_bytes(&mut out, &self.object_sha256)?;
        put_short_bytes(&mut out, self.psk.as_deref().unwrap_or_default().as_bytes())?;
        if let Some(anchor) = self.anchor {
            out.push(8);
            out.extend_from_slice(&anchor.to_le_bytes());
        }
        Ok(out)
    }

    /// Length of the complete preface at the front of `buf`, or `None` if
    /// more bytes are needed.
    fn peek_len(buf: &[u8]) -> Option<usize> {
        const FIXED: usize = 4 + 1 + 1 + 2 + 2;
        if buf.len() < FIXED {
            return None;
        }
        let flags = PrefaceFlags::from_bits_retain(buf[5]);
        let mut at = FIXED;
        for _ in 0..4 {
            let len = u16::from_le_bytes([*buf.get(at)?, *buf.get(at + 1)?]) as usize;
            at += 2 + len;
        }
        if flags.contains(PrefaceFlags::ANCHOR) {
            at += 1 + *buf.get(at)? as usize;
        }
        (buf.len() >= at).then_some(at)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes, "preface");
        let preface = Self::read(&mut r)?;
        if r.remaining() != 0 {
            return Err(PvrtError::format(format!("{} trailing bytes after preface", r.remaining())));
        }
        Ok(preface)
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        if r.take(4)? != PREFACE_MAGIC {
            return Err(PvrtError::InvalidMagic { expected: "PVRT" });
        }
        let version = r.u8()?;
        if version != PREFACE_VERSION {
            return Err(PvrtError::UnsupportedVersion(version));
        }
        let raw_flags = r.u8()?;
        let flags = PrefaceFlags::from_bits(raw_flags).ok_or(PvrtError::UnknownVariant {
            type_name: "PrefaceFlags",
            value: raw_flags as u64,
        })?;
        let channels = r.u16()?;
        let channel_id = r.u16()?;
        let transfer_id = utf8(r.short_bytes()?, "transfer id")?;
        let blob_fingerprint = utf8(r.short_bytes()?, "blob fingerprint")?;

        let sha = r.short_bytes()?;
        let object_sha256: [u8; 32] = sha
            .try_into()
            .map_err(|_| PvrtError::format(format!("object sha256 is {} bytes", sha.len())))?;

        let psk = utf8(r.short_bytes()?, "psk")?;
        let anchor = if flags.contains(PrefaceFlags::ANCHOR) {
            let len = r.u8()?;
            if len != 8 {
                return Err(PvrtError::format(format!("anchor length {len}, expected 8")));
            }
            Some(r.u64()?)
        } else {
            None
        };

        if transfer_id.is_empty() {
            return Err(PvrtError::format("empty transfer id"));
        }
        if channels == 0 || channel_id >= channels {
            return Err(PvrtError::format(format!(
                "channel {channel_id} outside 0..{channels}"
            )));
        }

        Ok(Self {
            transfer_id,
            channels,
            channel_id,
            blob_fingerprint,
            object_sha256,
            psk: (!psk.is_empty()).then_some(psk),
            anchor,
            negotiate: !flags.contains(PrefaceFlags::NO_NEGOTIATE),
            binary_control: flags.contains(PrefaceFlags::BINARY_CONTROL),
        })
    }

    /// Take a complete preface off the front of `src`, if present.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() >= 4 && &src[..4] != PREFACE_MAGIC {
            return Err(PvrtError::InvalidMagic { expected: "PVRT" });
        }
        let Some(len) = Self::peek_len(src) else {
            return Ok(None);
        };
        let bytes = src.split_to(len);
        Self::from_bytes(&bytes).map(Some)
    }
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| PvrtError::format(format!("{what} is not UTF-8")))
}

// ── FrameCodec ───────────────────────────────────────────────────

/// One decoded unit of a channel stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireItem {
    Preface(Preface),
    Frame(Frame),
}

/// Stateful channel codec: the first item is a [`Preface`], every
/// following item a [`Frame`].
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    preface_done: bool,
}

impl FrameCodec {
    /// Codec for a stream that starts with a preface.
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec for a stream that carries frames only (the reply direction).
    pub fn frames_only() -> Self {
        Self { preface_done: true }
    }
}

impl Decoder for FrameCodec {
    type Item = WireItem;
    type Error = PvrtError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if !self.preface_done {
            let Some(preface) = Preface::decode(src)? else {
                return Ok(None);
            };
            self.preface_done = true;
            return Ok(Some(WireItem::Preface(preface)));
        }
        Ok(Frame::decode(src)?.map(WireItem::Frame))
    }
}

impl Encoder<WireItem> for FrameCodec {
    type Error = PvrtError;

    fn encode(&mut self, item: WireItem, dst: &mut BytesMut) -> Result<()> {
        match item {
            WireItem::Preface(preface) => {
                dst.extend_from_slice(&preface.to_bytes()?);
                self.preface_done = true;
                Ok(())
            }
            WireItem::Frame(frame) => frame.encode_into(dst),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PvrtError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        item.encode_into(dst)
    }
}

// ── Whole-stream messages ────────────────────────────────────────

/// Largest length-delimited whole-stream message accepted.
pub const MAX_WHOLE_MESSAGE: usize = 1 << 30;

/// Codec for transports that carry a complete channel stream (preface and
/// every frame) as one length-delimited message, and the ACK frame back.
pub fn whole_message_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_WHOLE_MESSAGE)
        .new_codec()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::AckStatus;

    fn preface() -> Preface {
        Preface {
            transfer_id: "t-1".into(),
            channels: 2,
            channel_id: 1,
            blob_fingerprint: "pvrt:1048576:7".into(),
            object_sha256: [3; 32],
            psk: Some("secret".into()),
            anchor: Some(500_000_000),
            negotiate: true,
            binary_control: true,
        }
    }

    #[test]
    fn frame_header_layout() {
        let frame = Frame::data(0x0102, &b"xyz"[..]);
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(&bytes[..2], b"PF");
        assert_eq!(u64::from_le_bytes(bytes[2..10].try_into().unwrap()), 0x0102);
        assert_eq!(u32::from_le_bytes(bytes[10..14].try_into().unwrap()), 3);
        assert_eq!(bytes[14], 0);
        assert_eq!(&bytes[15..], b"xyz");
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = Frame::control(5, &Control::Ack { status: AckStatus::Ok }, false).unwrap();
        let bytes = frame.to_bytes().unwrap();

        let mut buf = BytesMut::from(&bytes[..10]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[10..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert!(decoded.is_control());
        assert_eq!(
            decoded.control_message().unwrap(),
            Control::Ack { status: AckStatus::Ok }
        );
    }

    #[test]
    fn oversized_and_bad_frames_are_rejected() {
        let big = Frame::data(0, vec![0u8; MAX_FRAME_PAYLOAD + 1]);
        assert!(matches!(big.to_bytes(), Err(PvrtError::PayloadTooLarge { .. })));

        let mut header = BytesMut::new();
        header.put_slice(b"PF");
        header.put_u64_le(0);
        header.put_u32_le(MAX_FRAME_PAYLOAD as u32 + 1);
        header.put_u8(0);
        assert!(Frame::decode(&mut header).is_err());

        let mut junk = BytesMut::from(&b"XX0123456789abcdef"[..]);
        assert!(matches!(Frame::decode(&mut junk), Err(PvrtError::InvalidMagic { .. })));
    }

    #[test]
    fn preface_flags_and_fields() {
        let p = preface();
        let bytes = p.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"PVRT");
        assert_eq!(bytes[5], 0x01 | 0x04);
        assert_eq!(Preface::from_bytes(&bytes).unwrap(), p);

        let plain = Preface {
            psk: None,
            anchor: None,
            negotiate: false,
            binary_control: false,
            ..preface()
        };
        let bytes = plain.to_bytes().unwrap();
        assert_eq!(bytes[5], 0x02);
        assert_eq!(Preface::from_bytes(&bytes).unwrap(), plain);
    }

    #[test]
    fn preface_rejects_bad_channel() {
        let bad = Preface {
            channel_id: 2,
            ..preface()
        };
        let bytes = bad.to_bytes().unwrap();
        assert!(Preface::from_bytes(&bytes).is_err());
    }

    #[test]
    fn codec_yields_preface_then_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(WireItem::Preface(preface()), &mut buf).unwrap();
        codec.encode(Frame::data(0, &b"one"[..]), &mut buf).unwrap();
        codec.encode(Frame::data(1, &b"two"[..]), &mut buf).unwrap();

        let mut decoder = FrameCodec::new();
        // Byte-at-a-time delivery.
        let mut input = BytesMut::new();
        let mut items = Vec::new();
        for b in buf.iter() {
            input.put_u8(*b);
            while let Some(item) = decoder.decode(&mut input).unwrap() {
                items.push(item);
            }
        }
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], WireItem::Preface(preface()));
        assert_eq!(items[2], WireItem::Frame(Frame::data(1, &b"two"[..])));
    }

    #[test]
    fn parse_frames_rejects_trailing_bytes() {
        let mut buf = BytesMut::new();
        Frame::data(0, &b"a"[..]).encode_into(&mut buf).unwrap();
        Frame::data(1, &b"b"[..]).encode_into(&mut buf).unwrap();
        assert_eq!(parse_frames(&buf).unwrap().len(), 2);

        buf.put_u8(b'P');
        assert!(parse_frames(&buf).is_err());
    }
}
