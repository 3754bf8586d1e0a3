//! Length-prefixed framing codec and the small string sub-encoding used
//! throughout the wire protocol (§4.1, §6).
//!
//! A frame is `u32 length` (big-endian, excluding the length field itself)
//! followed by `length` bytes of payload whose first byte is the opcode.
//! A protocol string is `u32 length || raw bytes`.

use crate::error::CoreError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// 10 KiB: the gatekeeper never needs more than a login/ping/control frame.
pub const MAX_FRAME_GATEKEEPER: usize = 10 * 1024;

/// 1 GiB: workers carry arbitrary plugin payloads.
pub const MAX_FRAME_WORKER: usize = 1024 * 1024 * 1024;

/// Opcodes observed on the client↔server wire (§6) and the gatekeeper↔worker
/// control plane (§4.11). Kept as plain byte constants, matched on directly
/// by session dispatch code, rather than an enum with a fallible conversion —
/// unrecognized opcodes are a normal, expected protocol-violation case (§7),
/// not a decoding error.
pub mod opcode {
    pub const CHALLENGE: u8 = b'C';
    pub const LOGIN_FAILURE: u8 = b'F';
    pub const LOGIN: u8 = b'L';
    pub const HELLO: u8 = b'H';
    pub const SESSION_COOKIE: u8 = b'S';
    pub const PING: u8 = b'P';
    pub const PONG: u8 = b'p';
    pub const ROUTED: u8 = b'R';
    pub const VERSIONS: u8 = b'V';
    pub const ACTIVATION: u8 = b'A';

    /// Gatekeeper → worker: client handoff envelope.
    pub const HANDOFF: u8 = b'l';
    /// Worker → gatekeeper: subscribe to a global timer.
    pub const TIMER_SUBSCRIBE: u8 = b'T';
    /// Gatekeeper → worker: a global timer tick.
    pub const TIMER_TICK: u8 = b't';
}

/// A `Decoder`/`Encoder` pair for the length-prefixed frame format, with a
/// role-specific maximum length (10 KiB gatekeeper, 1 GiB worker — §4.1).
pub struct FrameCodec {
    max_len: usize,
}

impl FrameCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    pub fn gatekeeper() -> Self {
        Self::new(MAX_FRAME_GATEKEEPER)
    }

    pub fn worker() -> Self {
        Self::new(MAX_FRAME_WORKER)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CoreError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if len > self.max_len {
            return Err(CoreError::FrameTooLarge {
                limit: self.max_len,
                actual: len,
            });
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CoreError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CoreError> {
        if item.len() > self.max_len {
            return Err(CoreError::FrameTooLarge {
                limit: self.max_len,
                actual: item.len(),
            });
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

/// Encode a protocol string: `u32 length || raw bytes`.
pub fn format_string(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + s.len());
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s);
    out
}

/// Build a plugin-routed frame payload: `'R' || u32(|name|) || name || payload`
/// (§4.7). This is the only place a plugin-bound frame's wire shape is
/// assembled, so every caller (the router, plugins replying via `send`)
/// produces byte-identical output.
pub fn routed_payload(plugin_name: &str, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(1 + 4 + plugin_name.len() + payload.len());
    out.push(opcode::ROUTED);
    out.extend_from_slice(&format_string(plugin_name.as_bytes()));
    out.extend_from_slice(payload);
    Bytes::from(out)
}

/// Decode a leading protocol string, returning `(value, rest)`.
pub fn extract_string(buf: &[u8]) -> Result<(&[u8], &[u8]), CoreError> {
    if buf.len() < 4 {
        return Err(CoreError::ProtocolViolation(
            "truncated string length prefix".into(),
        ));
    }
    let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
    let rest = &buf[4..];
    if rest.len() < len {
        return Err(CoreError::ProtocolViolation(
            "truncated string payload".into(),
        ));
    }
    Ok((&rest[..len], &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips() {
        let encoded = format_string(b"0123456789ABCDEF");
        let (value, rest) = extract_string(&encoded).unwrap();
        assert_eq!(value, b"0123456789ABCDEF");
        assert!(rest.is_empty());
    }

    #[test]
    fn extract_string_rejects_truncated_payload() {
        let mut encoded = format_string(b"hello");
        encoded.truncate(encoded.len() - 2);
        assert!(extract_string(&encoded).is_err());
    }

    #[test]
    fn codec_round_trips_a_frame() {
        let mut codec = FrameCodec::worker();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"Phello"), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"Phello");
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_more_bytes_on_partial_frame() {
        let mut codec = FrameCodec::worker();
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"abc"); // only 3 of 10 payload bytes present
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn gatekeeper_codec_rejects_oversized_frame() {
        let mut codec = FrameCodec::gatekeeper();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_GATEKEEPER + 1) as u32);
        let err = codec.decode(&mut buf).unwrap_err();
        match err {
            CoreError::FrameTooLarge { limit, actual } => {
                assert_eq!(limit, MAX_FRAME_GATEKEEPER);
                assert_eq!(actual, MAX_FRAME_GATEKEEPER + 1);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }
}
