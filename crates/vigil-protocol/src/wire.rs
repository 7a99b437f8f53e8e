//! Frame layout and scalar encodings.
//!
//! All integers are little-endian. Strings are a `u32` byte length followed
//! by UTF-8 bytes, no terminator. Booleans are one byte, 0 or 1. Policy
//! types are `u16`. Frame payloads are bounded to keep a hostile peer from
//! forcing unbounded allocation.

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use vigil_core::types::{MonitorEntry, PolicyKey, PolicyResult, PolicyType, Timestamp};

/// Upper bound on a frame payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Size of the length prefix.
const LEN_PREFIX: usize = 4;

/// Errors from encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The opcode does not belong to this channel.
    #[error("wrong opcode 0x{op:02X} for this channel")]
    WrongOpCode { op: u8 },

    /// The payload ended before a field was complete.
    #[error("frame payload ended prematurely")]
    OutOfData,

    /// The frame violates the protocol in some other way.
    #[error("invalid protocol data: {reason}")]
    InvalidProtocol { reason: String },

    /// The declared payload length exceeds the bound.
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte bound")]
    FrameTooLarge { len: usize },

    /// Transport failure underneath the codec.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A decoded frame: sequence number, opcode, and the remaining field bytes.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub seq: u16,
    pub op: u8,
    pub body: Bytes,
}

/// A typed message that knows its wire form.
///
/// `encode` appends the full payload (sequence number, opcode, fields);
/// `decode` consumes a [`RawFrame`].
pub trait Message: Sized {
    fn encode(&self, dst: &mut BytesMut);
    fn decode(frame: RawFrame) -> Result<Self, ProtocolError>;
}

/// tokio-util codec decoding `In` frames and encoding `Out` frames.
///
/// The daemon instantiates it one way round, the client libraries the
/// other; both directions share the message enums.
#[derive(Debug, Default)]
pub struct Codec<In, Out> {
    _directions: PhantomData<fn(Out) -> In>,
}

impl<In, Out> Codec<In, Out> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _directions: PhantomData,
        }
    }
}

impl<In: Message, Out> Decoder for Codec<In, Out> {
    type Item = In;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, ProtocolError> {
        let Some(frame) = decode_raw(src)? else {
            return Ok(None);
        };
        In::decode(frame).map(Some)
    }
}

impl<In, Out: Message> Encoder<Out> for Codec<In, Out> {
    type Error = ProtocolError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut payload = BytesMut::new();
        item.encode(&mut payload);
        if payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len(),
            });
        }
        dst.reserve(LEN_PREFIX + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Pull one complete frame off the buffer, or `None` if more bytes are
/// needed.
pub fn decode_raw(src: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolError> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }
    let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len });
    }
    if src.len() < LEN_PREFIX + len {
        src.reserve(LEN_PREFIX + len - src.len());
        return Ok(None);
    }
    src.advance(LEN_PREFIX);
    let mut body = src.split_to(len).freeze();
    let seq = get_u16(&mut body)?;
    let op = get_u8(&mut body)?;
    Ok(Some(RawFrame { seq, op, body }))
}

/// Start a payload: sequence number then opcode.
pub fn put_header(dst: &mut BytesMut, seq: u16, op: u8) {
    dst.put_u16_le(seq);
    dst.put_u8(op);
}

// ── field readers ────────────────────────────────────────────────────

pub fn get_u8(src: &mut Bytes) -> Result<u8, ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::OutOfData);
    }
    Ok(src.get_u8())
}

pub fn get_u16(src: &mut Bytes) -> Result<u16, ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::OutOfData);
    }
    Ok(src.get_u16_le())
}

pub fn get_i32(src: &mut Bytes) -> Result<i32, ProtocolError> {
    if src.remaining() < 4 {
        return Err(ProtocolError::OutOfData);
    }
    Ok(src.get_i32_le())
}

pub fn get_i64(src: &mut Bytes) -> Result<i64, ProtocolError> {
    if src.remaining() < 8 {
        return Err(ProtocolError::OutOfData);
    }
    Ok(src.get_i64_le())
}

pub fn get_bool(src: &mut Bytes) -> Result<bool, ProtocolError> {
    match get_u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::InvalidProtocol {
            reason: format!("bad boolean byte 0x{other:02X}"),
        }),
    }
}

pub fn get_string(src: &mut Bytes) -> Result<String, ProtocolError> {
    let len = {
        if src.remaining() < 4 {
            return Err(ProtocolError::OutOfData);
        }
        src.get_u32_le() as usize
    };
    if src.remaining() < len {
        return Err(ProtocolError::OutOfData);
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidProtocol {
        reason: "string field is not UTF-8".to_owned(),
    })
}

pub fn get_policy_type(src: &mut Bytes) -> Result<PolicyType, ProtocolError> {
    Ok(PolicyType::new(get_u16(src)?))
}

pub fn get_policy_result(src: &mut Bytes) -> Result<PolicyResult, ProtocolError> {
    let policy_type = get_policy_type(src)?;
    let metadata = get_string(src)?;
    Ok(PolicyResult::new(policy_type, metadata))
}

pub fn get_policy_key(src: &mut Bytes) -> Result<PolicyKey, ProtocolError> {
    let client = get_string(src)?;
    let user = get_string(src)?;
    let privilege = get_string(src)?;
    PolicyKey::new(client, user, privilege).map_err(|err| ProtocolError::InvalidProtocol {
        reason: err.to_string(),
    })
}

pub fn get_monitor_entry(src: &mut Bytes) -> Result<MonitorEntry, ProtocolError> {
    let key = get_policy_key(src)?;
    let result = get_i64(src)?;
    let sec = get_i64(src)?;
    let nsec = get_i64(src)?;
    let result = u16::try_from(result).map_err(|_| ProtocolError::InvalidProtocol {
        reason: format!("monitor result {result} out of range"),
    })?;
    Ok(MonitorEntry::new(
        key,
        PolicyType::new(result),
        Timestamp { sec, nsec },
    ))
}

/// Read a `u16` element count and check it is plausible for the remaining
/// bytes, with `min_element_len` the smallest possible element encoding.
pub fn get_count(src: &mut Bytes, min_element_len: usize) -> Result<usize, ProtocolError> {
    let count = get_u16(src)? as usize;
    if count * min_element_len > src.remaining() {
        return Err(ProtocolError::OutOfData);
    }
    Ok(count)
}

// ── field writers ────────────────────────────────────────────────────

pub fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(u8::from(value));
}

pub fn put_string(dst: &mut BytesMut, value: &str) {
    dst.put_u32_le(value.len() as u32);
    dst.put_slice(value.as_bytes());
}

pub fn put_policy_type(dst: &mut BytesMut, value: PolicyType) {
    dst.put_u16_le(value.raw());
}

pub fn put_policy_result(dst: &mut BytesMut, value: &PolicyResult) {
    put_policy_type(dst, value.policy_type());
    put_string(dst, value.metadata());
}

pub fn put_policy_key(dst: &mut BytesMut, value: &PolicyKey) {
    put_string(dst, value.client());
    put_string(dst, value.user());
    put_string(dst, value.privilege());
}

pub fn put_monitor_entry(dst: &mut BytesMut, value: &MonitorEntry) {
    put_policy_key(dst, &value.key);
    dst.put_i64_le(i64::from(value.result.raw()));
    dst.put_i64_le(value.timestamp.sec);
    dst.put_i64_le(value.timestamp.nsec);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut payload = BytesMut::new();
        put_header(&mut payload, 7, 0x01);
        put_string(&mut payload, "hello");

        let mut framed = BytesMut::new();
        framed.put_u32_le(payload.len() as u32);
        framed.extend_from_slice(&payload);

        // Feed one byte at a time; only the final byte completes the frame.
        let mut buffer = BytesMut::new();
        let total = framed.len();
        for (fed, byte) in framed.iter().enumerate() {
            buffer.put_u8(*byte);
            let frame = decode_raw(&mut buffer).unwrap();
            if fed + 1 < total {
                assert!(frame.is_none(), "frame completed early at byte {fed}");
            } else {
                let frame = frame.unwrap();
                assert_eq!(frame.seq, 7);
                assert_eq!(frame.op, 0x01);
            }
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer_both_extract() {
        let mut buffer = BytesMut::new();
        for seq in [1u16, 2u16] {
            let mut payload = BytesMut::new();
            put_header(&mut payload, seq, 0x02);
            buffer.put_u32_le(payload.len() as u32);
            buffer.extend_from_slice(&payload);
        }
        assert_eq!(decode_raw(&mut buffer).unwrap().unwrap().seq, 1);
        assert_eq!(decode_raw(&mut buffer).unwrap().unwrap().seq, 2);
        assert!(decode_raw(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buffer = BytesMut::new();
        buffer.put_u32_le(u32::MAX);
        assert!(matches!(
            decode_raw(&mut buffer),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn string_round_trip_and_truncation() {
        let mut dst = BytesMut::new();
        put_string(&mut dst, "utf-8 ✓");
        let mut src = dst.freeze();
        assert_eq!(get_string(&mut src).unwrap(), "utf-8 ✓");

        let mut dst = BytesMut::new();
        dst.put_u32_le(10);
        dst.put_slice(b"short");
        assert!(matches!(
            get_string(&mut dst.freeze()),
            Err(ProtocolError::OutOfData)
        ));
    }

    #[test]
    fn bool_rejects_junk() {
        let mut src = Bytes::from_static(&[2]);
        assert!(matches!(
            get_bool(&mut src),
            Err(ProtocolError::InvalidProtocol { .. })
        ));
    }

    #[test]
    fn count_guard_rejects_impossible_counts() {
        let mut dst = BytesMut::new();
        dst.put_u16_le(u16::MAX);
        assert!(matches!(
            get_count(&mut dst.freeze(), 12), // nothing follows the count
            Err(ProtocolError::OutOfData)
        ));
    }

    #[test]
    fn key_with_empty_slot_is_a_protocol_error() {
        let mut dst = BytesMut::new();
        put_string(&mut dst, "");
        put_string(&mut dst, "u");
        put_string(&mut dst, "p");
        assert!(matches!(
            get_policy_key(&mut dst.freeze()),
            Err(ProtocolError::InvalidProtocol { .. })
        ));
    }
}
