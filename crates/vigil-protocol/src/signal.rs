//! The in-process signal channel.
//!
//! A [`SignalRequest`] is synthesised by the daemon's signal listener and
//! injected into the request router like any other message. It has a wire
//! form for uniformity, but nothing ever parses it off a socket: a signal
//! opcode arriving on a real connection is a protocol violation on every
//! channel.

use bytes::{BufMut, BytesMut};

use crate::wire::{self, Message, ProtocolError, RawFrame};

pub mod op {
    pub const SIGNAL_REQ: u8 = 0x40;
}

/// A delivered process signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRequest {
    pub signo: i32,
}

impl Message for SignalRequest {
    fn encode(&self, dst: &mut BytesMut) {
        wire::put_header(dst, 0, op::SIGNAL_REQ);
        dst.put_i32_le(self.signo);
    }

    fn decode(frame: RawFrame) -> Result<Self, ProtocolError> {
        let RawFrame { op, mut body, .. } = frame;
        if op != op::SIGNAL_REQ {
            return Err(ProtocolError::WrongOpCode { op });
        }
        Ok(Self {
            signo: wire::get_i32(&mut body)?,
        })
    }
}
