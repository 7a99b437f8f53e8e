//! The agent channel: registration and the query/answer exchange backing
//! non-terminal policy types.

use bytes::BytesMut;

use crate::wire::{self, Message, ProtocolError, RawFrame};

pub mod op {
    pub const REGISTER_REQ: u8 = 0x20;
    pub const ACTION_REQ: u8 = 0x21;
    pub const REGISTER_RESP: u8 = 0xA0;
    pub const ACTION_PUSH: u8 = 0xA1;
}

/// Sub-tag of an agent action message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentAction {
    /// A query or an answer carrying a payload.
    Action = 0,
    /// Cancellation of an earlier query.
    Cancel = 1,
}

impl AgentAction {
    fn from_raw(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(Self::Action),
            1 => Ok(Self::Cancel),
            other => Err(ProtocolError::InvalidProtocol {
                reason: format!("bad agent action tag 0x{other:02X}"),
            }),
        }
    }
}

/// Outcome of an agent registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegisterCode {
    Done = 0,
    /// Another connection already owns the agent type.
    Rejected = 1,
    Error = 2,
}

impl RegisterCode {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Done,
            1 => Self::Rejected,
            _ => Self::Error,
        }
    }
}

/// Messages an agent sends to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    /// Claim an agent type. One connection per type.
    Register { seq: u16, agent_type: String },
    /// Answer (or acknowledge cancellation of) the query identified by
    /// `seq`.
    Action {
        seq: u16,
        action: AgentAction,
        payload: String,
    },
}

impl Message for AgentRequest {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Register { seq, agent_type } => {
                wire::put_header(dst, *seq, op::REGISTER_REQ);
                wire::put_string(dst, agent_type);
            }
            Self::Action {
                seq,
                action,
                payload,
            } => {
                wire::put_header(dst, *seq, op::ACTION_REQ);
                dst.extend_from_slice(&[*action as u8]);
                wire::put_string(dst, payload);
            }
        }
    }

    fn decode(frame: RawFrame) -> Result<Self, ProtocolError> {
        let RawFrame { seq, op, mut body } = frame;
        match op {
            op::REGISTER_REQ => Ok(Self::Register {
                seq,
                agent_type: wire::get_string(&mut body)?,
            }),
            op::ACTION_REQ => Ok(Self::Action {
                seq,
                action: AgentAction::from_raw(wire::get_u8(&mut body)?)?,
                payload: wire::get_string(&mut body)?,
            }),
            other => Err(ProtocolError::WrongOpCode { op: other }),
        }
    }
}

/// Messages the daemon sends to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Register { seq: u16, code: RegisterCode },
    /// A query (`Action`) or cancellation (`Cancel`) pushed to the agent;
    /// `seq` identifies the query in the agent's replies.
    ActionPush {
        seq: u16,
        action: AgentAction,
        payload: String,
    },
}

impl Message for AgentResponse {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Register { seq, code } => {
                wire::put_header(dst, *seq, op::REGISTER_RESP);
                dst.extend_from_slice(&[*code as u8]);
            }
            Self::ActionPush {
                seq,
                action,
                payload,
            } => {
                wire::put_header(dst, *seq, op::ACTION_PUSH);
                dst.extend_from_slice(&[*action as u8]);
                wire::put_string(dst, payload);
            }
        }
    }

    fn decode(frame: RawFrame) -> Result<Self, ProtocolError> {
        let RawFrame { seq, op, mut body } = frame;
        match op {
            op::REGISTER_RESP => Ok(Self::Register {
                seq,
                code: RegisterCode::from_raw(wire::get_u8(&mut body)?),
            }),
            op::ACTION_PUSH => Ok(Self::ActionPush {
                seq,
                action: AgentAction::from_raw(wire::get_u8(&mut body)?)?,
                payload: wire::get_string(&mut body)?,
            }),
            other => Err(ProtocolError::WrongOpCode { op: other }),
        }
    }
}
