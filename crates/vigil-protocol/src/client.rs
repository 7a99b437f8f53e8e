//! The client channel: check, simple-check, cancel, and the monitor-entry
//! upload used by remote monitor producers.

use bytes::BytesMut;

use vigil_core::types::{MonitorEntry, PolicyKey, PolicyResult};

use crate::wire::{self, Message, ProtocolError, RawFrame};

pub mod op {
    pub const CHECK_REQ: u8 = 0x01;
    pub const CANCEL_REQ: u8 = 0x02;
    pub const SIMPLE_CHECK_REQ: u8 = 0x03;
    pub const MONITOR_ENTRIES_PUT: u8 = 0x04;
    pub const CHECK_RESP: u8 = 0x81;
    pub const CANCEL_RESP: u8 = 0x82;
    pub const SIMPLE_CHECK_RESP: u8 = 0x83;
}

/// Requests a checker connection may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Full check; may suspend on an agent.
    Check { seq: u16, key: PolicyKey },
    /// Check that never suspends; unresolvable plugin results surface as a
    /// not-resolved code instead.
    SimpleCheck { seq: u16, key: PolicyKey },
    /// Cancel an in-flight check by its sequence number.
    Cancel { seq: u16 },
    /// Batch upload of externally produced monitor entries.
    MonitorEntriesPut {
        seq: u16,
        entries: Vec<MonitorEntry>,
    },
}

impl ClientRequest {
    #[must_use]
    pub const fn seq(&self) -> u16 {
        match self {
            Self::Check { seq, .. }
            | Self::SimpleCheck { seq, .. }
            | Self::Cancel { seq }
            | Self::MonitorEntriesPut { seq, .. } => *seq,
        }
    }
}

impl Message for ClientRequest {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Check { seq, key } => {
                wire::put_header(dst, *seq, op::CHECK_REQ);
                wire::put_policy_key(dst, key);
            }
            Self::SimpleCheck { seq, key } => {
                wire::put_header(dst, *seq, op::SIMPLE_CHECK_REQ);
                wire::put_policy_key(dst, key);
            }
            Self::Cancel { seq } => {
                wire::put_header(dst, *seq, op::CANCEL_REQ);
            }
            Self::MonitorEntriesPut { seq, entries } => {
                wire::put_header(dst, *seq, op::MONITOR_ENTRIES_PUT);
                dst.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                for entry in entries {
                    wire::put_monitor_entry(dst, entry);
                }
            }
        }
    }

    fn decode(frame: RawFrame) -> Result<Self, ProtocolError> {
        let RawFrame { seq, op, mut body } = frame;
        match op {
            op::CHECK_REQ => Ok(Self::Check {
                seq,
                key: wire::get_policy_key(&mut body)?,
            }),
            op::SIMPLE_CHECK_REQ => Ok(Self::SimpleCheck {
                seq,
                key: wire::get_policy_key(&mut body)?,
            }),
            op::CANCEL_REQ => Ok(Self::Cancel { seq }),
            op::MONITOR_ENTRIES_PUT => {
                // Smallest entry: three 1-byte strings + three i64 fields.
                let count = wire::get_count(&mut body, 3 * 5 + 3 * 8)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(wire::get_monitor_entry(&mut body)?);
                }
                Ok(Self::MonitorEntriesPut { seq, entries })
            }
            other => Err(ProtocolError::WrongOpCode { op: other }),
        }
    }
}

/// Responses the daemon sends on a checker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientResponse {
    Check { seq: u16, result: PolicyResult },
    SimpleCheck {
        seq: u16,
        /// An [`vigil_core::ApiCode`] raw value; not-resolved when an agent
        /// would have been needed.
        code: i32,
        result: PolicyResult,
    },
    Cancel { seq: u16 },
}

impl ClientResponse {
    #[must_use]
    pub const fn seq(&self) -> u16 {
        match self {
            Self::Check { seq, .. } | Self::SimpleCheck { seq, .. } | Self::Cancel { seq } => *seq,
        }
    }
}

impl Message for ClientResponse {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Check { seq, result } => {
                wire::put_header(dst, *seq, op::CHECK_RESP);
                wire::put_policy_result(dst, result);
            }
            Self::SimpleCheck { seq, code, result } => {
                wire::put_header(dst, *seq, op::SIMPLE_CHECK_RESP);
                dst.extend_from_slice(&code.to_le_bytes());
                wire::put_policy_result(dst, result);
            }
            Self::Cancel { seq } => {
                wire::put_header(dst, *seq, op::CANCEL_RESP);
            }
        }
    }

    fn decode(frame: RawFrame) -> Result<Self, ProtocolError> {
        let RawFrame { seq, op, mut body } = frame;
        match op {
            op::CHECK_RESP => Ok(Self::Check {
                seq,
                result: wire::get_policy_result(&mut body)?,
            }),
            op::SIMPLE_CHECK_RESP => Ok(Self::SimpleCheck {
                seq,
                code: wire::get_i32(&mut body)?,
                result: wire::get_policy_result(&mut body)?,
            }),
            op::CANCEL_RESP => Ok(Self::Cancel { seq }),
            other => Err(ProtocolError::WrongOpCode { op: other }),
        }
    }
}
