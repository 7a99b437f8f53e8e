//! The admin channel: policy mutation, admin checks, enumeration, and the
//! monitor-get operations multiplexed over the same socket.

use bytes::{BufMut, BytesMut};

use vigil_core::types::{MonitorEntry, Policy, PolicyKey, PolicyResult};
use vigil_core::{OperationCode, PolicyDescription};

use crate::monitor;
use crate::wire::{self, Message, ProtocolError, RawFrame};

pub mod op {
    pub const ADMIN_CHECK_REQ: u8 = 0x10;
    pub const INSERT_OR_UPDATE_BUCKET_REQ: u8 = 0x11;
    pub const REMOVE_BUCKET_REQ: u8 = 0x12;
    pub const SET_POLICIES_REQ: u8 = 0x13;
    pub const LIST_REQ: u8 = 0x14;
    pub const ERASE_REQ: u8 = 0x15;
    pub const DESCRIPTION_LIST_REQ: u8 = 0x16;
    pub const ADMIN_CHECK_RESP: u8 = 0x90;
    pub const CODE_RESP: u8 = 0x91;
    pub const LIST_RESP: u8 = 0x92;
    pub const DESCRIPTION_LIST_RESP: u8 = 0x93;
}

/// One bucket's worth of policies to insert in a set-policies batch.
pub type InsertGroup = (String, Vec<Policy>);
/// One bucket's worth of keys to remove in a set-policies batch.
pub type RemoveGroup = (String, Vec<PolicyKey>);

/// Requests an admin connection may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRequest {
    AdminCheck {
        seq: u16,
        bucket: String,
        recursive: bool,
        key: PolicyKey,
    },
    InsertOrUpdateBucket {
        seq: u16,
        bucket: String,
        default: PolicyResult,
    },
    RemoveBucket { seq: u16, bucket: String },
    /// One atomic batch of inserts and removals.
    SetPolicies {
        seq: u16,
        insert: Vec<InsertGroup>,
        remove: Vec<RemoveGroup>,
    },
    List {
        seq: u16,
        bucket: String,
        filter: PolicyKey,
    },
    Erase {
        seq: u16,
        start_bucket: String,
        recursive: bool,
        filter: PolicyKey,
    },
    DescriptionList { seq: u16 },
    /// Monitor channel: register for `buffer_size` future entries.
    MonitorGetEntries { seq: u16, buffer_size: u16 },
    /// Monitor channel: deliver whatever accumulated and unsubscribe.
    MonitorGetFlush { seq: u16 },
}

impl AdminRequest {
    #[must_use]
    pub const fn seq(&self) -> u16 {
        match self {
            Self::AdminCheck { seq, .. }
            | Self::InsertOrUpdateBucket { seq, .. }
            | Self::RemoveBucket { seq, .. }
            | Self::SetPolicies { seq, .. }
            | Self::List { seq, .. }
            | Self::Erase { seq, .. }
            | Self::DescriptionList { seq }
            | Self::MonitorGetEntries { seq, .. }
            | Self::MonitorGetFlush { seq } => *seq,
        }
    }
}

impl Message for AdminRequest {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::AdminCheck {
                seq,
                bucket,
                recursive,
                key,
            } => {
                wire::put_header(dst, *seq, op::ADMIN_CHECK_REQ);
                wire::put_string(dst, bucket);
                wire::put_bool(dst, *recursive);
                wire::put_policy_key(dst, key);
            }
            Self::InsertOrUpdateBucket {
                seq,
                bucket,
                default,
            } => {
                wire::put_header(dst, *seq, op::INSERT_OR_UPDATE_BUCKET_REQ);
                wire::put_string(dst, bucket);
                wire::put_policy_result(dst, default);
            }
            Self::RemoveBucket { seq, bucket } => {
                wire::put_header(dst, *seq, op::REMOVE_BUCKET_REQ);
                wire::put_string(dst, bucket);
            }
            Self::SetPolicies { seq, insert, remove } => {
                wire::put_header(dst, *seq, op::SET_POLICIES_REQ);
                dst.put_u16_le(insert.len() as u16);
                for (bucket, policies) in insert {
                    wire::put_string(dst, bucket);
                    dst.put_u16_le(policies.len() as u16);
                    for policy in policies {
                        wire::put_policy_key(dst, &policy.key);
                        wire::put_policy_result(dst, &policy.result);
                    }
                }
                dst.put_u16_le(remove.len() as u16);
                for (bucket, keys) in remove {
                    wire::put_string(dst, bucket);
                    dst.put_u16_le(keys.len() as u16);
                    for key in keys {
                        wire::put_policy_key(dst, key);
                    }
                }
            }
            Self::List {
                seq,
                bucket,
                filter,
            } => {
                wire::put_header(dst, *seq, op::LIST_REQ);
                wire::put_string(dst, bucket);
                wire::put_policy_key(dst, filter);
            }
            Self::Erase {
                seq,
                start_bucket,
                recursive,
                filter,
            } => {
                wire::put_header(dst, *seq, op::ERASE_REQ);
                wire::put_string(dst, start_bucket);
                wire::put_bool(dst, *recursive);
                wire::put_policy_key(dst, filter);
            }
            Self::DescriptionList { seq } => {
                wire::put_header(dst, *seq, op::DESCRIPTION_LIST_REQ);
            }
            Self::MonitorGetEntries { seq, buffer_size } => {
                wire::put_header(dst, *seq, monitor::op::GET_ENTRIES_REQ);
                dst.put_u16_le(*buffer_size);
            }
            Self::MonitorGetFlush { seq } => {
                wire::put_header(dst, *seq, monitor::op::GET_FLUSH_REQ);
            }
        }
    }

    fn decode(frame: RawFrame) -> Result<Self, ProtocolError> {
        let RawFrame { seq, op, mut body } = frame;
        match op {
            op::ADMIN_CHECK_REQ => Ok(Self::AdminCheck {
                seq,
                bucket: wire::get_string(&mut body)?,
                recursive: wire::get_bool(&mut body)?,
                key: wire::get_policy_key(&mut body)?,
            }),
            op::INSERT_OR_UPDATE_BUCKET_REQ => Ok(Self::InsertOrUpdateBucket {
                seq,
                bucket: wire::get_string(&mut body)?,
                default: wire::get_policy_result(&mut body)?,
            }),
            op::REMOVE_BUCKET_REQ => Ok(Self::RemoveBucket {
                seq,
                bucket: wire::get_string(&mut body)?,
            }),
            op::SET_POLICIES_REQ => {
                let group_count = wire::get_count(&mut body, 4)?;
                let mut insert = Vec::with_capacity(group_count);
                for _ in 0..group_count {
                    let bucket = wire::get_string(&mut body)?;
                    let policy_count = wire::get_count(&mut body, 3 * 5 + 2 + 4)?;
                    let mut policies = Vec::with_capacity(policy_count);
                    for _ in 0..policy_count {
                        let key = wire::get_policy_key(&mut body)?;
                        let result = wire::get_policy_result(&mut body)?;
                        policies.push(Policy::new(key, result));
                    }
                    insert.push((bucket, policies));
                }
                let group_count = wire::get_count(&mut body, 4)?;
                let mut remove = Vec::with_capacity(group_count);
                for _ in 0..group_count {
                    let bucket = wire::get_string(&mut body)?;
                    let key_count = wire::get_count(&mut body, 3 * 5)?;
                    let mut keys = Vec::with_capacity(key_count);
                    for _ in 0..key_count {
                        keys.push(wire::get_policy_key(&mut body)?);
                    }
                    remove.push((bucket, keys));
                }
                Ok(Self::SetPolicies { seq, insert, remove })
            }
            op::LIST_REQ => Ok(Self::List {
                seq,
                bucket: wire::get_string(&mut body)?,
                filter: wire::get_policy_key(&mut body)?,
            }),
            op::ERASE_REQ => Ok(Self::Erase {
                seq,
                start_bucket: wire::get_string(&mut body)?,
                recursive: wire::get_bool(&mut body)?,
                filter: wire::get_policy_key(&mut body)?,
            }),
            op::DESCRIPTION_LIST_REQ => Ok(Self::DescriptionList { seq }),
            monitor::op::GET_ENTRIES_REQ => Ok(Self::MonitorGetEntries {
                seq,
                buffer_size: wire::get_u16(&mut body)?,
            }),
            monitor::op::GET_FLUSH_REQ => Ok(Self::MonitorGetFlush { seq }),
            other => Err(ProtocolError::WrongOpCode { op: other }),
        }
    }
}

/// Responses the daemon sends on an admin connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminResponse {
    AdminCheck {
        seq: u16,
        result: PolicyResult,
        bucket_valid: bool,
        db_corrupted: bool,
    },
    /// Outcome of a mutation.
    Code { seq: u16, code: OperationCode },
    List {
        seq: u16,
        policies: Vec<Policy>,
        bucket_valid: bool,
        db_corrupted: bool,
    },
    DescriptionList {
        seq: u16,
        descriptions: Vec<PolicyDescription>,
        db_corrupted: bool,
    },
    MonitorGetEntries {
        seq: u16,
        entries: Vec<MonitorEntry>,
    },
}

impl AdminResponse {
    #[must_use]
    pub const fn seq(&self) -> u16 {
        match self {
            Self::AdminCheck { seq, .. }
            | Self::Code { seq, .. }
            | Self::List { seq, .. }
            | Self::DescriptionList { seq, .. }
            | Self::MonitorGetEntries { seq, .. } => *seq,
        }
    }
}

impl Message for AdminResponse {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::AdminCheck {
                seq,
                result,
                bucket_valid,
                db_corrupted,
            } => {
                wire::put_header(dst, *seq, op::ADMIN_CHECK_RESP);
                wire::put_policy_result(dst, result);
                wire::put_bool(dst, *bucket_valid);
                wire::put_bool(dst, *db_corrupted);
            }
            Self::Code { seq, code } => {
                wire::put_header(dst, *seq, op::CODE_RESP);
                dst.put_u16_le(code.raw());
            }
            Self::List {
                seq,
                policies,
                bucket_valid,
                db_corrupted,
            } => {
                wire::put_header(dst, *seq, op::LIST_RESP);
                dst.put_u16_le(policies.len() as u16);
                for policy in policies {
                    wire::put_policy_key(dst, &policy.key);
                    wire::put_policy_result(dst, &policy.result);
                }
                wire::put_bool(dst, *bucket_valid);
                wire::put_bool(dst, *db_corrupted);
            }
            Self::DescriptionList {
                seq,
                descriptions,
                db_corrupted,
            } => {
                wire::put_header(dst, *seq, op::DESCRIPTION_LIST_RESP);
                dst.put_u16_le(descriptions.len() as u16);
                for description in descriptions {
                    wire::put_policy_type(dst, description.policy_type);
                    wire::put_string(dst, &description.name);
                }
                wire::put_bool(dst, *db_corrupted);
            }
            Self::MonitorGetEntries { seq, entries } => {
                wire::put_header(dst, *seq, monitor::op::GET_ENTRIES_RESP);
                dst.put_u16_le(entries.len() as u16);
                for entry in entries {
                    wire::put_monitor_entry(dst, entry);
                }
            }
        }
    }

    fn decode(frame: RawFrame) -> Result<Self, ProtocolError> {
        let RawFrame { seq, op, mut body } = frame;
        match op {
            op::ADMIN_CHECK_RESP => Ok(Self::AdminCheck {
                seq,
                result: wire::get_policy_result(&mut body)?,
                bucket_valid: wire::get_bool(&mut body)?,
                db_corrupted: wire::get_bool(&mut body)?,
            }),
            op::CODE_RESP => Ok(Self::Code {
                seq,
                code: OperationCode::from_raw(wire::get_u16(&mut body)?),
            }),
            op::LIST_RESP => {
                let count = wire::get_count(&mut body, 3 * 5 + 2 + 4)?;
                let mut policies = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = wire::get_policy_key(&mut body)?;
                    let result = wire::get_policy_result(&mut body)?;
                    policies.push(Policy::new(key, result));
                }
                Ok(Self::List {
                    seq,
                    policies,
                    bucket_valid: wire::get_bool(&mut body)?,
                    db_corrupted: wire::get_bool(&mut body)?,
                })
            }
            op::DESCRIPTION_LIST_RESP => {
                let count = wire::get_count(&mut body, 2 + 4)?;
                let mut descriptions = Vec::with_capacity(count);
                for _ in 0..count {
                    let policy_type = wire::get_policy_type(&mut body)?;
                    let name = wire::get_string(&mut body)?;
                    descriptions.push(PolicyDescription::new(policy_type, name));
                }
                Ok(Self::DescriptionList {
                    seq,
                    descriptions,
                    db_corrupted: wire::get_bool(&mut body)?,
                })
            }
            monitor::op::GET_ENTRIES_RESP => {
                let count = wire::get_count(&mut body, 3 * 5 + 3 * 8)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(wire::get_monitor_entry(&mut body)?);
                }
                Ok(Self::MonitorGetEntries { seq, entries })
            }
            other => Err(ProtocolError::WrongOpCode { op: other }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};
    use vigil_core::types::PolicyType;

    use crate::{AdminServerCodec, AdminSideCodec};

    fn key(c: &str, u: &str, p: &str) -> PolicyKey {
        PolicyKey::new(c, u, p).unwrap()
    }

    fn round_trip_request(request: AdminRequest) -> AdminRequest {
        let mut side = AdminSideCodec::new();
        let mut server = AdminServerCodec::new();
        let mut buffer = BytesMut::new();
        side.encode(request, &mut buffer).unwrap();
        server.decode(&mut buffer).unwrap().unwrap()
    }

    fn round_trip_response(response: AdminResponse) -> AdminResponse {
        let mut side = AdminSideCodec::new();
        let mut server = AdminServerCodec::new();
        let mut buffer = BytesMut::new();
        server.encode(response, &mut buffer).unwrap();
        side.decode(&mut buffer).unwrap().unwrap()
    }

    #[test]
    fn set_policies_round_trips() {
        let sent = AdminRequest::SetPolicies {
            seq: 5,
            insert: vec![(
                String::new(),
                vec![
                    Policy::new(key("app", "*", "net"), PolicyResult::allow()),
                    Policy::new(key("app", "alice", "gps"), PolicyResult::bucket("extra")),
                ],
            )],
            remove: vec![("extra".to_owned(), vec![key("app", "bob", "net")])],
        };
        assert_eq!(round_trip_request(sent.clone()), sent);
    }

    #[test]
    fn admin_check_round_trips() {
        let sent = AdminRequest::AdminCheck {
            seq: 1,
            bucket: "extra".to_owned(),
            recursive: true,
            key: key("app", "alice", "net"),
        };
        assert_eq!(round_trip_request(sent.clone()), sent);
    }

    #[test]
    fn monitor_ops_share_the_admin_codec() {
        let sent = AdminRequest::MonitorGetEntries {
            seq: 2,
            buffer_size: 16,
        };
        assert_eq!(round_trip_request(sent.clone()), sent);
        assert_eq!(
            round_trip_request(AdminRequest::MonitorGetFlush { seq: 3 }),
            AdminRequest::MonitorGetFlush { seq: 3 }
        );
    }

    #[test]
    fn list_response_round_trips() {
        let sent = AdminResponse::List {
            seq: 4,
            policies: vec![Policy::new(
                key("app", "*", "net"),
                PolicyResult::new(PolicyType::new(0x0A), "payload"),
            )],
            bucket_valid: true,
            db_corrupted: false,
        };
        assert_eq!(round_trip_response(sent.clone()), sent);
    }

    #[test]
    fn description_list_response_round_trips() {
        let sent = AdminResponse::DescriptionList {
            seq: 6,
            descriptions: vec![
                PolicyDescription::new(PolicyType::DENY, "Deny"),
                PolicyDescription::new(PolicyType::new(0x0A), "AskUser"),
            ],
            db_corrupted: true,
        };
        assert_eq!(round_trip_response(sent.clone()), sent);
    }

    #[test]
    fn client_opcode_on_admin_channel_is_rejected() {
        let mut buffer = BytesMut::new();
        let mut client_side = crate::ClientSideCodec::new();
        client_side
            .encode(
                crate::ClientRequest::Check {
                    seq: 1,
                    key: key("a", "b", "c"),
                },
                &mut buffer,
            )
            .unwrap();

        let mut admin_server = AdminServerCodec::new();
        assert!(matches!(
            admin_server.decode(&mut buffer),
            Err(ProtocolError::WrongOpCode { .. })
        ));
    }

    #[test]
    fn truncated_set_policies_is_out_of_data() {
        let sent = AdminRequest::SetPolicies {
            seq: 5,
            insert: vec![(
                "b".to_owned(),
                vec![Policy::new(key("a", "b", "c"), PolicyResult::allow())],
            )],
            remove: vec![],
        };
        let mut side = AdminSideCodec::new();
        let mut buffer = BytesMut::new();
        side.encode(sent, &mut buffer).unwrap();

        // Chop the tail off the frame and fix up the length prefix.
        let truncated_len = buffer.len() - 6;
        let mut corrupt = BytesMut::from(&buffer[..truncated_len]);
        let payload_len = (truncated_len - 4) as u32;
        corrupt[..4].copy_from_slice(&payload_len.to_le_bytes());

        let mut server = AdminServerCodec::new();
        assert!(matches!(
            server.decode(&mut corrupt),
            Err(ProtocolError::OutOfData)
        ));
    }
}
