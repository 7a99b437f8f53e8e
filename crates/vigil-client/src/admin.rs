//! The blocking admin client used by tooling (and the monitor channel it
//! multiplexes).

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use bytes::BytesMut;
use tracing::debug;

use vigil_core::types::{MonitorEntry, Policy, PolicyKey, PolicyResult};
use vigil_core::{OperationCode, PolicyDescription};
use vigil_protocol::wire::{self, Message};
use vigil_protocol::{AdminRequest, AdminResponse};

use crate::error::ClientError;

/// Outcome of an admin check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCheckOutcome {
    pub result: PolicyResult,
    /// False when the start bucket does not exist.
    pub bucket_valid: bool,
    /// True while the daemon's database-corrupted latch is set.
    pub db_corrupted: bool,
}

/// A blocking connection to the daemon's admin socket.
pub struct AdminClient {
    stream: UnixStream,
    read_buf: BytesMut,
    next_seq: u16,
}

impl AdminClient {
    /// Connect to the admin socket (root-only by its permissions).
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path.as_ref())
            .map_err(|_| ClientError::ServiceNotAvailable)?;
        Ok(Self {
            stream,
            read_buf: BytesMut::new(),
            next_seq: 0,
        })
    }

    /// Create a bucket or replace its default result.
    pub fn set_bucket(&mut self, bucket: &str, default: PolicyResult) -> Result<(), ClientError> {
        let seq = self.take_seq();
        let response = self.round_trip(&AdminRequest::InsertOrUpdateBucket {
            seq,
            bucket: bucket.to_owned(),
            default,
        })?;
        expect_code(response, seq)
    }

    /// Delete a bucket, cascading the removal of links to it.
    pub fn delete_bucket(&mut self, bucket: &str) -> Result<(), ClientError> {
        let seq = self.take_seq();
        let response = self.round_trip(&AdminRequest::RemoveBucket {
            seq,
            bucket: bucket.to_owned(),
        })?;
        expect_code(response, seq)
    }

    /// Apply one atomic batch of policy inserts and removals.
    pub fn set_policies(
        &mut self,
        insert: BTreeMap<String, Vec<Policy>>,
        remove: BTreeMap<String, Vec<PolicyKey>>,
    ) -> Result<(), ClientError> {
        let seq = self.take_seq();
        let response = self.round_trip(&AdminRequest::SetPolicies {
            seq,
            insert: insert.into_iter().collect(),
            remove: remove.into_iter().collect(),
        })?;
        expect_code(response, seq)
    }

    /// Erase policies matching `filter` from `start_bucket` (recursively
    /// through links when asked).
    pub fn erase(
        &mut self,
        start_bucket: &str,
        recursive: bool,
        filter: PolicyKey,
    ) -> Result<(), ClientError> {
        let seq = self.take_seq();
        let response = self.round_trip(&AdminRequest::Erase {
            seq,
            start_bucket: start_bucket.to_owned(),
            recursive,
            filter,
        })?;
        expect_code(response, seq)
    }

    /// Evaluate a key the way the daemon would, with admin-only visibility
    /// into bucket validity and the corruption latch.
    pub fn admin_check(
        &mut self,
        bucket: &str,
        recursive: bool,
        key: PolicyKey,
    ) -> Result<AdminCheckOutcome, ClientError> {
        let seq = self.take_seq();
        let response = self.round_trip(&AdminRequest::AdminCheck {
            seq,
            bucket: bucket.to_owned(),
            recursive,
            key,
        })?;
        match response {
            AdminResponse::AdminCheck {
                result,
                bucket_valid,
                db_corrupted,
                ..
            } => Ok(AdminCheckOutcome {
                result,
                bucket_valid,
                db_corrupted,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// List the policies of one bucket passing `filter` (the any-marker
    /// matches both literals and wildcards).
    pub fn list_policies(
        &mut self,
        bucket: &str,
        filter: PolicyKey,
    ) -> Result<Vec<Policy>, ClientError> {
        let seq = self.take_seq();
        let response = self.round_trip(&AdminRequest::List {
            seq,
            bucket: bucket.to_owned(),
            filter,
        })?;
        match response {
            AdminResponse::List {
                policies,
                bucket_valid: true,
                ..
            } => Ok(policies),
            AdminResponse::List {
                bucket_valid: false,
                db_corrupted,
                ..
            } => Err(ClientError::Operation {
                code: if db_corrupted {
                    OperationCode::DbCorrupted
                } else {
                    OperationCode::NoBucket
                },
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Descriptions of every policy type the daemon knows.
    pub fn list_descriptions(&mut self) -> Result<Vec<PolicyDescription>, ClientError> {
        let seq = self.take_seq();
        let response = self.round_trip(&AdminRequest::DescriptionList { seq })?;
        match response {
            AdminResponse::DescriptionList { descriptions, .. } => Ok(descriptions),
            other => Err(unexpected(&other)),
        }
    }

    /// Subscribe for `buffer_size` future decision records and block until
    /// they arrive (or `timeout` elapses).
    pub fn monitor_get_entries(
        &mut self,
        buffer_size: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<MonitorEntry>, ClientError> {
        let seq = self.take_seq();
        self.send(&AdminRequest::MonitorGetEntries { seq, buffer_size })?;
        match self.receive(timeout)? {
            AdminResponse::MonitorGetEntries { entries, .. } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    /// Flush whatever decision records accumulated and unsubscribe.
    pub fn monitor_flush(&mut self, timeout: Option<Duration>) -> Result<Vec<MonitorEntry>, ClientError> {
        let seq = self.take_seq();
        self.send(&AdminRequest::MonitorGetFlush { seq })?;
        match self.receive(timeout)? {
            AdminResponse::MonitorGetEntries { entries, .. } => Ok(entries),
            other => Err(unexpected(&other)),
        }
    }

    // ── plumbing ─────────────────────────────────────────────────────

    fn take_seq(&mut self) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    fn round_trip(&mut self, request: &AdminRequest) -> Result<AdminResponse, ClientError> {
        self.send(request)?;
        self.receive(None)
    }

    fn send(&mut self, request: &AdminRequest) -> Result<(), ClientError> {
        let mut payload = BytesMut::new();
        request.encode(&mut payload);
        let mut framed = BytesMut::new();
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(&payload);
        self.stream.write_all(&framed)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<AdminResponse, ClientError> {
        self.stream.set_read_timeout(timeout)?;
        let mut scratch = [0u8; 4096];
        loop {
            if let Some(frame) = wire::decode_raw(&mut self.read_buf)? {
                return Ok(AdminResponse::decode(frame)?);
            }
            match self.stream.read(&mut scratch) {
                Ok(0) => return Err(ClientError::ServiceNotAvailable),
                Ok(read) => self.read_buf.extend_from_slice(&scratch[..read]),
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(ClientError::Timeout)
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn expect_code(response: AdminResponse, seq: u16) -> Result<(), ClientError> {
    match response {
        AdminResponse::Code {
            code: OperationCode::Ok,
            ..
        } => Ok(()),
        AdminResponse::Code { code, seq: got } => {
            debug!(expected = seq, got, "admin operation refused");
            Err(ClientError::Operation { code })
        }
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &AdminResponse) -> ClientError {
    ClientError::Protocol(vigil_protocol::ProtocolError::InvalidProtocol {
        reason: format!("unexpected admin response {response:?}"),
    })
}

impl std::fmt::Debug for AdminClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminClient").finish_non_exhaustive()
    }
}
