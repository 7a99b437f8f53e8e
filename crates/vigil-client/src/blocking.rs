//! The blocking checker client: one round-trip at a time, with a
//! caller-supplied timeout per call.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use tracing::debug;

use vigil_core::ApiCode;
use vigil_core::types::{MonitorEntry, PolicyKey, PolicyType, Timestamp};
use vigil_protocol::wire::{self, Message};
use vigil_protocol::{ClientRequest, ClientResponse};

use crate::cache::{SessionCache, DEFAULT_CAPACITY};
use crate::error::ClientError;
use crate::interpreter::{Decision, InterpreterRegistry};

/// A synchronous checker. Each call is a full request/response round-trip
/// honouring the supplied timeout; answers are cached per session.
pub struct BlockingClient {
    socket_path: PathBuf,
    interpreters: InterpreterRegistry,
    cache: SessionCache,
    stream: Option<UnixStream>,
    read_buf: BytesMut,
    next_seq: u16,
    /// Decisions served from the cache, pending upload so they still show
    /// up on the monitor channel.
    monitor_hits: Vec<MonitorEntry>,
}

impl BlockingClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            interpreters: InterpreterRegistry::new(),
            cache: SessionCache::new(DEFAULT_CAPACITY),
            stream: None,
            read_buf: BytesMut::new(),
            next_seq: 0,
            monitor_hits: Vec::new(),
        }
    }

    /// Interpreters for plugin policy types.
    pub fn interpreters_mut(&mut self) -> &mut InterpreterRegistry {
        &mut self.interpreters
    }

    /// Full check; blocks until the daemon answers or `timeout` elapses.
    pub fn check(
        &mut self,
        client: &str,
        session: &str,
        user: &str,
        privilege: &str,
        timeout: Option<Duration>,
    ) -> Result<Decision, ClientError> {
        self.round_trip(false, client, session, user, privilege, timeout)
    }

    /// Simple check; a policy that would need an agent fails with
    /// [`ClientError::AccessNotResolved`].
    pub fn simple_check(
        &mut self,
        client: &str,
        session: &str,
        user: &str,
        privilege: &str,
        timeout: Option<Duration>,
    ) -> Result<Decision, ClientError> {
        self.round_trip(true, client, session, user, privilege, timeout)
    }

    fn round_trip(
        &mut self,
        simple: bool,
        client: &str,
        session: &str,
        user: &str,
        privilege: &str,
        timeout: Option<Duration>,
    ) -> Result<Decision, ClientError> {
        let key = PolicyKey::new(client, user, privilege).map_err(|err| {
            ClientError::InvalidParam {
                reason: err.to_string(),
            }
        })?;

        // A cached decision is only valid while the connection that filled
        // the cache is still up: the daemon drops checkers to signal policy
        // changes.
        if self.stream.is_some() && !self.connection_alive() {
            debug!("daemon dropped the connection, discarding cache");
            self.disconnect();
        }
        if self.stream.is_some() {
            if let Some(result) = self.cache.get(session, &key, &self.interpreters) {
                if let Some(decision) = self.interpret(&result) {
                    // Cache hits never reach the daemon, so the audit
                    // record is produced here and uploaded with the next
                    // round-trip.
                    self.monitor_hits.push(MonitorEntry::new(
                        key,
                        match decision {
                            Decision::Allow => PolicyType::ALLOW,
                            Decision::Deny => PolicyType::DENY,
                        },
                        Timestamp::now(),
                    ));
                    return Ok(decision);
                }
            }
        }

        self.ensure_connection()?;
        self.upload_monitor_hits()?;
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let request = if simple {
            ClientRequest::SimpleCheck {
                seq,
                key: key.clone(),
            }
        } else {
            ClientRequest::Check {
                seq,
                key: key.clone(),
            }
        };

        match self.exchange(&request, seq, timeout) {
            Ok((code, result)) => {
                if code != ApiCode::Success {
                    return Err(match code {
                        ApiCode::AccessNotResolved => ClientError::AccessNotResolved,
                        _ => ClientError::ServiceNotAvailable,
                    });
                }
                let decision = self.interpret(&result).unwrap_or(Decision::Deny);
                if self.cacheable(&result) {
                    self.cache
                        .put(session, &key, result, &self.interpreters);
                }
                Ok(decision)
            }
            Err(err) => {
                // The stream may hold a half-read frame; start over next
                // call.
                self.disconnect();
                Err(err)
            }
        }
    }

    fn exchange(
        &mut self,
        request: &ClientRequest,
        seq: u16,
        timeout: Option<Duration>,
    ) -> Result<(ApiCode, vigil_core::types::PolicyResult), ClientError> {
        let Some(stream) = &mut self.stream else {
            return Err(ClientError::ServiceNotAvailable);
        };

        let mut payload = BytesMut::new();
        request.encode(&mut payload);
        let mut framed = BytesMut::new();
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(&payload);

        stream.set_write_timeout(timeout)?;
        stream.write_all(&framed)?;

        stream.set_read_timeout(timeout)?;
        let mut scratch = [0u8; 4096];
        loop {
            if let Some(frame) = wire::decode_raw(&mut self.read_buf)? {
                let response = ClientResponse::decode(frame)?;
                if response.seq() != seq {
                    debug!(seq = response.seq(), "unexpected answer seq, skipping");
                    continue;
                }
                return match response {
                    ClientResponse::Check { result, .. } => Ok((ApiCode::Success, result)),
                    ClientResponse::SimpleCheck { code, result, .. } => {
                        Ok((ApiCode::from_raw(code), result))
                    }
                    ClientResponse::Cancel { .. } => Err(ClientError::Protocol(
                        vigil_protocol::ProtocolError::InvalidProtocol {
                            reason: "unsolicited cancel response".to_owned(),
                        },
                    )),
                };
            }

            match stream.read(&mut scratch) {
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

    /// Fire-and-forget upload of audit records for decisions the cache
    /// answered; the daemon sends no response to these.
    fn upload_monitor_hits(&mut self) -> Result<(), ClientError> {
        if self.monitor_hits.is_empty() {
            return Ok(());
        }
        let Some(stream) = &mut self.stream else {
            return Ok(());
        };
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let request = ClientRequest::MonitorEntriesPut {
            seq,
            entries: std::mem::take(&mut self.monitor_hits),
        };
        let mut payload = BytesMut::new();
        request.encode(&mut payload);
        let mut framed = BytesMut::new();
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(&payload);
        stream.write_all(&framed)?;
        Ok(())
    }

    /// Probe the socket without blocking: a readable stream returning EOF
    /// means the daemon hung up on us.
    fn connection_alive(&mut self) -> bool {
        let Some(stream) = &mut self.stream else {
            return false;
        };
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut scratch = [0u8; 256];
        let alive = match stream.read(&mut scratch) {
            Ok(0) => false,
            Ok(read) => {
                self.read_buf.extend_from_slice(&scratch[..read]);
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        };
        if let Some(stream) = &mut self.stream {
            if stream.set_nonblocking(false).is_err() {
                return false;
            }
        }
        alive
    }

    fn ensure_connection(&mut self) -> Result<(), ClientError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = UnixStream::connect(&self.socket_path)
            .map_err(|_| ClientError::ServiceNotAvailable)?;
        self.stream = Some(stream);
        self.read_buf.clear();
        self.cache.invalidate_all();
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.read_buf.clear();
        self.cache.invalidate_all();
    }

    fn interpret(&self, result: &vigil_core::types::PolicyResult) -> Option<Decision> {
        self.interpreters
            .interpreter_for(result.policy_type())
            .and_then(|interpreter| interpreter.interpret(result))
    }

    fn cacheable(&self, result: &vigil_core::types::PolicyResult) -> bool {
        self.interpreters
            .interpreter_for(result.policy_type())
            .is_some_and(|interpreter| interpreter.cacheable(result))
    }
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("connected", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}
