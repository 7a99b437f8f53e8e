//! The event-loop-friendly checker client.
//!
//! The application owns the loop: it watches the fd surfaced by the status
//! callback and calls [`AsyncClient::process`] whenever the socket is
//! ready. Requests are created with a per-request callback and identified
//! by a bounded pool of 16-bit check ids; answers, cancellations, teardown
//! and connection loss all arrive through those callbacks.
//!
//! Callbacks run inside `process`/`cancel_request`; reentering the client
//! from one is forbidden and answered with
//! [`ClientError::OperationNotAllowed`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use bytes::BytesMut;
use tracing::{debug, trace};

use vigil_core::types::{MonitorEntry, PolicyKey, PolicyResult, PolicyType, Timestamp};
use vigil_protocol::wire::{self, Message};
use vigil_protocol::{ClientRequest, ClientResponse};

use crate::cache::{SessionCache, DEFAULT_CAPACITY};
use crate::error::ClientError;
use crate::interpreter::{Decision, InterpreterRegistry};

/// Identifies one in-flight check.
pub type CheckId = u16;

/// Why a response callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackCause {
    /// The daemon answered.
    Answer(Decision),
    /// The caller cancelled the request.
    Cancelled,
    /// The client is being torn down.
    Finished,
    /// The connection to the daemon was lost.
    ServiceNotAvailable,
}

/// Per-request callback.
pub type ResponseCallback = Box<dyn FnMut(CheckId, CallbackCause) + Send>;

/// Connection status callback: `Some(fd)` after (re)connect, `None` on
/// disconnect or teardown.
pub type StatusCallback = Box<dyn FnMut(Option<RawFd>) + Send>;

/// Configuration for [`AsyncClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path of the daemon's client socket.
    pub socket_path: PathBuf,
    /// Decision cache capacity.
    pub cache_capacity: usize,
}

impl ClientConfig {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            cache_capacity: DEFAULT_CAPACITY,
        }
    }
}

struct CheckData {
    key: PolicyKey,
    session: String,
    cancelled: bool,
    /// Taken when the terminal callback fires; `None` afterwards.
    callback: Option<ResponseCallback>,
}

/// Bounded allocator for check ids.
#[derive(Debug, Default)]
struct SequencePool {
    next: u32,
    freed: Vec<u16>,
}

impl SequencePool {
    fn acquire(&mut self) -> Option<u16> {
        if let Some(seq) = self.freed.pop() {
            return Some(seq);
        }
        if self.next <= u32::from(u16::MAX) {
            let seq = self.next as u16;
            self.next += 1;
            Some(seq)
        } else {
            None
        }
    }

    fn release(&mut self, seq: u16) {
        self.freed.push(seq);
    }
}

struct Connection {
    stream: UnixStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

/// The asynchronous checker core.
pub struct AsyncClient {
    config: ClientConfig,
    interpreters: InterpreterRegistry,
    cache: SessionCache,
    connection: Option<Connection>,
    checks: HashMap<u16, CheckData>,
    pool: SequencePool,
    status_callback: Option<StatusCallback>,
    in_callback: bool,
    /// Decisions served from the cache, pending upload so they still show
    /// up on the monitor channel.
    monitor_hits: Vec<MonitorEntry>,
}

impl AsyncClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let cache = SessionCache::new(config.cache_capacity);
        Self {
            config,
            interpreters: InterpreterRegistry::new(),
            cache,
            connection: None,
            checks: HashMap::new(),
            pool: SequencePool::default(),
            status_callback: None,
            in_callback: false,
            monitor_hits: Vec::new(),
        }
    }

    /// Install the connection status callback. It fires immediately if a
    /// connection is already up.
    pub fn set_status_callback(&mut self, mut callback: StatusCallback) {
        if let Some(connection) = &self.connection {
            callback(Some(connection.stream.as_raw_fd()));
        }
        self.status_callback = Some(callback);
    }

    /// Interpreters for plugin policy types.
    pub fn interpreters_mut(&mut self) -> &mut InterpreterRegistry {
        &mut self.interpreters
    }

    /// The fd the application should watch, if connected.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.connection
            .as_ref()
            .map(|connection| connection.stream.as_raw_fd())
    }

    /// Number of in-flight checks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.checks.len()
    }

    fn guard(&self) -> Result<(), ClientError> {
        if self.in_callback {
            Err(ClientError::OperationNotAllowed)
        } else {
            Ok(())
        }
    }

    /// Answer from the cache alone; never touches the wire.
    pub fn check_cache(
        &mut self,
        client: &str,
        session: &str,
        user: &str,
        privilege: &str,
    ) -> Result<Decision, ClientError> {
        self.guard()?;
        if self.connection.is_none() {
            // A cache filled under a previous connection is not
            // trustworthy.
            return Err(ClientError::CacheMiss);
        }
        let key = make_key(client, user, privilege)?;
        let result = self
            .cache
            .get(session, &key, &self.interpreters)
            .ok_or(ClientError::CacheMiss)?;
        let decision = self.interpret(&result).ok_or(ClientError::CacheMiss)?;

        // Cache hits never reach the daemon; their audit records upload
        // with the next `process`.
        self.monitor_hits.push(MonitorEntry::new(
            key,
            match decision {
                Decision::Allow => PolicyType::ALLOW,
                Decision::Deny => PolicyType::DENY,
            },
            Timestamp::now(),
        ));
        Ok(decision)
    }

    /// Enqueue a check. The returned id identifies the answer callback and
    /// may be cancelled. Frames actually leave in [`process`](Self::process).
    pub fn create_request(
        &mut self,
        client: &str,
        session: &str,
        user: &str,
        privilege: &str,
        callback: ResponseCallback,
    ) -> Result<CheckId, ClientError> {
        self.create(false, client, session, user, privilege, callback)
    }

    /// Enqueue a simple check (never suspends on an agent).
    pub fn create_simple_request(
        &mut self,
        client: &str,
        session: &str,
        user: &str,
        privilege: &str,
        callback: ResponseCallback,
    ) -> Result<CheckId, ClientError> {
        self.create(true, client, session, user, privilege, callback)
    }

    fn create(
        &mut self,
        simple: bool,
        client: &str,
        session: &str,
        user: &str,
        privilege: &str,
        callback: ResponseCallback,
    ) -> Result<CheckId, ClientError> {
        self.guard()?;
        self.ensure_connection()?;

        let key = make_key(client, user, privilege)?;
        let Some(seq) = self.pool.acquire() else {
            return Err(ClientError::MaxPendingRequests);
        };

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
        self.enqueue(&request);

        self.checks.insert(
            seq,
            CheckData {
                key,
                session: session.to_owned(),
                cancelled: false,
                callback: Some(callback),
            },
        );
        trace!(seq, "check request queued");
        Ok(seq)
    }

    /// Cancel an in-flight check. The cancel callback fires synchronously;
    /// a late answer for the id is swallowed.
    pub fn cancel_request(&mut self, check_id: CheckId) -> Result<(), ClientError> {
        self.guard()?;
        self.ensure_connection()?;

        let Some(entry) = self.checks.get_mut(&check_id) else {
            return Err(ClientError::InvalidParam {
                reason: format!("unknown check id {check_id}"),
            });
        };
        if entry.cancelled {
            return Err(ClientError::InvalidParam {
                reason: format!("check id {check_id} already cancelled"),
            });
        }
        entry.cancelled = true;
        let callback = entry.callback.take();

        self.enqueue(&ClientRequest::Cancel { seq: check_id });

        if let Some(mut callback) = callback {
            self.in_callback = true;
            callback(check_id, CallbackCause::Cancelled);
            self.in_callback = false;
        }
        Ok(())
    }

    /// Drive the connection: flush queued frames, read whatever arrived,
    /// dispatch callbacks. Call whenever the watched fd is readable or
    /// writable.
    ///
    /// On connection loss every in-flight request's callback fires with
    /// [`CallbackCause::ServiceNotAvailable`], the cache is dropped, and
    /// one reconnect is attempted.
    pub fn process(&mut self) -> Result<(), ClientError> {
        self.guard()?;
        self.ensure_connection()?;

        if !self.monitor_hits.is_empty() {
            let entries = std::mem::take(&mut self.monitor_hits);
            self.enqueue(&ClientRequest::MonitorEntriesPut { seq: 0, entries });
        }

        let (responses, alive) = self.pump();
        for response in responses {
            self.dispatch(response);
        }

        if alive {
            Ok(())
        } else {
            debug!("connection to the daemon lost");
            self.on_disconnected();
            self.connect()
        }
    }

    // ── wire plumbing ────────────────────────────────────────────────

    fn ensure_connection(&mut self) -> Result<(), ClientError> {
        if self.connection.is_some() {
            return Ok(());
        }
        self.connect()
    }

    fn connect(&mut self) -> Result<(), ClientError> {
        let stream = UnixStream::connect(&self.config.socket_path)
            .map_err(|_| ClientError::ServiceNotAvailable)?;
        stream
            .set_nonblocking(true)
            .map_err(|_| ClientError::ServiceNotAvailable)?;
        let fd = stream.as_raw_fd();
        self.connection = Some(Connection {
            stream,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        });
        self.cache.invalidate_all();
        self.notify_status(Some(fd));
        debug!(fd, "connected to the daemon");
        Ok(())
    }

    fn enqueue(&mut self, request: &ClientRequest) {
        if let Some(connection) = &mut self.connection {
            let mut payload = BytesMut::new();
            request.encode(&mut payload);
            connection
                .write_buf
                .extend_from_slice(&(payload.len() as u32).to_le_bytes());
            connection.write_buf.extend_from_slice(&payload);
        }
    }

    /// Flush and read without blocking. Returns decoded responses and
    /// whether the connection is still usable.
    fn pump(&mut self) -> (Vec<ClientResponse>, bool) {
        let Some(connection) = &mut self.connection else {
            return (Vec::new(), false);
        };

        // Write side: drain as much as the socket takes.
        while !connection.write_buf.is_empty() {
            match connection.stream.write(&connection.write_buf) {
                Ok(0) => return (Vec::new(), false),
                Ok(written) => {
                    let _ = connection.write_buf.split_to(written);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => return (Vec::new(), false),
            }
        }

        // Read side: consume whatever is available.
        let mut alive = true;
        let mut scratch = [0u8; 4096];
        loop {
            match connection.stream.read(&mut scratch) {
                Ok(0) => {
                    alive = false;
                    break;
                }
                Ok(read) => connection.read_buf.extend_from_slice(&scratch[..read]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => {
                    alive = false;
                    break;
                }
            }
        }

        // Frame extraction; a malformed frame poisons the connection.
        let mut responses = Vec::new();
        loop {
            match wire::decode_raw(&mut connection.read_buf) {
                Ok(Some(frame)) => match ClientResponse::decode(frame) {
                    Ok(response) => responses.push(response),
                    Err(err) => {
                        debug!(error = %err, "protocol error from daemon");
                        alive = false;
                        break;
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "framing error from daemon");
                    alive = false;
                    break;
                }
            }
        }
        (responses, alive)
    }

    fn dispatch(&mut self, response: ClientResponse) {
        match response {
            ClientResponse::Check { seq, result } => {
                self.finish(seq, &result, None);
            }
            ClientResponse::SimpleCheck { seq, code, result } => {
                self.finish(seq, &result, Some(code));
            }
            ClientResponse::Cancel { seq } => {
                if self.checks.remove(&seq).is_some() {
                    self.pool.release(seq);
                    trace!(seq, "cancel acknowledged");
                }
            }
        }
    }

    fn finish(&mut self, seq: u16, result: &PolicyResult, code: Option<i32>) {
        let Some(mut entry) = self.checks.remove(&seq) else {
            trace!(seq, "answer for unknown check id, dropping");
            return;
        };
        self.pool.release(seq);

        if entry.cancelled {
            // The cancel callback already fired; a racing answer is
            // swallowed.
            trace!(seq, "late answer for cancelled check, swallowing");
            return;
        }

        let resolved = code.map_or(true, |code| code == vigil_core::ApiCode::Success.raw());
        let decision = if resolved {
            self.interpret(result).unwrap_or(Decision::Deny)
        } else {
            Decision::Deny
        };

        if resolved && self.cacheable(result) {
            self.cache
                .put(&entry.session, &entry.key, result.clone(), &self.interpreters);
        }

        if let Some(callback) = &mut entry.callback {
            self.in_callback = true;
            callback(seq, CallbackCause::Answer(decision));
            self.in_callback = false;
        }
    }

    fn interpret(&self, result: &PolicyResult) -> Option<Decision> {
        self.interpreters
            .interpreter_for(result.policy_type())
            .and_then(|interpreter| interpreter.interpret(result))
    }

    fn cacheable(&self, result: &PolicyResult) -> bool {
        self.interpreters
            .interpreter_for(result.policy_type())
            .is_some_and(|interpreter| interpreter.cacheable(result))
    }

    fn on_disconnected(&mut self) {
        self.connection = None;
        self.cache.invalidate_all();
        self.notify_status(None);

        let flushed: Vec<(u16, CheckData)> = self.checks.drain().collect();
        for (seq, mut entry) in flushed {
            self.pool.release(seq);
            if let Some(callback) = &mut entry.callback {
                self.in_callback = true;
                callback(seq, CallbackCause::ServiceNotAvailable);
                self.in_callback = false;
            }
        }
    }

    fn notify_status(&mut self, fd: Option<RawFd>) {
        if let Some(callback) = &mut self.status_callback {
            self.in_callback = true;
            callback(fd);
            self.in_callback = false;
        }
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        let flushed: Vec<(u16, CheckData)> = self.checks.drain().collect();
        for (seq, mut entry) in flushed {
            if !entry.cancelled {
                if let Some(callback) = &mut entry.callback {
                    callback(seq, CallbackCause::Finished);
                }
            }
        }
        self.notify_status(None);
    }
}

impl std::fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClient")
            .field("connected", &self.connection.is_some())
            .field("pending", &self.checks.len())
            .finish_non_exhaustive()
    }
}

fn make_key(client: &str, user: &str, privilege: &str) -> Result<PolicyKey, ClientError> {
    PolicyKey::new(client, user, privilege).map_err(|err| ClientError::InvalidParam {
        reason: err.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn sequence_pool_exhausts_and_recycles() {
        let mut pool = SequencePool::default();
        for expected in 0..=u16::MAX {
            assert_eq!(pool.acquire(), Some(expected));
        }
        assert_eq!(pool.acquire(), None);
        pool.release(7);
        assert_eq!(pool.acquire(), Some(7));
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn create_without_daemon_is_service_not_available() {
        let mut client = AsyncClient::new(ClientConfig::new("/nonexistent/socket"));
        let result = client.create_request("c", "s", "u", "p", Box::new(|_, _| {}));
        assert!(matches!(result, Err(ClientError::ServiceNotAvailable)));
    }

    #[test]
    fn check_cache_without_connection_misses() {
        let mut client = AsyncClient::new(ClientConfig::new("/nonexistent/socket"));
        assert!(matches!(
            client.check_cache("c", "s", "u", "p"),
            Err(ClientError::CacheMiss)
        ));
    }

    #[test]
    fn cancel_without_daemon_is_service_not_available() {
        let mut client = AsyncClient::new(ClientConfig::new("/nonexistent/socket"));
        assert!(matches!(
            client.cancel_request(3),
            Err(ClientError::ServiceNotAvailable)
        ));
    }
}
