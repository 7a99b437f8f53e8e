//! The agent library: the privileged side that answers questions the
//! daemon cannot settle from stored policy alone.
//!
//! An agent claims an agent type at registration (one connection per type),
//! then serves a receive/respond loop: the daemon pushes queries carrying
//! an opaque plugin payload, the agent answers them — or learns they were
//! cancelled and stops whatever interaction it started.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use bytes::BytesMut;
use tracing::debug;

use vigil_protocol::wire::{self, Message};
use vigil_protocol::{AgentAction, AgentRequest, AgentResponse, RegisterCode};

use crate::error::ClientError;

/// One query pushed by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentQuery {
    /// Identifies the query in responses; unique among this agent's
    /// in-flight queries.
    pub id: u16,
    /// `Action` for a fresh question, `Cancel` when an earlier question is
    /// withdrawn.
    pub action: AgentAction,
    /// The plugin payload (empty for cancellations).
    pub payload: String,
}

/// A registered agent connection.
pub struct AgentClient {
    stream: UnixStream,
    read_buf: BytesMut,
    agent_type: String,
}

impl AgentClient {
    /// Connect to the daemon's agent socket and claim `agent_type`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::ServiceNotAvailable`] if the daemon is unreachable.
    /// - [`ClientError::OperationNotAllowed`] if another connection already
    ///   owns the type.
    pub fn register(
        socket_path: impl AsRef<Path>,
        agent_type: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path.as_ref())
            .map_err(|_| ClientError::ServiceNotAvailable)?;
        let mut agent = Self {
            stream,
            read_buf: BytesMut::new(),
            agent_type: agent_type.into(),
        };

        agent.send(&AgentRequest::Register {
            seq: 0,
            agent_type: agent.agent_type.clone(),
        })?;
        match agent.receive(None)? {
            AgentResponse::Register {
                code: RegisterCode::Done,
                ..
            } => {
                debug!(agent_type = %agent.agent_type, "agent registered");
                Ok(agent)
            }
            AgentResponse::Register {
                code: RegisterCode::Rejected,
                ..
            } => Err(ClientError::OperationNotAllowed),
            AgentResponse::Register { .. } => Err(ClientError::ServiceNotAvailable),
            other => Err(unexpected(&other)),
        }
    }

    /// The agent type this connection owns.
    #[must_use]
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// Wait for the next pushed query (or cancellation).
    pub fn recv_query(&mut self, timeout: Option<Duration>) -> Result<AgentQuery, ClientError> {
        match self.receive(timeout)? {
            AgentResponse::ActionPush {
                seq,
                action,
                payload,
            } => Ok(AgentQuery {
                id: seq,
                action,
                payload,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Answer a query; `payload` is handed to the owning plugin verbatim.
    pub fn respond(&mut self, id: u16, payload: &str) -> Result<(), ClientError> {
        self.send(&AgentRequest::Action {
            seq: id,
            action: AgentAction::Action,
            payload: payload.to_owned(),
        })
    }

    /// Acknowledge that a query was abandoned on the agent side (e.g. the
    /// prompt was dismissed).
    pub fn respond_cancelled(&mut self, id: u16) -> Result<(), ClientError> {
        self.send(&AgentRequest::Action {
            seq: id,
            action: AgentAction::Cancel,
            payload: String::new(),
        })
    }

    fn send(&mut self, request: &AgentRequest) -> Result<(), ClientError> {
        let mut payload = BytesMut::new();
        request.encode(&mut payload);
        let mut framed = BytesMut::new();
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(&payload);
        self.stream.write_all(&framed)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<AgentResponse, ClientError> {
        self.stream.set_read_timeout(timeout)?;
        let mut scratch = [0u8; 4096];
        loop {
            if let Some(frame) = wire::decode_raw(&mut self.read_buf)? {
                return Ok(AgentResponse::decode(frame)?);
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

fn unexpected(response: &AgentResponse) -> ClientError {
    ClientError::Protocol(vigil_protocol::ProtocolError::InvalidProtocol {
        reason: format!("unexpected agent response {response:?}"),
    })
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("agent_type", &self.agent_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_daemon_is_service_not_available() {
        assert!(matches!(
            AgentClient::register("/nonexistent/socket", "ask-user"),
            Err(ClientError::ServiceNotAvailable)
        ));
    }
}
