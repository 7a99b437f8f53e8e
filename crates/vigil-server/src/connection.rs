//! Per-connection plumbing.
//!
//! Each accepted socket becomes a reader task and a writer task. The reader
//! decodes frames with the channel's codec and forwards them to the
//! dispatch loop; a codec error or EOF ends the connection. The writer
//! drains a typed response queue in FIFO order and finishes once the
//! dispatch loop drops its sender — which is also how the daemon force-
//! disconnects a connection after flushing whatever was already queued.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use vigil_protocol::{
    AdminRequest, AdminResponse, AgentRequest, AgentResponse, ClientRequest, ClientResponse,
    Codec, Message, SignalRequest,
};

/// Identifies one connection for the lifetime of the daemon.
pub type ConnId = u64;

/// Which listener a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Client,
    Admin,
    Agent,
}

/// Everything the dispatch loop receives.
#[derive(Debug)]
pub enum Event {
    Connected {
        conn_id: ConnId,
        channel: Channel,
        sender: ConnSender,
        token: CancellationToken,
    },
    Client {
        conn_id: ConnId,
        request: ClientRequest,
    },
    Admin {
        conn_id: ConnId,
        request: AdminRequest,
    },
    Agent {
        conn_id: ConnId,
        request: AgentRequest,
    },
    Disconnected {
        conn_id: ConnId,
    },
    Signal(SignalRequest),
}

/// The typed outbound queue of one connection.
#[derive(Debug)]
pub enum ConnSender {
    Client(mpsc::UnboundedSender<ClientResponse>),
    Admin(mpsc::UnboundedSender<AdminResponse>),
    Agent(mpsc::UnboundedSender<AgentResponse>),
}

/// Dispatch-loop-side record of a live connection.
#[derive(Debug)]
pub struct Connection {
    pub channel: Channel,
    pub sender: ConnSender,
    /// Cancelling tears the reader down; the writer still drains its queue.
    pub token: CancellationToken,
}

impl Connection {
    pub fn send_client(&self, response: ClientResponse) {
        if let ConnSender::Client(sender) = &self.sender {
            let _ = sender.send(response);
        }
    }

    pub fn send_admin(&self, response: AdminResponse) {
        if let ConnSender::Admin(sender) = &self.sender {
            let _ = sender.send(response);
        }
    }

    pub fn send_agent(&self, response: AgentResponse) {
        if let ConnSender::Agent(sender) = &self.sender {
            let _ = sender.send(response);
        }
    }
}

/// The dispatch loop's table of live connections.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<ConnId, Connection>,
}

impl ConnectionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn_id: ConnId, connection: Connection) {
        self.connections.insert(conn_id, connection);
    }

    pub fn remove(&mut self, conn_id: ConnId) -> Option<Connection> {
        self.connections.remove(&conn_id)
    }

    #[must_use]
    pub fn get(&self, conn_id: ConnId) -> Option<&Connection> {
        self.connections.get(&conn_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop every checker connection: queued responses still flush, then
    /// the sockets close. Used after a policy change so every client
    /// rebuilds its cache.
    pub fn disconnect_checkers(&mut self) {
        let checker_ids: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.channel == Channel::Client)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in checker_ids {
            if let Some(connection) = self.connections.remove(&conn_id) {
                debug!(conn_id, "disconnecting checker after policy change");
                connection.token.cancel();
            }
        }
    }

    /// Tear down every connection (daemon shutdown).
    pub fn disconnect_all(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.token.cancel();
        }
    }
}

/// Spawn the reader/writer pair for one accepted socket and hand the
/// dispatch loop its `Connected` event.
pub fn spawn<Req, Resp>(
    conn_id: ConnId,
    channel: Channel,
    stream: UnixStream,
    events: mpsc::UnboundedSender<Event>,
    make_sender: impl FnOnce(mpsc::UnboundedSender<Resp>) -> ConnSender,
    make_event: impl Fn(ConnId, Req) -> Event + Send + 'static,
) where
    Req: Message + Send + 'static,
    Resp: Message + Send + 'static,
{
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, Codec::<Req, Resp>::new());
    let mut writer = FramedWrite::new(write_half, Codec::<Req, Resp>::new());
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Resp>();
    let token = CancellationToken::new();

    let _ = events.send(Event::Connected {
        conn_id,
        channel,
        sender: make_sender(response_tx),
        token: token.clone(),
    });

    let reader_token = token.clone();
    let reader_events = events.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = reader_token.cancelled() => break,
                frame = reader.next() => match frame {
                    Some(Ok(request)) => {
                        trace!(conn_id, "frame received");
                        if reader_events.send(make_event(conn_id, request)).is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(conn_id, error = %err, "protocol error, closing connection");
                        break;
                    }
                    None => break,
                },
            }
        }
        let _ = reader_events.send(Event::Disconnected { conn_id });
    });

    tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            if writer.send(response).await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
        // Reader learns about the closure through the socket; make it
        // prompt.
        token.cancel();
    });
}
