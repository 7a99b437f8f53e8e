//! Wire protocol for vigil.
//!
//! Every message is one frame: a `u32` little-endian payload length, then
//! the payload — a `u16` little-endian sequence number, a `u8` opcode, and
//! opcode-specific fields. Each socket channel (client, admin+monitor,
//! agent) has its own closed opcode set; decoding a foreign opcode is a
//! protocol violation that closes the connection.
//!
//! The [`Codec`] type parameterises tokio-util framing over the decode/
//! encode directions, so the same message enums serve both the daemon and
//! the client libraries.

pub mod admin;
pub mod agent;
pub mod client;
pub mod monitor;
pub mod signal;
pub mod wire;

pub use admin::{AdminRequest, AdminResponse};
pub use agent::{AgentAction, AgentRequest, AgentResponse, RegisterCode};
pub use client::{ClientRequest, ClientResponse};
pub use signal::SignalRequest;
pub use wire::{Codec, Message, ProtocolError, RawFrame};

/// Codec for the daemon side of the client socket.
pub type ClientServerCodec = Codec<client::ClientRequest, client::ClientResponse>;
/// Codec for the library side of the client socket.
pub type ClientSideCodec = Codec<client::ClientResponse, client::ClientRequest>;
/// Codec for the daemon side of the admin socket.
pub type AdminServerCodec = Codec<admin::AdminRequest, admin::AdminResponse>;
/// Codec for the tool side of the admin socket.
pub type AdminSideCodec = Codec<admin::AdminResponse, admin::AdminRequest>;
/// Codec for the daemon side of the agent socket.
pub type AgentServerCodec = Codec<agent::AgentRequest, agent::AgentResponse>;
/// Codec for the agent side of the agent socket.
pub type AgentSideCodec = Codec<agent::AgentResponse, agent::AgentRequest>;
