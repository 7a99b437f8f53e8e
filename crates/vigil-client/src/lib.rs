//! Client libraries for vigil.
//!
//! [`AsyncClient`] is the event-loop-friendly checker: non-blocking socket,
//! caller-driven `process`, callbacks per in-flight check, and a
//! session-scoped decision cache with interpreter-generation invalidation.
//! [`BlockingClient`] is the one-call-at-a-time convenience wrapper.
//! [`AdminClient`] speaks the admin and monitor channels for tooling, and
//! [`AgentClient`] the agent channel for the privileged processes that
//! answer ask-user policies. The [`creds`] module derives the
//! `(client, user)` strings a checker passes to the daemon from a
//! connected peer's socket credentials; [`session`] builds conventional
//! cache-session ids.

pub mod admin;
pub mod agent;
pub mod async_client;
pub mod blocking;
pub mod cache;
pub mod creds;
pub mod error;
pub mod interpreter;
pub mod session;

pub use admin::AdminClient;
pub use agent::{AgentClient, AgentQuery};
pub use async_client::{AsyncClient, CallbackCause, CheckId, ClientConfig};
pub use blocking::BlockingClient;
pub use cache::SessionCache;
pub use error::ClientError;
pub use interpreter::{Decision, InterpreterRegistry, NaiveInterpreter, ResultInterpreter};
