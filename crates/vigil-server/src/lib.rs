//! The vigil policy-decision daemon.
//!
//! The runtime model is a single dispatch task that exclusively owns every
//! piece of mutable service state; per-connection reader tasks feed it
//! decoded requests over one mpsc channel, and per-connection writer tasks
//! drain typed response queues back onto the sockets. All mutation is
//! therefore serialised without a single lock, and durability ordering
//! (persist, then respond, then drop checkers) is just statement order
//! inside the dispatch loop.

pub mod agents;
pub mod config;
pub mod connection;
pub mod listener;
pub mod pending;
pub mod router;

pub use config::ServerConfig;
pub use router::run;
