//! Daemon configuration.
//!
//! Everything can come from the environment (`VIGIL_*` variables) with
//! command-line flags taking precedence; see the `vigild` binary for the
//! flag surface.

use std::path::PathBuf;

/// Runtime configuration for the daemon.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory the listening sockets live in.
    pub runtime_dir: PathBuf,
    /// Directory holding the policy database.
    pub state_dir: PathBuf,
    /// Log filter (e.g. `info`, `vigil=debug`).
    pub log_filter: String,
    /// Capacity of the monitor entry ring.
    pub monitor_capacity: usize,
}

/// Environment variable a supervising launcher sets to pass preopened
/// listener fds (client, admin, agent — starting at fd 3).
pub const LISTEN_FDS_ENV: &str = "VIGIL_LISTEN_FDS";

impl ServerConfig {
    /// Path of the client socket.
    #[must_use]
    pub fn client_socket(&self) -> PathBuf {
        self.runtime_dir.join("client")
    }

    /// Path of the admin socket.
    #[must_use]
    pub fn admin_socket(&self) -> PathBuf {
        self.runtime_dir.join("admin")
    }

    /// Path of the agent socket.
    #[must_use]
    pub fn agent_socket(&self) -> PathBuf {
        self.runtime_dir.join("agent")
    }
}
