//! Peer credential derivation.
//!
//! A service that checks its peers asks the kernel who is on the other end
//! of a connected UNIX socket and turns that into the `(client, user)`
//! strings the daemon evaluates. Which representation to use is configured
//! system-wide in a `creds.conf` file read once at startup.

use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Default configuration directory.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/vigil";
/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "VIGIL_CONFIG_DIR";
/// Name of the credentials configuration file.
pub const CREDS_FILE: &str = "creds.conf";

/// How the client slot of a key is derived from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMethod {
    /// The peer's SMACK label.
    Smack,
    /// The peer's process id.
    Pid,
}

/// How the user slot of a key is derived from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMethod {
    /// The peer's effective user id.
    Uid,
    /// The peer's effective group id.
    Gid,
}

/// Errors from loading `creds.conf`.
#[derive(Debug, thiserror::Error)]
pub enum CredsError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: io::Error,
    },

    #[error("line {line}: duplicate key {key:?}")]
    DuplicateKey { line: usize, key: String },

    #[error("line {line}: unknown value {value:?} for {key:?}")]
    BadValue {
        line: usize,
        key: String,
        value: String,
    },

    #[error("missing key {key:?}")]
    MissingKey { key: &'static str },
}

/// The system-wide credential derivation defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredsConfig {
    pub client_default: ClientMethod,
    pub user_default: UserMethod,
}

impl CredsConfig {
    /// Load from the configuration directory (`VIGIL_CONFIG_DIR` or
    /// `/etc/vigil`).
    pub fn load_default() -> Result<Self, CredsError> {
        let dir = std::env::var(CONFIG_DIR_ENV)
            .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR), PathBuf::from);
        Self::load(dir.join(CREDS_FILE))
    }

    /// Load from a specific file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CredsError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| CredsError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse `key=value` lines: `#` starts a comment, whitespace around key
    /// and value is trimmed, keys are case-insensitive. A duplicate or a
    /// missing recognised key is a configuration error; unrecognised keys
    /// are ignored.
    pub fn parse(content: &str) -> Result<Self, CredsError> {
        let mut client_default = None;
        let mut user_default = None;

        for (index, raw_line) in content.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("");
            let Some((raw_key, raw_value)) = line.split_once('=') else {
                continue;
            };
            let key = raw_key.trim().to_ascii_lowercase();
            let value = raw_value.trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }

            match key.as_str() {
                "client_default" => {
                    if client_default.is_some() {
                        return Err(CredsError::DuplicateKey {
                            line: index + 1,
                            key,
                        });
                    }
                    client_default = Some(match value.as_str() {
                        "smack" => ClientMethod::Smack,
                        "pid" => ClientMethod::Pid,
                        _ => {
                            return Err(CredsError::BadValue {
                                line: index + 1,
                                key,
                                value,
                            })
                        }
                    });
                }
                "user_default" => {
                    if user_default.is_some() {
                        return Err(CredsError::DuplicateKey {
                            line: index + 1,
                            key,
                        });
                    }
                    user_default = Some(match value.as_str() {
                        "uid" => UserMethod::Uid,
                        "gid" => UserMethod::Gid,
                        _ => {
                            return Err(CredsError::BadValue {
                                line: index + 1,
                                key,
                                value,
                            })
                        }
                    });
                }
                _ => debug!(key = %key, "ignoring unrecognised creds.conf key"),
            }
        }

        Ok(Self {
            client_default: client_default.ok_or(CredsError::MissingKey {
                key: "client_default",
            })?,
            user_default: user_default.ok_or(CredsError::MissingKey {
                key: "user_default",
            })?,
        })
    }
}

/// Kernel-reported identity of a socket peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Ask the kernel who is on the other end of a connected UNIX socket.
#[cfg(unix)]
pub fn peer_credentials(socket: &impl AsRawFd) -> io::Result<PeerCred> {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: `getsockopt(SO_PEERCRED)` writes at most `len` bytes into the
    // buffer; `ucred` is a properly initialised stack value of exactly that
    // size and `len` is passed by valid pointer. The fd is borrowed from a
    // live socket. No pointers escape the call.
    #[allow(unsafe_code)]
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCred {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

/// Derive the client slot for a peer with the configured method.
pub fn client_string(method: ClientMethod, peer: &PeerCred) -> io::Result<String> {
    match method {
        ClientMethod::Pid => Ok(peer.pid.to_string()),
        ClientMethod::Smack => {
            let label = fs::read_to_string(format!("/proc/{}/attr/current", peer.pid))?;
            Ok(label.trim_end_matches(['\n', '\0']).to_owned())
        }
    }
}

/// Derive the user slot for a peer with the configured method.
#[must_use]
pub fn user_string(method: UserMethod, peer: &PeerCred) -> String {
    match method {
        UserMethod::Uid => peer.uid.to_string(),
        UserMethod::Gid => peer.gid.to_string(),
    }
}

/// Peer-metadata lookups a message-bus connection provides. Services that
/// authorize bus peers instead of direct socket peers implement this
/// against their bus library and reuse the same derivation methods.
pub trait BusPeerInfo {
    /// Process id of the connection owning `bus_name`.
    fn process_id(&self, bus_name: &str) -> io::Result<i32>;
    /// Effective user id of the connection owning `bus_name`.
    fn user_id(&self, bus_name: &str) -> io::Result<u32>;
    /// Effective group id of the connection owning `bus_name`.
    fn group_id(&self, bus_name: &str) -> io::Result<u32>;
}

/// Derive the client slot for a bus peer.
pub fn bus_client_string(
    method: ClientMethod,
    bus: &dyn BusPeerInfo,
    bus_name: &str,
) -> io::Result<String> {
    let pid = bus.process_id(bus_name)?;
    match method {
        ClientMethod::Pid => Ok(pid.to_string()),
        ClientMethod::Smack => {
            let label = fs::read_to_string(format!("/proc/{pid}/attr/current"))?;
            Ok(label.trim_end_matches(['\n', '\0']).to_owned())
        }
    }
}

/// Derive the user slot for a bus peer.
pub fn bus_user_string(
    method: UserMethod,
    bus: &dyn BusPeerInfo,
    bus_name: &str,
) -> io::Result<String> {
    match method {
        UserMethod::Uid => Ok(bus.user_id(bus_name)?.to_string()),
        UserMethod::Gid => Ok(bus.group_id(bus_name)?.to_string()),
    }
}
