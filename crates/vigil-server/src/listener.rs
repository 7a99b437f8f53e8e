//! Socket setup: the three UNIX stream listeners with their permission
//! modes, either bound fresh under the runtime directory or adopted from a
//! supervising launcher's preopened fds.

use std::fs;
use std::io;
use std::path::Path;

use tokio::net::UnixListener;
use tracing::info;

use crate::config::{ServerConfig, LISTEN_FDS_ENV};

/// First fd a launcher passes, by convention.
pub const LISTEN_FDS_START: i32 = 3;

/// The daemon's three listeners, in channel order.
#[derive(Debug)]
pub struct Listeners {
    pub client: UnixListener,
    pub admin: UnixListener,
    pub agent: UnixListener,
}

/// Bind (or adopt) the listeners.
///
/// With `VIGIL_LISTEN_FDS=3` in the environment, fds 3, 4 and 5 are adopted
/// as the client, admin and agent listeners in that order. Otherwise the
/// sockets are created under the runtime directory with modes 0666, 0600
/// and 0666.
pub fn bind(config: &ServerConfig) -> io::Result<Listeners> {
    if let Some(listeners) = adopt_from_launcher()? {
        info!("adopted listener fds from launcher");
        return Ok(listeners);
    }

    fs::create_dir_all(&config.runtime_dir)?;

    let client = bind_at(&config.client_socket(), 0o666)?;
    let admin = bind_at(&config.admin_socket(), 0o600)?;
    let agent = bind_at(&config.agent_socket(), 0o666)?;

    info!(dir = %config.runtime_dir.display(), "listening sockets bound");
    Ok(Listeners {
        client,
        admin,
        agent,
    })
}

fn bind_at(path: &Path, mode: u32) -> io::Result<UnixListener> {
    // A stale socket file from a previous run would make bind fail; the
    // database lock already guarantees we are the only live daemon.
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let listener = UnixListener::bind(path)?;
    set_mode(path, mode)?;
    Ok(listener)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Adopt preopened listener fds when the launcher passed them.
#[cfg(unix)]
fn adopt_from_launcher() -> io::Result<Option<Listeners>> {
    use std::os::unix::io::FromRawFd;
    use std::os::unix::net::UnixListener as StdUnixListener;

    let Ok(count) = std::env::var(LISTEN_FDS_ENV) else {
        return Ok(None);
    };
    let count: i32 = count.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{LISTEN_FDS_ENV} is not a number"),
        )
    })?;
    if count != 3 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{LISTEN_FDS_ENV}={count}, expected exactly 3 listener fds"),
        ));
    }

    let mut adopted = Vec::with_capacity(3);
    for fd in LISTEN_FDS_START..LISTEN_FDS_START + 3 {
        // SAFETY: by the launcher fd-passing contract these fds are open
        // listening UNIX sockets the launcher handed to this process and
        // touches no further; `from_raw_fd` takes sole ownership here, and
        // nothing else in the process reads or closes these descriptors.
        #[allow(unsafe_code)]
        let std_listener = unsafe { StdUnixListener::from_raw_fd(fd) };
        std_listener.set_nonblocking(true)?;
        adopted.push(UnixListener::from_std(std_listener)?);
    }
    let mut adopted = adopted.into_iter();
    Ok(Some(Listeners {
        client: adopted.next().ok_or_else(missing_fd)?,
        admin: adopted.next().ok_or_else(missing_fd)?,
        agent: adopted.next().ok_or_else(missing_fd)?,
    }))
}

#[cfg(not(unix))]
fn adopt_from_launcher() -> io::Result<Option<Listeners>> {
    Ok(None)
}

#[cfg(unix)]
fn missing_fd() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "launcher fd set incomplete")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[tokio::test]
    async fn binds_all_three_sockets_with_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            runtime_dir: dir.path().to_path_buf(),
            state_dir: dir.path().join("db"),
            log_filter: "info".to_owned(),
            monitor_capacity: 16,
        };
        let _listeners = bind(&config).unwrap();

        let mode = |name: &str| {
            fs::metadata(dir.path().join(name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };
        assert_eq!(mode("client"), 0o666);
        assert_eq!(mode("admin"), 0o600);
        assert_eq!(mode("agent"), 0o666);
    }

    #[tokio::test]
    async fn rebinding_over_stale_sockets_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            runtime_dir: dir.path().to_path_buf(),
            state_dir: dir.path().join("db"),
            log_filter: "info".to_owned(),
            monitor_capacity: 16,
        };
        let first = bind(&config).unwrap();
        drop(first);
        // Socket files linger after drop; the second bind must replace them.
        assert!(dir.path().join("client").exists());
        bind(&config).unwrap();
    }
}
