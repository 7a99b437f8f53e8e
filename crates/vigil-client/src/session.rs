//! Session id helpers.
//!
//! A session is an opaque caller-chosen string scoping the decision cache.
//! For callers that want "one session per process life", the conventional
//! id combines the pid with the kernel's process start time, so a recycled
//! pid never aliases an old session.

use std::fs;
use std::io;

/// Build the conventional session id for a process.
///
/// Reads the process start time (clock ticks since boot) from
/// `/proc/<pid>/stat`; the returned id is stable for the life of the
/// process and distinct across pid reuse.
pub fn session_from_pid(pid: i32) -> io::Result<String> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let start_time = parse_start_time(&stat).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("cannot parse /proc/{pid}/stat"),
        )
    })?;
    Ok(format!("{pid}-{start_time}"))
}

/// The calling process's own session id.
pub fn own_session() -> io::Result<String> {
    session_from_pid(std::process::id() as i32)
}

/// Field 22 of the stat line is the start time. The comm field (2) may
/// contain spaces and parentheses, so fields count from after the last
/// `)`.
fn parse_start_time(stat: &str) -> Option<&str> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    // after_comm starts at field 3 ("state"); start time is field 22.
    after_comm.split_whitespace().nth(19)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_time_past_awkward_comm() {
        let stat = "1234 (we) ird (name) S 1 1234 1234 0 -1 4194560 100 0 0 0 \
                    5 3 0 0 20 0 1 0 987654 1000000 100 18446744073709551615";
        assert_eq!(parse_start_time(stat), Some("987654"));
    }

    #[test]
    fn own_session_is_stable_and_pid_prefixed() {
        let first = own_session().unwrap();
        let second = own_session().unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with(&std::process::id().to_string()));
        assert!(first.contains('-'));
    }

    #[test]
    fn missing_process_is_an_error() {
        // Pid 0 has no /proc entry.
        assert!(session_from_pid(0).is_err());
    }
}
