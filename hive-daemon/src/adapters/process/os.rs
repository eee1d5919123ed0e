use crate::ports::process::{ProcessControl, Signal};
use std::io;

/// Real processes, addressed by PID.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsProcessControl;

impl OsProcessControl {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl ProcessControl for OsProcessControl {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 only checks existence and permissions.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn start_ticks(&self, pid: u32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        parse_start_ticks(&stat)
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let target = libc::pid_t::try_from(pid)
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
        let signo = match signal {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // Agents run as group leaders; helpers they spawn share the group.
        let leads_group = unsafe { libc::getpgid(target) } == target;
        let target = if leads_group { -target } else { target };
        let rc = unsafe { libc::kill(target, signo) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }
}

#[cfg(not(unix))]
impl ProcessControl for OsProcessControl {
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn start_ticks(&self, _pid: u32) -> Option<u64> {
        None
    }

    fn signal(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "signalling processes is not supported on this platform",
        ))
    }
}

/// Extracts field 22 (`starttime`) from a `/proc/<pid>/stat` line. The command
/// name may contain spaces and parentheses, so fields are counted from the
/// last `)`.
pub fn parse_start_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // `rest` starts at field 3 (state).
    rest.split_whitespace().nth(22 - 3)?.parse().ok()
}

/// Whether `pid` names a live, non-zombie process.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn still_running(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state != "Z")
        })
        .unwrap_or(false)
}
