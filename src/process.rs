//! Process liveness probes and termination for job pids.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL used by `ralph stop`.
pub const STOP_GRACE: Duration = Duration::from_secs(3);

const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Whether a process with this pid exists.
///
/// `EPERM` means the process exists but belongs to someone else.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    if unsafe { libc::kill(pid as i32, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}

/// How a [`terminate`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing to do, the process was already gone.
    NotRunning,
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

/// Send SIGTERM, wait up to `grace`, then SIGKILL.
#[cfg(unix)]
pub fn terminate(pid: u32, grace: Duration) -> Result<Termination> {
    if !is_alive(pid) {
        return Ok(Termination::NotRunning);
    }
    let pid_i32 = pid as i32;

    if unsafe { libc::kill(pid_i32, libc::SIGTERM) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(Termination::NotRunning);
        }
        return Err(err).with_context(|| format!("failed to send SIGTERM to pid {pid}"));
    }
    debug!(pid, "sent SIGTERM");

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        thread::sleep(PROBE_INTERVAL);
        if !is_alive(pid) {
            return Ok(Termination::Terminated);
        }
    }

    warn!(pid, grace_secs = grace.as_secs(), "process ignored SIGTERM, sending SIGKILL");
    if unsafe { libc::kill(pid_i32, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(Termination::Terminated);
        }
        return Err(err).with_context(|| format!("failed to send SIGKILL to pid {pid}"));
    }
    Ok(Termination::Killed)
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32, _grace: Duration) -> Result<Termination> {
    anyhow::bail!("process termination is only supported on Unix systems")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_and_out_of_range_are_not_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[test]
    fn terminate_missing_process_is_noop() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert_eq!(
            terminate(pid, Duration::from_millis(200)).unwrap(),
            Termination::NotRunning
        );
    }

    #[test]
    fn terminate_signals_running_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        // The unreaped child lingers as a zombie, so liveness stays true and
        // SIGKILL follows; either way the child must end by signal.
        let outcome = terminate(pid, Duration::from_millis(300)).unwrap();
        assert_ne!(outcome, Termination::NotRunning);
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!is_alive(pid));
    }
}
