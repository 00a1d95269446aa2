//! Process management utilities.
//!
//! Signal handling and graceful shutdown for VM processes started by the
//! process driver. Everything here is blocking; async callers go through
//! `spawn_blocking`.

use std::time::{Duration, Instant};

use crate::error::DriverError;

/// Time allowed for SIGKILL to take effect.
pub const SIGKILL_WAIT: Duration = Duration::from_millis(500);

/// Poll interval while waiting for a process to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Check if a process is alive.
///
/// Returns true if the process exists, including zombies not yet reaped.
pub fn is_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Reap a process if it has exited (non-blocking).
///
/// Returns `Some(exit_code)` if the process has exited or is not our child,
/// `None` if it is still running.
pub fn try_wait(pid: libc::pid_t) -> Option<i32> {
    let mut status: libc::c_int = 0;
    let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

    if result == pid {
        Some(decode_status(status))
    } else if result < 0 {
        // Not our child (or already reaped): fall back to liveness.
        if is_alive(pid) {
            None
        } else {
            Some(-1)
        }
    } else {
        None
    }
}

fn decode_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        -1
    }
}

/// Send SIGTERM to a process.
///
/// Returns true if the signal was sent successfully.
pub fn terminate(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Send SIGKILL to a process.
///
/// Returns true if the signal was sent successfully.
pub fn kill(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

/// Wait until the process exits or `timeout` elapses.
fn wait_exit(pid: libc::pid_t, timeout: Duration) -> Option<i32> {
    let start = Instant::now();
    loop {
        if let Some(code) = try_wait(pid) {
            return Some(code);
        }
        if start.elapsed() >= timeout {
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Gracefully stop a process.
///
/// 1. Sends SIGTERM
/// 2. Waits up to `grace` for exit
/// 3. Sends SIGKILL and waits [`SIGKILL_WAIT`]
///
/// Returns the exit code (`-1` when it could not be collected).
pub fn stop_process(pid: libc::pid_t, grace: Duration) -> Result<i32, DriverError> {
    if let Some(code) = try_wait(pid) {
        return Ok(code);
    }

    if !terminate(pid) {
        // Process already gone.
        return Ok(try_wait(pid).unwrap_or(0));
    }

    if let Some(code) = wait_exit(pid, grace) {
        return Ok(code);
    }

    tracing::debug!(pid = pid, "SIGTERM timeout, sending SIGKILL");
    kill(pid);

    wait_exit(pid, SIGKILL_WAIT).ok_or(DriverError::Unkillable { pid })
}

/// Resident set size of a process in MiB, read from `/proc`.
///
/// Returns `None` where `/proc` is unavailable.
pub fn resident_memory_mb(pid: libc::pid_t) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status.lines().find_map(|line| {
        let kb = line.strip_prefix("VmRSS:")?.trim().strip_suffix("kB")?;
        kb.trim().parse::<u64>().ok().map(|kb| kb / 1024)
    })
}
