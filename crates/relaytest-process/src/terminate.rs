//! Process termination primitives.

use relaytest_common::{Result, TesterError};

/// Ask a process to terminate (SIGTERM).
#[cfg(unix)]
pub fn terminate_gracefully(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| TesterError::config(format!("SIGTERM to {} failed: {}", pid, e)))
}

#[cfg(not(unix))]
pub fn terminate_gracefully(_pid: u32) -> Result<()> {
    // No graceful signal available; callers fall through to the kill path.
    Ok(())
}
