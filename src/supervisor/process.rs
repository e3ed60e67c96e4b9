use std::process::ExitStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Clean,
    Crashed,
}

/// Ask a worker to stop (SIGTERM on unix, taskkill elsewhere).
pub fn terminate(pid: u32) -> Result<(), ProcessError> {
    tracing::debug!("Sending TERM signal to worker (pid: {})", pid);

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        let output = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| ProcessError::TerminationFailed {
                pid,
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ProcessError::TerminationFailed {
                pid,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
            ProcessError::TerminationFailed {
                pid,
                reason: format!("Failed to send signal: {}", e),
            }
        })?;
    }

    Ok(())
}

/// A zero exit is clean. So is a stop the supervisor asked for, when the
/// worker went down to that signal.
pub fn classify_exit(status: &ExitStatus, stop_requested: bool) -> ExitKind {
    if status.success() {
        return ExitKind::Clean;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if stop_requested && status.signal().is_some() {
            return ExitKind::Clean;
        }
    }

    // taskkill leaves an exit code, not a signal
    #[cfg(not(unix))]
    {
        if stop_requested {
            return ExitKind::Clean;
        }
    }

    ExitKind::Crashed
}
