//! Decoding of OS wait statuses into a single exit-code channel.
//!
//! A normal exit yields the program's own code. Termination by a signal is
//! folded into `128 + signal`, the same convention POSIX shells use, so
//! callers that only look at one integer can still tell the two apart.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::fmt;

/// Exit code of a child whose image replacement failed.
///
/// Indistinguishable from a program that exits 127 on its own.
pub const EXEC_FAILED_EXIT_CODE: i32 = 127;

/// Exit code recorded when a child's status could not be collected, e.g.
/// because something else already reaped it.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Base added to a signal number to form the exit code of a signalled child.
pub const SIGNAL_EXIT_BASE: i32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Signal(i32),
    Timeout,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    /// Build a status from a plain exit code.
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        }
    }

    /// The single-integer form of this status; `None` for a timeout.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            ExitStatus::Signal(signal) => Some(SIGNAL_EXIT_BASE + signal),
            ExitStatus::Timeout => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitStatus::Signal(signal) => Some(*signal),
            _ => None,
        }
    }

    /// Decode a terminal wait status. Stop/continue notifications and
    /// `StillAlive` are not terminal and yield `None`.
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::from_code(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signal(signal as i32)),
            _ => None,
        }
    }
}

/// Block until `pid` terminates and reap it.
pub fn wait_for_pid(pid: Pid) -> ExitStatus {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(status) = ExitStatus::from_wait_status(status) {
                    return status;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(err) => {
                tracing::warn!("waitpid({}) failed, exit status unknown: {}", pid, err);
                return ExitStatus::Error(UNKNOWN_EXIT_CODE);
            }
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "exit code 0"),
            ExitStatus::Error(code) => write!(f, "exit code {}", code),
            ExitStatus::Signal(signal) => write!(
                f,
                "signal {} (exit code {})",
                signal,
                SIGNAL_EXIT_BASE + signal
            ),
            ExitStatus::Timeout => write!(f, "timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use proptest::prelude::*;

    #[test]
    fn test_exited_status_maps_to_own_code() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Exited(pid, 0)),
            Some(ExitStatus::Success)
        );
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some(ExitStatus::Error(3))
        );
    }

    #[test]
    fn test_signaled_status_maps_to_reserved_range() {
        let pid = Pid::from_raw(42);
        let status = ExitStatus::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false))
            .unwrap();
        assert_eq!(status, ExitStatus::Signal(9));
        assert_eq!(status.code(), Some(137));
        assert_eq!(status.signal(), Some(9));
        assert!(!status.success());
    }

    #[test]
    fn test_non_terminal_statuses_are_ignored() {
        let pid = Pid::from_raw(42);
        assert_eq!(ExitStatus::from_wait_status(WaitStatus::StillAlive), None);
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            None
        );
        assert_eq!(ExitStatus::from_wait_status(WaitStatus::Continued(pid)), None);
    }

    #[test]
    fn test_timeout_has_no_code() {
        assert_eq!(ExitStatus::Timeout.code(), None);
        assert_eq!(ExitStatus::Timeout.to_string(), "timed out");
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitStatus::Error(2).to_string(), "exit code 2");
        assert_eq!(ExitStatus::Signal(15).to_string(), "signal 15 (exit code 143)");
    }

    proptest! {
        #[test]
        fn test_normal_exit_code_round_trips(code in 0i32..=255) {
            let status = ExitStatus::from_wait_status(WaitStatus::Exited(Pid::from_raw(1), code)).unwrap();
            prop_assert_eq!(status.code(), Some(code));
            prop_assert_eq!(status.success(), code == 0);
        }

        #[test]
        fn test_signal_exit_code_is_offset(index in 0usize..4) {
            let signal = [Signal::SIGHUP, Signal::SIGINT, Signal::SIGKILL, Signal::SIGTERM][index];
            let status = ExitStatus::from_wait_status(WaitStatus::Signaled(Pid::from_raw(1), signal, false)).unwrap();
            prop_assert_eq!(status.code(), Some(SIGNAL_EXIT_BASE + signal as i32));
        }
    }
}
