use std::time::Duration;

/// Caller misuse of the process API, as opposed to an environmental failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("process has not been started")]
    NotStarted,

    #[error("process was launched detached and cannot be waited on")]
    Detached,

    #[error("process has already been started")]
    AlreadyStarted,

    #[error("process is not running")]
    NotRunning,

    #[error("output capture cannot be combined with detached execution")]
    CaptureWithDetach,

    #[error("command line is empty")]
    EmptyCommand,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to create {stream} pipe: {source}")]
    PipeFailed {
        stream: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: nix::Error,
    },

    #[error("Invalid {what}: contains an interior NUL byte")]
    InvalidArgument { what: String },

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mock expectation not met: {0}")]
    MockExpectationNotMet(String),
}

impl ProcessError {
    /// True when the error reports caller misuse rather than a failed launch.
    pub fn is_usage(&self) -> bool {
        matches!(self, ProcessError::Usage(_))
    }

    pub fn usage(&self) -> Option<UsageError> {
        match self {
            ProcessError::Usage(err) => Some(*err),
            _ => None,
        }
    }
}
