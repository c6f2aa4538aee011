//! Child processes over fork/exec with piped standard streams.
//!
//! - [`Process`] controls one child: launch, stdio as [`StreamBuffer`]s,
//!   background reaping, exit status.
//! - [`run_command`] runs a whitespace-split command line once.
//! - [`ProcessRunner`] is the async seam; [`SubprocessManager`] hands out the
//!   production [`ForkExecRunner`] or a [`MockProcessRunner`].

pub mod builder;
pub mod command;
pub mod error;
pub mod exit;
pub mod mock;
pub mod pipe;
pub mod process;
pub mod runner;
pub mod spawn;
pub mod stream;

#[cfg(test)]
mod tests;

pub use builder::{Environment, ProcessCommandBuilder, ProcessConfig};
pub use command::{run_command, run_command_args, split_command_line, CommandOutcome, RunOptions};
pub use error::{ProcessError, UsageError};
pub use exit::{ExitStatus, EXEC_FAILED_EXIT_CODE, SIGNAL_EXIT_BASE};
pub use mock::{MockCommandConfig, MockProcessRunner};
pub use process::{LineCallback, Process, ProcessState, ProcessStdin};
pub use runner::{ForkExecRunner, ProcessCommand, ProcessOutput, ProcessRunner};
pub use stream::{Mode, ReadStream, StreamBuffer, WriteStream};

use std::sync::Arc;

use crate::config::Settings;

#[derive(Clone)]
pub struct SubprocessManager {
    runner: Arc<dyn ProcessRunner>,
}

impl SubprocessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    pub fn production() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self::new(Arc::new(ForkExecRunner::new(settings)))
    }

    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let runner = Arc::new(mock.clone()) as Arc<dyn ProcessRunner>;
        (Self::new(runner), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }
}
