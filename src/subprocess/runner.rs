use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::builder::ProcessConfig;
use super::error::{ProcessError, UsageError};
use super::exit::{ExitStatus, UNKNOWN_EXIT_CODE};
use super::process::Process;
use crate::config::Settings;

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub config: ProcessConfig,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl ProcessCommand {
    pub fn display_command(&self) -> String {
        self.config.display_command()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands through [`Process`] on tokio's blocking pool.
#[derive(Debug, Clone, Default)]
pub struct ForkExecRunner {
    settings: Settings,
}

type Collected = Arc<Mutex<String>>;

fn collector() -> Collected {
    Arc::new(Mutex::new(String::new()))
}

fn take_collected(collected: &Collected) -> String {
    std::mem::take(&mut *collected.lock().unwrap_or_else(PoisonError::into_inner))
}

impl ForkExecRunner {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn log_command_start(command: &ProcessCommand) {
        tracing::debug!("Executing subprocess: {}", command.display_command());

        if let Some(entries) = command.config.env.entries() {
            tracing::debug!(
                "Replacement environment: {} variables, {} bytes",
                entries.len(),
                entries.iter().map(|entry| entry.len() + 1).sum::<usize>()
            );
            tracing::trace!("Environment variables: {:?}", entries);
        }

        if let Some(ref dir) = command.config.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }

        if let Some(ref stdin) = command.stdin {
            tracing::trace!("Stdin provided: {} bytes", stdin.len());
        }
    }

    fn log_result(result: &ProcessOutput, command_str: &str) {
        match &result.status {
            ExitStatus::Success => {
                tracing::debug!(
                    "Subprocess completed successfully in {:?}: {}",
                    result.duration,
                    command_str
                );
                tracing::trace!("Stdout length: {} bytes", result.stdout.len());
                tracing::trace!("Stderr length: {} bytes", result.stderr.len());
            }
            ExitStatus::Error(code) => {
                tracing::debug!(
                    "Subprocess failed with exit code {} in {:?}: {}",
                    code,
                    result.duration,
                    command_str
                );
                if !result.stderr.is_empty() {
                    tracing::trace!("Stderr: {}", result.stderr);
                }
            }
            ExitStatus::Signal(signal) => {
                tracing::warn!(
                    "Subprocess terminated by signal {} in {:?}: {}",
                    signal,
                    result.duration,
                    command_str
                );
            }
            ExitStatus::Timeout => {
                tracing::warn!(
                    "Subprocess timed out after {:?}: {}",
                    result.duration,
                    command_str
                );
            }
        }
    }

    /// Write `input` to the child's stdin on its own thread, then close it.
    /// The write ends with `BrokenPipe` once the child is gone.
    fn feed_stdin(
        process: &Process,
        input: String,
    ) -> Result<Option<JoinHandle<()>>, ProcessError> {
        let Some(mut stdin) = process.stdin() else {
            return Ok(None);
        };
        let writer = thread::Builder::new()
            .name("procpipe-stdin".to_string())
            .spawn(move || {
                let written = stdin.write_all(input.as_bytes()).and_then(|()| stdin.flush());
                if let Err(err) = written {
                    tracing::debug!("Writing stdin failed: {}", err);
                }
                stdin.close();
            })?;
        Ok(Some(writer))
    }

    fn join_writer(writer: Option<JoinHandle<()>>) {
        if let Some(writer) = writer {
            if writer.join().is_err() {
                tracing::warn!("Stdin writer thread panicked");
            }
        }
    }

    /// Launch, feed stdin, wait (bounded by the command's timeout) and
    /// collect both output streams. Blocks the calling thread.
    fn run_blocking(
        command: ProcessCommand,
        settings: Settings,
    ) -> Result<ProcessOutput, ProcessError> {
        if command.config.detached {
            return Err(UsageError::Detached.into());
        }

        let started = Instant::now();
        let stdout = collector();
        let stderr = collector();

        let mut process = Process::with_settings(command.config, settings);
        let sink = Arc::clone(&stdout);
        process.on_output_line(move |line| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_str(line)
        });
        let sink = Arc::clone(&stderr);
        process.on_error_line(move |line| {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_str(line)
        });
        process.start()?;

        let mut writer = match command.stdin {
            Some(input) => Self::feed_stdin(&process, input)?,
            None => {
                process.close_stdin();
                None
            }
        };

        // The timed wait leaves stdin open, so it runs alongside the writer.
        let exited = match command.timeout {
            Some(timeout) => process.wait_timeout(timeout)?,
            None => {
                Self::join_writer(writer.take());
                Some(process.wait_for_exit()?)
            }
        };

        if exited.is_none() {
            if let Some(timeout) = command.timeout {
                match process.kill(Signal::SIGKILL) {
                    Ok(()) | Err(ProcessError::Usage(UsageError::NotRunning)) => {}
                    Err(err) => tracing::warn!("Killing timed out subprocess failed: {}", err),
                }
                // Dropping reaps the child and joins the readers.
                drop(process);
                Self::join_writer(writer);
                return Err(ProcessError::Timeout(timeout));
            }
        }

        let status = process.exit_status().unwrap_or(ExitStatus::Error(UNKNOWN_EXIT_CODE));
        drop(process);
        Self::join_writer(writer);

        Ok(ProcessOutput {
            status,
            stdout: take_collected(&stdout),
            stderr: take_collected(&stderr),
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl ProcessRunner for ForkExecRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        Self::log_command_start(&command);
        let command_str = command.display_command();
        let settings = self.settings.clone();

        let result = tokio::task::spawn_blocking(move || Self::run_blocking(command, settings))
            .await
            .map_err(|err| ProcessError::Io(io::Error::other(err)))?;

        match &result {
            Ok(output) => Self::log_result(output, &command_str),
            Err(ProcessError::Timeout(timeout)) => {
                tracing::warn!("Subprocess timed out after {:?}: {}", timeout, command_str)
            }
            Err(err) => tracing::debug!("Subprocess {} failed: {}", command_str, err),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::builder::ProcessCommandBuilder;

    #[tokio::test]
    async fn test_stdout_and_stderr_are_kept_apart() {
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "echo out; echo err 1>&2"])
            .build();

        let output = ForkExecRunner::default().run(command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_signal_exit_is_reported() {
        let command = ProcessCommandBuilder::new("sh")
            .args(["-c", "kill -TERM $$"])
            .build();

        let output = ForkExecRunner::default().run(command).await.unwrap();
        assert_eq!(output.status, ExitStatus::Signal(15));
        assert_eq!(output.status.code(), Some(143));
    }

    #[tokio::test]
    async fn test_detached_command_is_rejected() {
        let command = ProcessCommandBuilder::new("true").detached(true).build();

        let err = ForkExecRunner::default().run(command).await.unwrap_err();
        assert_eq!(err.usage(), Some(UsageError::Detached));
    }

    #[tokio::test]
    async fn test_timeout_kills_long_running_child() {
        let command = ProcessCommandBuilder::new("sleep")
            .arg("10")
            .timeout(Duration::from_millis(100))
            .build();

        let started = Instant::now();
        let err = ForkExecRunner::default().run(command).await.unwrap_err();
        assert!(matches!(err, ProcessError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_holds_when_child_ignores_large_stdin() {
        let command = ProcessCommandBuilder::new("sleep")
            .arg("30")
            .stdin("x".repeat(1 << 20))
            .timeout(Duration::from_millis(200))
            .build();

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            ForkExecRunner::default().run(command),
        )
        .await
        .expect("runner ignored its timeout");
        assert!(matches!(result, Err(ProcessError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_large_stdin_is_delivered_before_timeout() {
        let input = "line\n".repeat(50_000);
        let command = ProcessCommandBuilder::new("cat")
            .stdin(input.clone())
            .timeout(Duration::from_secs(30))
            .build();

        let output = ForkExecRunner::default().run(command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), input.len());
    }

    #[tokio::test]
    async fn test_timeout_not_reached() {
        let command = ProcessCommandBuilder::new("echo")
            .arg("quick")
            .timeout(Duration::from_secs(10))
            .build();

        let output = ForkExecRunner::default().run(command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, "quick\n");
    }
}
