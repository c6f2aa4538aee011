//! Single-shot command execution.
//!
//! [`run_command`] is the fire-and-forget counterpart of
//! [`Process`](super::process::Process): no background monitor, no stdin, at
//! most one pipe carrying stdout and stderr together. It launches through the
//! same [`spawn`] primitive and blocks until the child exits unless detached.
//!
//! The command line is split on whitespace only. Quotes, escapes, globs and
//! other shell syntax are passed through literally; use
//! [`run_command_args`] (or `sh -c`) when an argument contains spaces.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use super::builder::ProcessConfig;
use super::error::{ProcessError, UsageError};
use super::exit::{wait_for_pid, ExitStatus};
use super::process::LineCallback;
use super::spawn::{spawn, StdioPlan};
use crate::config::Settings;

/// Split a command line into program and arguments on runs of whitespace.
pub fn split_command_line(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

/// Options for [`run_command`]. `Default` runs the command with the parent's
/// standard streams and waits for it.
#[derive(Default)]
pub struct RunOptions {
    /// Join stdout and stderr on one pipe and collect it.
    pub capture: bool,
    /// Also copy every captured line to the parent's stdout as it arrives.
    pub echo: bool,
    /// Launch in a new session with all streams on the null device and
    /// return without waiting.
    pub detach: bool,
    /// Receive captured lines here instead of accumulating them. Implies
    /// capture.
    pub on_line: Option<LineCallback>,
    pub settings: Settings,
}

impl RunOptions {
    pub fn capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    pub fn on_line<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_line = Some(Box::new(callback));
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    fn captures(&self) -> bool {
        self.capture || self.on_line.is_some()
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("capture", &self.capture)
            .field("echo", &self.echo)
            .field("detach", &self.detach)
            .field("on_line", &self.on_line.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` for a detached command.
    pub status: Option<ExitStatus>,
    /// Captured stdout and stderr, interleaved as the child wrote them. Empty
    /// when nothing was captured or every line went to a callback.
    pub output: String,
}

impl CommandOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }
}

/// Tokenize `command_line` and run it.
pub fn run_command(
    command_line: &str,
    options: RunOptions,
) -> Result<CommandOutcome, ProcessError> {
    let mut words = split_command_line(command_line).into_iter();
    let program = words.next().ok_or(UsageError::EmptyCommand)?;
    run_command_args(&program, words.collect(), options)
}

/// Run `program` with pre-split `args`.
pub fn run_command_args(
    program: &str,
    args: Vec<String>,
    mut options: RunOptions,
) -> Result<CommandOutcome, ProcessError> {
    if program.is_empty() {
        return Err(UsageError::EmptyCommand.into());
    }
    let capturing = options.captures();
    if capturing && options.detach {
        return Err(UsageError::CaptureWithDetach.into());
    }

    let mut config = ProcessConfig::new(PathBuf::from(program));
    config.args = args;
    config.detached = options.detach;

    let plan = if capturing {
        StdioPlan::Combined
    } else {
        StdioPlan::Inherit
    };
    let child = spawn(&config, plan, &options.settings.null_device)?;

    if options.detach {
        tracing::debug!("Detached {} as process {}", config.display_command(), child.pid);
        return Ok(CommandOutcome {
            status: None,
            output: String::new(),
        });
    }

    let mut output = String::new();
    if let Some(fd) = child.stdout {
        let mut reader = BufReader::with_capacity(options.settings.buffer_size, File::from(fd));
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!("Reading output of {} failed: {}", program, err);
                    break;
                }
            }

            let text = String::from_utf8_lossy(&line);
            if options.echo {
                echo_line(&text);
            }
            match options.on_line.as_mut() {
                Some(callback) => callback(&text),
                None => output.push_str(&text),
            }
        }
    }

    let status = wait_for_pid(child.pid);
    tracing::debug!("{} finished with {}", config.display_command(), status);
    Ok(CommandOutcome {
        status: Some(status),
        output,
    })
}

fn echo_line(line: &str) {
    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout.write_all(line.as_bytes()).and_then(|_| stdout.flush()) {
        tracing::trace!("Echoing captured output failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    #[test]
    fn test_split_collapses_whitespace() {
        assert_eq!(
            split_command_line("  ls \t-l   /tmp\n"),
            vec!["ls", "-l", "/tmp"]
        );
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn test_split_does_not_interpret_quotes() {
        assert_eq!(
            split_command_line("echo \"a b\""),
            vec!["echo", "\"a", "b\""]
        );
    }

    #[test]
    fn test_capture_collects_output() {
        let outcome = run_command("echo hello world", RunOptions::default().capture(true)).unwrap();
        assert_eq!(outcome.exit_code(), Some(0));
        assert!(outcome.success());
        assert_eq!(outcome.output, "hello world\n");
    }

    #[test]
    fn test_capture_joins_stderr() {
        let outcome = run_command_args(
            "sh",
            vec!["-c".into(), "echo out; echo err 1>&2; exit 4".into()],
            RunOptions::default().capture(true),
        )
        .unwrap();
        assert_eq!(outcome.exit_code(), Some(4));
        assert_eq!(outcome.output, "out\nerr\n");
    }

    #[test]
    fn test_callback_receives_lines_instead_of_buffer() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let outcome = run_command_args(
            "printf",
            vec!["a\\nb\\nc\\n".into()],
            RunOptions::default().on_line(move |line| sink.lock().unwrap().push(line.to_string())),
        )
        .unwrap();

        assert!(outcome.output.is_empty());
        assert_eq!(*lines.lock().unwrap(), vec!["a\n", "b\n", "c\n"]);
    }

    #[test]
    fn test_echo_still_accumulates() {
        let outcome = run_command(
            "echo visible",
            RunOptions::default().capture(true).echo(true),
        )
        .unwrap();
        assert_eq!(outcome.output, "visible\n");
    }

    #[test]
    fn test_uncaptured_command_reports_status() {
        let outcome = run_command("false", RunOptions::default()).unwrap();
        assert_eq!(outcome.exit_code(), Some(1));
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn test_capture_with_detach_is_rejected() {
        let err = run_command("sleep 1", RunOptions::default().capture(true).detach(true))
            .unwrap_err();
        assert_eq!(err.usage(), Some(UsageError::CaptureWithDetach));

        let err = run_command(
            "sleep 1",
            RunOptions::default().detach(true).on_line(|_| {}),
        )
        .unwrap_err();
        assert_eq!(err.usage(), Some(UsageError::CaptureWithDetach));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let err = run_command(" \t ", RunOptions::default()).unwrap_err();
        assert_eq!(err.usage(), Some(UsageError::EmptyCommand));
    }

    #[test]
    fn test_missing_program_exits_127() {
        let outcome = run_command(
            "procpipe-definitely-missing-binary --flag",
            RunOptions::default().capture(true),
        )
        .unwrap();
        assert_eq!(outcome.exit_code(), Some(127));
    }

    #[test]
    fn test_detached_returns_immediately() {
        let start = Instant::now();
        let outcome = run_command("sleep 2", RunOptions::default().detach(true)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.status, None);
        assert!(!outcome.success());
    }

    proptest! {
        #[test]
        fn test_split_recovers_words(
            words in prop::collection::vec("[a-zA-Z0-9_./-]{1,8}", 0..8),
            gaps in prop::collection::vec("[ \t]{1,3}", 9),
        ) {
            let mut line = gaps[0].clone();
            for (i, word) in words.iter().enumerate() {
                line.push_str(word);
                line.push_str(&gaps[i + 1]);
            }
            prop_assert_eq!(split_command_line(&line), words);
        }
    }
}
