//! Child-process controller.
//!
//! A [`Process`] owns one child from launch to reaping. After
//! [`start`](Process::start) the child's stdin/stdout/stderr are available as
//! [`StreamBuffer`](super::stream::StreamBuffer)s and a monitor thread waits
//! for the child to exit so that [`running`](Process::running) stays accurate
//! without the caller ever blocking.
//!
//! The monitor is the only reaper and it reaps while holding the lifecycle
//! mutex. Everything else (explicit waits, `kill`, `running`) reads the
//! lifecycle under the same mutex, so the exit status is recorded exactly once
//! and a signal can never reach a recycled pid.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::builder::ProcessConfig;
use super::error::{ProcessError, UsageError};
use super::exit::{wait_for_pid, ExitStatus, UNKNOWN_EXIT_CODE};
use super::spawn::{spawn, SpawnedChild, StdioPlan};
use super::stream::{ReadStream, WriteStream};
use crate::config::Settings;

/// Handler invoked with each captured line, terminator included.
pub type LineCallback = Box<dyn FnMut(&str) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Exited,
    /// Launched detached; its lifecycle belongs to the OS.
    Detached,
}

#[derive(Debug)]
struct Lifecycle {
    state: ProcessState,
    pid: Option<Pid>,
    status: Option<ExitStatus>,
    started_at: Option<Instant>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: ProcessState::NotStarted,
            pid: None,
            status: None,
            started_at: None,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    exited: Condvar,
    // Separate from the lifecycle so a writer blocked on a full pipe never
    // holds up `running()` or the monitor.
    stdin: Mutex<Option<WriteStream>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::new()),
            exited: Condvar::new(),
            stdin: Mutex::new(None),
        }
    }

    fn record_exit(&self, lifecycle: &mut Lifecycle, status: ExitStatus) {
        lifecycle.state = ProcessState::Exited;
        lifecycle.status = Some(status);
        self.exited.notify_all();

        let pid = lifecycle.pid.map(Pid::as_raw).unwrap_or_default();
        let elapsed = lifecycle.started_at.map(|start| start.elapsed());
        match status {
            ExitStatus::Signal(_) => {
                tracing::warn!("Process {} terminated by {} after {:?}", pid, status, elapsed)
            }
            _ => tracing::debug!("Process {} exited with {} after {:?}", pid, status, elapsed),
        }
    }

    /// Flush and release the stdin pipe so the child sees end-of-file.
    fn close_stdin(&self) {
        let stdin = lock(&self.stdin).take();
        if let Some(mut stdin) = stdin {
            if let Err(err) = stdin.flush() {
                tracing::debug!("Discarding unflushed stdin data: {}", err);
            }
        }
    }
}

/// Block until `pid` has terminated without reaping it.
#[cfg(target_os = "linux")]
fn await_termination(pid: Pid, poll_interval: Duration) {
    use nix::sys::wait::{waitid, Id};

    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                tracing::trace!("waitid({}) failed, polling instead: {}", pid, err);
                thread::sleep(poll_interval);
                return;
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn await_termination(_pid: Pid, poll_interval: Duration) {
    thread::sleep(poll_interval);
}

fn monitor(shared: &Shared, pid: Pid, poll_interval: Duration) {
    loop {
        await_termination(pid, poll_interval);

        let mut lifecycle = lock(&shared.lifecycle);
        if lifecycle.state != ProcessState::Running {
            break;
        }

        let status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => continue,
            Ok(status) => match ExitStatus::from_wait_status(status) {
                Some(status) => status,
                None => continue,
            },
            Err(err) => {
                tracing::warn!("waitpid({}) failed, exit status unknown: {}", pid, err);
                ExitStatus::Error(UNKNOWN_EXIT_CODE)
            }
        };
        shared.record_exit(&mut lifecycle, status);
        break;
    }

    shared.close_stdin();
}

fn drain_lines(mut stream: ReadStream, mut callback: LineCallback) {
    while let Some(line) = stream.next_line() {
        callback(&line);
    }
}

/// Writer half of the child's stdin.
///
/// Cheap to clone. Writes fail with `BrokenPipe` once stdin has been closed,
/// which happens on [`Process::wait_for_exit`], [`ProcessStdin::close`] or when
/// the child exits.
#[derive(Clone)]
pub struct ProcessStdin {
    shared: Arc<Shared>,
}

impl ProcessStdin {
    pub fn close(&self) {
        self.shared.close_stdin();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.stdin).is_none()
    }
}

impl Write for ProcessStdin {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match lock(&self.shared.stdin).as_mut() {
            Some(stream) => stream.write(data),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "child stdin is closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.shared.stdin).as_mut() {
            Some(stream) => stream.flush(),
            None => Ok(()),
        }
    }
}

pub struct Process {
    config: ProcessConfig,
    settings: Settings,
    shared: Arc<Shared>,
    stdout: Option<ReadStream>,
    stderr: Option<ReadStream>,
    on_output: Option<LineCallback>,
    on_error: Option<LineCallback>,
    monitor: Option<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
}

impl Process {
    pub fn new(config: ProcessConfig) -> Self {
        Self::with_settings(config, Settings::default())
    }

    pub fn with_settings(config: ProcessConfig, settings: Settings) -> Self {
        Self {
            config,
            settings,
            shared: Arc::new(Shared::new()),
            stdout: None,
            stderr: None,
            on_output: None,
            on_error: None,
            monitor: None,
            readers: Vec::new(),
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Edits only matter before [`start`](Self::start); a running child keeps
    /// the configuration it was launched with.
    pub fn config_mut(&mut self) -> &mut ProcessConfig {
        &mut self.config
    }

    /// Route every stdout line to `callback` on a dedicated thread. Must be set
    /// before `start`; stdout is then owned by that thread.
    pub fn on_output_line<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_output = Some(Box::new(callback));
        self
    }

    /// Same as [`on_output_line`](Self::on_output_line) for stderr.
    pub fn on_error_line<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Launch the child without waiting for it.
    ///
    /// On error no child is left behind and the process stays `NotStarted`.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        if self.state() != ProcessState::NotStarted {
            return Err(UsageError::AlreadyStarted.into());
        }

        let child = spawn(&self.config, StdioPlan::Piped, &self.settings.null_device)?;
        let pid = child.pid;

        {
            let mut lifecycle = lock(&self.shared.lifecycle);
            lifecycle.pid = Some(pid);
            lifecycle.started_at = Some(Instant::now());
            lifecycle.state = if self.config.detached {
                ProcessState::Detached
            } else {
                ProcessState::Running
            };
        }

        if self.config.detached {
            tracing::debug!("Process {} detached; not monitoring", pid);
            return Ok(());
        }

        if let Err(err) = self.attach(child) {
            tracing::warn!("Abandoning launch of process {}: {}", pid, err);
            self.abort_launch();
            return Err(err);
        }

        Ok(())
    }

    /// Wrap the child's pipes and start the monitor and callback threads.
    fn attach(&mut self, child: SpawnedChild) -> Result<(), ProcessError> {
        let pid = child.pid;
        let capacity = self.settings.buffer_size;
        *lock(&self.shared.stdin) = child
            .stdin
            .map(|fd| WriteStream::with_capacity(fd, capacity));
        let stdout = child.stdout.map(|fd| ReadStream::with_capacity(fd, capacity));
        let stderr = child.stderr.map(|fd| ReadStream::with_capacity(fd, capacity));

        let shared = Arc::clone(&self.shared);
        let poll_interval = self.settings.poll_interval;
        self.monitor = Some(
            thread::Builder::new()
                .name(format!("procpipe-monitor-{}", pid))
                .spawn(move || monitor(&shared, pid, poll_interval))?,
        );

        let on_output = self.on_output.take();
        self.stdout = self.attach_callback(stdout, on_output, "stdout")?;
        let on_error = self.on_error.take();
        self.stderr = self.attach_callback(stderr, on_error, "stderr")?;

        Ok(())
    }

    /// Kill and reap a child whose helper threads could not all be started,
    /// then return to `NotStarted`. Line callbacks already handed to a thread
    /// are gone and must be registered again before the next `start`.
    fn abort_launch(&mut self) {
        match self.kill(Signal::SIGKILL) {
            Ok(()) | Err(ProcessError::Usage(UsageError::NotRunning)) => {}
            Err(err) => tracing::warn!("Killing abandoned process failed: {}", err),
        }
        self.shared.close_stdin();

        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                tracing::warn!("Process monitor thread panicked");
            }
        }
        self.reap_blocking();

        self.stdout = None;
        self.stderr = None;
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                tracing::warn!("Line callback thread panicked");
            }
        }

        *lock(&self.shared.lifecycle) = Lifecycle::new();
    }

    fn attach_callback(
        &mut self,
        stream: Option<ReadStream>,
        callback: Option<LineCallback>,
        name: &str,
    ) -> Result<Option<ReadStream>, ProcessError> {
        match (stream, callback) {
            (Some(stream), Some(callback)) => {
                let handle = thread::Builder::new()
                    .name(format!("procpipe-{}", name))
                    .spawn(move || drain_lines(stream, callback))?;
                self.readers.push(handle);
                Ok(None)
            }
            (stream, _) => Ok(stream),
        }
    }

    /// Launch and, unless detached, block until the child exits.
    ///
    /// Returns the exit code, or `None` for a detached child.
    pub fn run(&mut self) -> Result<Option<i32>, ProcessError> {
        self.start()?;
        if self.config.detached {
            return Ok(None);
        }
        self.wait_for_exit().map(Some)
    }

    fn check_waitable(&self) -> Result<(), ProcessError> {
        match self.state() {
            ProcessState::NotStarted => Err(UsageError::NotStarted.into()),
            ProcessState::Detached => Err(UsageError::Detached.into()),
            ProcessState::Running | ProcessState::Exited => Ok(()),
        }
    }

    /// Close stdin and block until the child has exited.
    ///
    /// Repeated calls return the same code without waiting again. stdout and
    /// stderr stay readable afterwards; whatever the child wrote before
    /// exiting is still in the pipes.
    pub fn wait_for_exit(&mut self) -> Result<i32, ProcessError> {
        self.check_waitable()?;
        self.shared.close_stdin();
        if self.monitor.is_none() {
            self.reap_blocking();
        }

        let mut lifecycle = lock(&self.shared.lifecycle);
        while lifecycle.state == ProcessState::Running {
            lifecycle = self
                .shared
                .exited
                .wait(lifecycle)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(lifecycle.exit_code().unwrap_or(UNKNOWN_EXIT_CODE))
    }

    /// Wait at most `timeout` for the child to exit. Pending stdin data is
    /// flushed but stdin stays open. `Ok(None)` means the child is still
    /// running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<i32>, ProcessError> {
        self.check_waitable()?;
        if let Err(err) = self.stdin_flush() {
            tracing::debug!("Flushing stdin before timed wait failed: {}", err);
        }

        let (lifecycle, _) = self
            .shared
            .exited
            .wait_timeout_while(lock(&self.shared.lifecycle), timeout, |lifecycle| {
                lifecycle.state == ProcessState::Running
            })
            .unwrap_or_else(PoisonError::into_inner);

        match lifecycle.state {
            ProcessState::Exited => Ok(Some(lifecycle.exit_code().unwrap_or(UNKNOWN_EXIT_CODE))),
            _ => Ok(None),
        }
    }

    fn stdin_flush(&self) -> io::Result<()> {
        // A writer blocked on a full pipe holds the lock and flushes on its own.
        let mut stdin = match self.shared.stdin.try_lock() {
            Ok(stdin) => stdin,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(()),
        };
        match stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }

    /// Reap synchronously. Only used when no monitor thread exists.
    fn reap_blocking(&self) {
        let mut lifecycle = lock(&self.shared.lifecycle);
        if lifecycle.state != ProcessState::Running {
            return;
        }
        let Some(pid) = lifecycle.pid else {
            return;
        };

        let status = wait_for_pid(pid);
        self.shared.record_exit(&mut lifecycle, status);
    }

    /// Send `signal` to the child. Valid while it is running or detached.
    pub fn kill(&self, signal: Signal) -> Result<(), ProcessError> {
        let lifecycle = lock(&self.shared.lifecycle);
        match (lifecycle.state, lifecycle.pid) {
            (ProcessState::Running | ProcessState::Detached, Some(pid)) => {
                tracing::debug!("Sending {} to process {}", signal, pid);
                nix::sys::signal::kill(pid, signal).map_err(|source| ProcessError::Signal {
                    pid: pid.as_raw(),
                    source,
                })
            }
            (ProcessState::NotStarted, _) => Err(UsageError::NotStarted.into()),
            _ => Err(UsageError::NotRunning.into()),
        }
    }

    pub fn terminate(&self) -> Result<(), ProcessError> {
        self.kill(Signal::SIGTERM)
    }

    pub fn state(&self) -> ProcessState {
        lock(&self.shared.lifecycle).state
    }

    pub fn running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn is_detached(&self) -> bool {
        self.config.detached
    }

    pub fn pid(&self) -> Option<Pid> {
        lock(&self.shared.lifecycle).pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.shared.lifecycle).exit_code()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        lock(&self.shared.lifecycle).status
    }

    /// Writer for the child's stdin, if it is still open.
    pub fn stdin(&self) -> Option<ProcessStdin> {
        lock(&self.shared.stdin).is_some().then(|| ProcessStdin {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Write `data` to the child's stdin and flush it.
    pub fn write_stdin(&self, data: &[u8]) -> io::Result<()> {
        match lock(&self.shared.stdin).as_mut() {
            Some(stdin) => {
                stdin.write_all(data)?;
                stdin.flush()
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "child stdin is closed",
            )),
        }
    }

    pub fn close_stdin(&self) {
        self.shared.close_stdin();
    }

    /// stdout, unless it was never connected, handed to a callback, or taken.
    pub fn stdout_mut(&mut self) -> Option<&mut ReadStream> {
        self.stdout.as_mut()
    }

    pub fn stderr_mut(&mut self) -> Option<&mut ReadStream> {
        self.stderr.as_mut()
    }

    pub fn take_stdout(&mut self) -> Option<ReadStream> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ReadStream> {
        self.stderr.take()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // Close stdin first: a child reading until end-of-file would otherwise
        // never exit and the join below would hang.
        self.shared.close_stdin();

        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                tracing::warn!("Process monitor thread panicked");
            }
        }

        if self.state() == ProcessState::Running {
            self.reap_blocking();
        }

        self.stdout = None;
        self.stderr = None;

        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                tracing::warn!("Line callback thread panicked");
            }
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = lock(&self.shared.lifecycle);
        f.debug_struct("Process")
            .field("command", &self.config.display_command())
            .field("state", &lifecycle.state)
            .field("pid", &lifecycle.pid)
            .field("status", &lifecycle.status)
            .finish_non_exhaustive()
    }
}
