//! The fork/exec/redirect sequence shared by [`Process`](super::Process) and
//! [`run_command`](super::run_command).
//!
//! Everything the child needs (C strings, pointer arrays, descriptor numbers)
//! is prepared before `fork`. Between `fork` and `exec` the child only makes
//! async-signal-safe libc calls on that memory and never allocates, so this is
//! sound even when the parent has other threads.

use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::{c_char, CString};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::builder::ProcessConfig;
use super::error::ProcessError;
use super::exit::EXEC_FAILED_EXIT_CODE;
use super::pipe::Pipe;

/// Which of the child's standard streams get connected to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioPlan {
    /// stdin, stdout and stderr each get their own pipe.
    Piped,
    /// stdout and stderr share one pipe; stdin is inherited.
    Combined,
    /// All three are inherited from the parent.
    Inherit,
}

/// Parent-side ends of whatever was connected, plus the child's pid.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: Pid,
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// What fd 0/1/2 become in the child.
#[derive(Debug, Clone, Copy)]
enum Target {
    Inherit,
    Null,
    Fd(RawFd),
}

struct ChildStdio {
    stdin: Target,
    stdout: Target,
    stderr: Target,
}

impl ChildStdio {
    fn needs_null(&self) -> bool {
        [self.stdin, self.stdout, self.stderr]
            .iter()
            .any(|target| matches!(target, Target::Null))
    }
}

/// Launch image prepared ahead of `fork`.
struct PreparedExec {
    program: CString,
    // Owns the strings `argv_ptrs` points into.
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    env: Option<(Vec<CString>, Vec<*const c_char>)>,
    working_dir: Option<CString>,
    null_device: CString,
}

fn c_string(bytes: &[u8], what: impl FnOnce() -> String) -> Result<CString, ProcessError> {
    CString::new(bytes).map_err(|_| ProcessError::InvalidArgument { what: what() })
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

impl PreparedExec {
    fn new(config: &ProcessConfig, null_device: &Path) -> Result<Self, ProcessError> {
        let program = c_string(config.program.as_os_str().as_bytes(), || {
            format!("program path {:?}", config.program)
        })?;

        let mut argv = Vec::with_capacity(config.args.len() + 1);
        argv.push(program.clone());
        for arg in &config.args {
            argv.push(c_string(arg.as_bytes(), || format!("argument {:?}", arg))?);
        }
        let argv_ptrs = null_terminated(&argv);

        let env = match config.env.entries() {
            Some(entries) => {
                let vars = entries
                    .iter()
                    .map(|entry| {
                        c_string(entry.as_bytes(), || format!("environment entry {:?}", entry))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let ptrs = null_terminated(&vars);
                Some((vars, ptrs))
            }
            None => None,
        };

        let working_dir = config
            .working_dir
            .as_ref()
            .map(|dir| {
                c_string(dir.as_os_str().as_bytes(), || {
                    format!("working directory {:?}", dir)
                })
            })
            .transpose()?;

        let null_device = c_string(null_device.as_os_str().as_bytes(), || {
            format!("null device {:?}", null_device)
        })?;

        Ok(Self {
            program,
            _argv: argv,
            argv_ptrs,
            env,
            working_dir,
            null_device,
        })
    }
}

/// Log launch details before forking.
fn log_launch(config: &ProcessConfig, plan: StdioPlan) {
    tracing::debug!(
        "Launching subprocess: {} (stdio: {:?}, detached: {})",
        config.display_command(),
        plan,
        config.detached
    );

    match &config.env.entries() {
        Some(entries) => {
            tracing::debug!("Replacing child environment with {} entries", entries.len());
            tracing::trace!("Environment: {:?}", entries);
        }
        None => tracing::trace!("Child inherits the parent environment"),
    }

    if let Some(dir) = &config.working_dir {
        tracing::trace!("Working directory: {:?}", dir);
    }
}

/// Fork and exec `config`.
///
/// A detached launch ignores `plan`: the child starts a new session with all
/// three streams on `null_device`. Pipe or fork failures return an error with
/// no child created and every descriptor already released.
pub fn spawn(
    config: &ProcessConfig,
    plan: StdioPlan,
    null_device: &Path,
) -> Result<SpawnedChild, ProcessError> {
    log_launch(config, plan);
    let prepared = PreparedExec::new(config, null_device)?;

    // Child-side ends live here until the fork, then are dropped in the
    // parent. The child loses them at exec through close-on-exec.
    let mut child_ends: Vec<OwnedFd> = Vec::new();
    let mut parent = SpawnedChild {
        pid: Pid::from_raw(0),
        stdin: None,
        stdout: None,
        stderr: None,
    };

    let stdio = if config.detached {
        ChildStdio {
            stdin: Target::Null,
            stdout: Target::Null,
            stderr: Target::Null,
        }
    } else {
        match plan {
            StdioPlan::Piped => {
                let (stdin_read, stdin_write) = Pipe::new("stdin")?.into_ends();
                let (stdout_read, stdout_write) = Pipe::new("stdout")?.into_ends();
                let (stderr_read, stderr_write) = Pipe::new("stderr")?.into_ends();

                let stdio = ChildStdio {
                    stdin: Target::Fd(stdin_read.as_raw_fd()),
                    stdout: Target::Fd(stdout_write.as_raw_fd()),
                    stderr: Target::Fd(stderr_write.as_raw_fd()),
                };
                child_ends.extend([stdin_read, stdout_write, stderr_write]);
                parent.stdin = Some(stdin_write);
                parent.stdout = Some(stdout_read);
                parent.stderr = Some(stderr_read);
                stdio
            }
            StdioPlan::Combined => {
                let (read, write) = Pipe::new("output")?.into_ends();
                let stdio = ChildStdio {
                    stdin: Target::Inherit,
                    stdout: Target::Fd(write.as_raw_fd()),
                    stderr: Target::Fd(write.as_raw_fd()),
                };
                child_ends.push(write);
                parent.stdout = Some(read);
                stdio
            }
            StdioPlan::Inherit => ChildStdio {
                stdin: Target::Inherit,
                stdout: Target::Inherit,
                stderr: Target::Inherit,
            },
        }
    };

    // SAFETY: the child branch only runs `exec_child`, which restricts itself
    // to async-signal-safe calls on memory prepared above and never returns.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => unsafe { exec_child(&prepared, &stdio, config.detached) },
        Ok(ForkResult::Parent { child }) => {
            drop(child_ends);
            parent.pid = child;
            tracing::debug!("Spawned pid {} for {}", child, config.display_command());
            Ok(parent)
        }
        Err(source) => {
            tracing::error!("fork failed for '{}': {}", config.display_command(), source);
            Err(ProcessError::SpawnFailed {
                command: config.display_command(),
                source,
            })
        }
    }
}

/// Point `std_fd` at `source`. dup2 onto itself would leave close-on-exec set,
/// so in that case the flag is cleared instead.
unsafe fn redirect(source: RawFd, std_fd: RawFd) -> bool {
    if source == std_fd {
        let flags = libc::fcntl(source, libc::F_GETFD);
        flags != -1 && libc::fcntl(source, libc::F_SETFD, flags & !libc::FD_CLOEXEC) != -1
    } else {
        libc::dup2(source, std_fd) != -1
    }
}

/// Child side of the fork. Never returns.
unsafe fn exec_child(prepared: &PreparedExec, stdio: &ChildStdio, detached: bool) -> ! {
    if detached {
        libc::setsid();
    }
    // Ignored dispositions survive exec; the parent runtime ignores SIGPIPE.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    let null_fd = if stdio.needs_null() {
        libc::open(prepared.null_device.as_ptr(), libc::O_RDWR)
    } else {
        -1
    };

    let targets = [
        (stdio.stdin, libc::STDIN_FILENO),
        (stdio.stdout, libc::STDOUT_FILENO),
        (stdio.stderr, libc::STDERR_FILENO),
    ];
    for (target, std_fd) in targets {
        let redirected = match target {
            Target::Inherit => true,
            Target::Fd(fd) => redirect(fd, std_fd),
            Target::Null => null_fd != -1 && redirect(null_fd, std_fd),
        };
        if !redirected {
            libc::_exit(EXEC_FAILED_EXIT_CODE);
        }
    }
    if null_fd > libc::STDERR_FILENO {
        libc::close(null_fd);
    }

    if let Some(dir) = &prepared.working_dir {
        if libc::chdir(dir.as_ptr()) != 0 {
            libc::_exit(EXEC_FAILED_EXIT_CODE);
        }
    }

    match &prepared.env {
        Some((_, envp)) => {
            libc::execve(
                prepared.program.as_ptr(),
                prepared.argv_ptrs.as_ptr(),
                envp.as_ptr(),
            );
        }
        None => {
            libc::execvp(prepared.program.as_ptr(), prepared.argv_ptrs.as_ptr());
        }
    }

    libc::_exit(EXEC_FAILED_EXIT_CODE)
}
