//! Owned pipe endpoints.
//!
//! Both ends of a pipe are `OwnedFd`s. An end is released exactly once, when
//! whoever ends up owning it (a stream adapter, the spawn primitive, or this
//! struct) drops it. Pipes are created close-on-exec so that no child other
//! than the one they were made for inherits them.

use std::os::fd::OwnedFd;

use super::error::ProcessError;

#[derive(Debug)]
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    /// Allocate a pipe. `stream` names the standard stream it will carry and
    /// only shows up in the error.
    pub fn new(stream: &'static str) -> Result<Self, ProcessError> {
        let (read, write) =
            create_cloexec_pipe().map_err(|source| ProcessError::PipeFailed { stream, source })?;
        Ok(Self { read, write })
    }

    pub fn into_ends(self) -> (OwnedFd, OwnedFd) {
        (self.read, self.write)
    }
}

#[cfg(target_os = "linux")]
fn create_cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::OFlag;
    nix::unistd::pipe2(OFlag::O_CLOEXEC)
}

#[cfg(not(target_os = "linux"))]
fn create_cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::AsRawFd;

    let (read, write) = nix::unistd::pipe()?;
    for fd in [read.as_raw_fd(), write.as_raw_fd()] {
        // SAFETY: `fd` is a descriptor we own for the duration of the call.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(nix::Error::last());
        }
    }
    Ok((read, write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_pipe_carries_bytes() {
        let (read, write) = Pipe::new("stdout").unwrap().into_ends();
        let mut writer = File::from(write);
        writer.write_all(b"ping").unwrap();
        drop(writer);

        let mut reader = File::from(read);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ping");
    }

    #[test]
    fn test_pipe_ends_are_close_on_exec() {
        let pipe = Pipe::new("stdin").unwrap();
        for fd in [pipe.read.as_raw_fd(), pipe.write.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0);
        }
    }
}
