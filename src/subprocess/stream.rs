//! Buffered byte streams over a single pipe descriptor.
//!
//! A [`StreamBuffer`] owns exactly one descriptor and one fixed-size buffer.
//! Its direction is part of its type: `StreamBuffer<ReadMode>` only
//! implements [`Read`]/[`BufRead`] and `StreamBuffer<WriteMode>` only
//! implements [`Write`], so a stdin adapter can never be read from and a
//! stdout adapter can never be written to.
//!
//! Each refill or flush is exactly one OS call. Read errors other than
//! `Interrupted` are reported as end-of-stream; write errors surface from
//! `write`/`flush`. Nothing is retried internally.

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, Read, Write};
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Default buffer capacity. Matches `PIPE_BUF` on Linux, so a full-buffer
/// flush into a pipe is a single atomic write.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

mod sealed {
    pub trait Sealed {}
}

pub trait StreamMode: sealed::Sealed + Send + 'static {
    const MODE: Mode;
}

#[derive(Debug)]
pub struct ReadMode;

#[derive(Debug)]
pub struct WriteMode;

impl sealed::Sealed for ReadMode {}
impl sealed::Sealed for WriteMode {}

impl StreamMode for ReadMode {
    const MODE: Mode = Mode::Read;
}

impl StreamMode for WriteMode {
    const MODE: Mode = Mode::Write;
}

pub type ReadStream = StreamBuffer<ReadMode>;
pub type WriteStream = StreamBuffer<WriteMode>;

pub struct StreamBuffer<M: StreamMode> {
    file: File,
    buffer: Box<[u8]>,
    // Read mode: next unread byte. Unused in write mode.
    pos: usize,
    // Read mode: end of valid data. Write mode: number of pending bytes.
    filled: usize,
    _mode: PhantomData<M>,
}

impl<M: StreamMode> StreamBuffer<M> {
    pub fn new(fd: OwnedFd) -> Self {
        Self::with_capacity(fd, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(fd: OwnedFd, capacity: usize) -> Self {
        Self {
            file: File::from(fd),
            buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
            pos: 0,
            filled: 0,
            _mode: PhantomData,
        }
    }

    pub fn mode(&self) -> Mode {
        M::MODE
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Write out the pending region with one OS call.
    ///
    /// On a short write the unwritten tail stays buffered and the call fails,
    /// leaving any retry to the caller.
    fn flush_pending(&mut self) -> io::Result<()> {
        if self.filled == 0 {
            return Ok(());
        }

        let pending = self.filled;
        match self.file.write(&self.buffer[..pending])? {
            0 => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write buffered data",
            )),
            n if n == pending => {
                self.filled = 0;
                Ok(())
            }
            n => {
                self.buffer.copy_within(n..pending, 0);
                self.filled = pending - n;
                Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {} of {} buffered bytes", n, pending),
                ))
            }
        }
    }
}

impl StreamBuffer<ReadMode> {
    /// Bytes already sitting in the internal buffer.
    pub fn available(&self) -> usize {
        self.filled - self.pos
    }

    /// Whether a read on the underlying descriptor would return without
    /// blocking, either because data is waiting or because the writer side is
    /// gone. Checked with a zero-timeout poll; never reads.
    ///
    /// This says nothing about [`available`](Self::available): bytes that are
    /// already buffered do not count here.
    pub fn has_data(&self) -> bool {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(ready) => ready > 0,
            Err(err) => {
                tracing::trace!("poll on fd {} failed: {}", self.file.as_raw_fd(), err);
                false
            }
        }
    }

    /// Read one line including its terminator, decoding lossily.
    ///
    /// Returns `None` at end-of-stream.
    pub fn next_line(&mut self) -> Option<String> {
        let mut raw = Vec::new();
        loop {
            match self.read_until(b'\n', &mut raw) {
                Ok(0) if raw.is_empty() => return None,
                Ok(_) => return Some(String::from_utf8_lossy(&raw).into_owned()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    return (!raw.is_empty()).then(|| String::from_utf8_lossy(&raw).into_owned())
                }
            }
        }
    }

    fn read_source(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
        match file.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Err(err),
            Err(err) => {
                tracing::debug!(
                    "read on fd {} failed, treating as end of stream: {}",
                    file.as_raw_fd(),
                    err
                );
                Ok(0)
            }
        }
    }
}

impl Read for StreamBuffer<ReadMode> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        // Large reads with nothing buffered go straight to the descriptor.
        if self.pos == self.filled && out.len() >= self.buffer.len() {
            return Self::read_source(&mut self.file, out);
        }

        let n = {
            let available = self.fill_buf()?;
            let n = available.len().min(out.len());
            out[..n].copy_from_slice(&available[..n]);
            n
        };
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for StreamBuffer<ReadMode> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.filled {
            let n = Self::read_source(&mut self.file, &mut self.buffer)?;
            self.pos = 0;
            self.filled = n;
        }
        Ok(&self.buffer[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.filled);
    }
}

impl StreamBuffer<WriteMode> {
    /// Bytes accepted but not yet handed to the OS.
    pub fn buffered(&self) -> usize {
        self.filled
    }
}

impl Write for StreamBuffer<WriteMode> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        if self.filled == self.buffer.len() {
            self.flush_pending()?;
        }

        // Nothing pending and the chunk would not fit anyway: skip the copy.
        if self.filled == 0 && data.len() >= self.buffer.len() {
            return self.file.write(data);
        }

        let n = (self.buffer.len() - self.filled).min(data.len());
        self.buffer[self.filled..self.filled + n].copy_from_slice(&data[..n]);
        self.filled += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()
    }
}

impl<M: StreamMode> Drop for StreamBuffer<M> {
    fn drop(&mut self) {
        if M::MODE == Mode::Write {
            if let Err(err) = self.flush_pending() {
                tracing::debug!(
                    "dropping {} unflushed bytes on fd {}: {}",
                    self.filled,
                    self.file.as_raw_fd(),
                    err
                );
            }
        }
    }
}

impl<M: StreamMode> AsFd for StreamBuffer<M> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl<M: StreamMode> AsRawFd for StreamBuffer<M> {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl<M: StreamMode> fmt::Debug for StreamBuffer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("mode", &M::MODE)
            .field("fd", &self.file.as_raw_fd())
            .field("capacity", &self.buffer.len())
            .field("filled", &self.filled)
            .finish()
    }
}
