use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::error::Result;

/// A connected rendezvous stream — implements `Read` + `Write`.
///
/// Wraps a Unix domain socket stream. The channel layer drives it either
/// blocking (simple variant) or nonblocking (the buffered variant's I/O
/// loop), switching with [`VchanStream::set_nonblocking`].
pub struct VchanStream {
    inner: UnixStream,
}

impl VchanStream {
    pub(crate) fn from_unix(stream: UnixStream) -> Self {
        Self { inner: stream }
    }

    /// Switch the stream between blocking and nonblocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.inner.set_nonblocking(nonblocking).map_err(Into::into)
    }

    /// Shut down both halves, waking any thread blocked on the descriptor.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown(Shutdown::Both).map_err(Into::into)
    }
}

impl Read for VchanStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Read for &VchanStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for VchanStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Write for &VchanStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&self.inner).flush()
    }
}

impl AsRawFd for VchanStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl std::fmt::Debug for VchanStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VchanStream").finish_non_exhaustive()
    }
}
