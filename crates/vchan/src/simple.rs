//! Simple channel: connection signaling with no local staging.
//!
//! Transfers go straight to the rendezvous socket, so a write needs a peer
//! attached right now and `buffer_space` collapses to a 0/1 connectivity
//! indicator. There is no background thread; `wait` itself drives peer
//! acceptance and disconnect detection. One thread may issue write-side
//! calls while another issues read-side calls, same as the buffered variant.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;
use vchan_transport::{connect, RendezvousKey, RendezvousListener, VchanStream};

use crate::error::{is_disconnect, ChannelError, Result};
use crate::event::{poll_fds, EventPipe};
use crate::{ChannelConfig, ConnectionState, Vchan};

struct Inner {
    listener: Option<RendezvousListener>,
    stream: Option<VchanStream>,
    /// True until the first peer ever attaches; distinguishes `Waiting`
    /// from `Disconnected` on a server.
    fresh: bool,
    closed: bool,
}

impl Inner {
    fn detach(&mut self) {
        if self.stream.take().is_some() {
            self.fresh = false;
            debug!("peer detached");
        }
    }

    fn attach(&mut self, stream: VchanStream) {
        self.stream = Some(stream);
        self.fresh = false;
        debug!("peer attached");
    }
}

/// Unbuffered ("simple") channel variant.
///
/// Construct with [`SimpleChannel::server`] or [`SimpleChannel::client`];
/// all transfer operations come from the [`Vchan`] trait.
pub struct SimpleChannel {
    inner: Mutex<Inner>,
    /// Woken only by `close`, to unblock callers parked in a poll.
    wake: EventPipe,
    socket_path: PathBuf,
}

impl SimpleChannel {
    /// Open as server: bind the rendezvous socket, listen, enter `Waiting`.
    ///
    /// No peer is accepted here; the first `wait` (or a blocking `read`)
    /// performs the accept.
    pub fn server(local_domain: u32, peer_domain: u32, port: u32) -> Result<Self> {
        Self::server_with_config(local_domain, peer_domain, port, &ChannelConfig::default())
    }

    /// Open as server with explicit options. The staging sizes in `config`
    /// are ignored; this variant has no buffers.
    pub fn server_with_config(
        local_domain: u32,
        peer_domain: u32,
        port: u32,
        config: &ChannelConfig,
    ) -> Result<Self> {
        let key = RendezvousKey::for_server(local_domain, peer_domain, port);
        let path = key.socket_path(&config.socket_dir);
        let listener = RendezvousListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        debug!(path = %path.display(), "simple channel server waiting for peer");

        Ok(Self {
            inner: Mutex::new(Inner {
                listener: Some(listener),
                stream: None,
                fresh: true,
                closed: false,
            }),
            wake: EventPipe::new()?,
            socket_path: path,
        })
    }

    /// Open as client: connect to an already-listening server.
    ///
    /// A single connect attempt; failure surfaces as a transport error and
    /// the caller constructs a new channel if it wants to retry.
    pub fn client(local_domain: u32, peer_domain: u32, port: u32) -> Result<Self> {
        Self::client_with_config(local_domain, peer_domain, port, &ChannelConfig::default())
    }

    /// Open as client with explicit options.
    pub fn client_with_config(
        local_domain: u32,
        peer_domain: u32,
        port: u32,
        config: &ChannelConfig,
    ) -> Result<Self> {
        let key = RendezvousKey::for_client(local_domain, peer_domain, port);
        let path = key.socket_path(&config.socket_dir);
        let stream = connect(&path)?;
        stream.set_nonblocking(true)?;
        debug!(path = %path.display(), "simple channel client connected");

        Ok(Self {
            inner: Mutex::new(Inner {
                listener: None,
                stream: Some(stream),
                fresh: false,
                closed: false,
            }),
            wake: EventPipe::new()?,
            socket_path: path,
        })
    }

    /// Path of the rendezvous socket backing this channel.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle a wakeup on the close pipe observed inside a poll. The single
    /// notification is re-queued so it chains to any other parked caller.
    fn check_close_wakeup(&self) -> Result<()> {
        self.wake.drain();
        if self.lock().closed {
            self.wake.notify();
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Block until `fd` accepts more bytes or the channel is closed.
    fn wait_writable(&self, fd: RawFd) -> Result<()> {
        let mut fds = [
            libc::pollfd {
                fd,
                events: libc::POLLOUT,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake.read_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        poll_fds(&mut fds, -1).map_err(ChannelError::Io)?;
        if fds[1].revents & libc::POLLIN != 0 {
            self.check_close_wakeup()?;
        }
        Ok(())
    }
}

impl Vchan for SimpleChannel {
    fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            let fd = {
                let mut st = self.lock();
                if st.closed {
                    return Err(ChannelError::Closed);
                }
                // No staging: a write without an attached peer is rejected
                // rather than silently buffered.
                let Some(stream) = st.stream.as_ref() else {
                    return Err(ChannelError::NotConnected);
                };
                let mut s = stream;
                match s.write(data) {
                    Ok(0) => {
                        st.detach();
                        return Err(ChannelError::Disconnected);
                    }
                    Ok(n) => return Ok(n),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => stream.as_raw_fd(),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) if is_disconnect(&err) => {
                        st.detach();
                        return Err(ChannelError::Disconnected);
                    }
                    Err(err) => return Err(ChannelError::Io(err)),
                }
            };
            self.wait_writable(fd)?;
        }
    }

    fn send(&self, data: &[u8]) -> Result<usize> {
        let mut total = 0;
        while total < data.len() {
            total += self.write(&data[total..])?;
        }
        Ok(total)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut st = self.lock();
                if st.closed {
                    return Err(ChannelError::Closed);
                }
                if let Some(stream) = st.stream.as_ref() {
                    let mut s = stream;
                    match s.read(buf) {
                        Ok(0) => st.detach(),
                        Ok(n) => return Ok(n),
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) if is_disconnect(&err) => st.detach(),
                        Err(err) => return Err(ChannelError::Io(err)),
                    }
                } else if st.listener.is_none() {
                    return Err(ChannelError::Disconnected);
                }
            }
            // A server loops back through `wait` so a new peer can attach.
            self.wait()?;
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            total += self.read(&mut buf[total..])?;
        }
        Ok(total)
    }

    fn data_ready(&self) -> Result<usize> {
        let st = self.lock();
        if st.closed {
            return Err(ChannelError::Closed);
        }
        match st.stream.as_ref() {
            Some(stream) => pending_bytes(stream.as_raw_fd()).map_err(ChannelError::Io),
            None => Ok(0),
        }
    }

    fn buffer_space(&self) -> Result<usize> {
        let mut st = self.lock();
        if st.closed {
            return Err(ChannelError::Closed);
        }
        let Some(stream) = st.stream.as_ref() else {
            return Ok(0);
        };
        // A hangup observed here is the only way a write-only caller learns
        // the peer left.
        let revents = crate::event::poll_fd(stream.as_raw_fd(), libc::POLLOUT, 0)
            .map_err(ChannelError::Io)?;
        if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            st.detach();
            return Ok(0);
        }
        Ok(1)
    }

    fn wait(&self) -> Result<()> {
        enum Target {
            Stream(RawFd),
            Listener(RawFd),
        }
        loop {
            let target = {
                let st = self.lock();
                if st.closed {
                    return Err(ChannelError::Closed);
                }
                match (st.stream.as_ref(), st.listener.as_ref()) {
                    (Some(stream), _) => Target::Stream(stream.as_raw_fd()),
                    (None, Some(listener)) => Target::Listener(listener.as_raw_fd()),
                    // Client with no connection left: nothing can ever
                    // happen on this channel again.
                    (None, None) => return Err(ChannelError::Disconnected),
                }
            };

            let fd = match target {
                Target::Stream(fd) | Target::Listener(fd) => fd,
            };
            let mut fds = [
                libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.wake.read_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            poll_fds(&mut fds, -1).map_err(ChannelError::Io)?;
            if fds[1].revents & libc::POLLIN != 0 {
                self.check_close_wakeup()?;
            }
            let revents = fds[0].revents;
            if revents == 0 {
                continue;
            }

            match target {
                Target::Stream(fd) => {
                    let mut st = self.lock();
                    if st.closed {
                        return Err(ChannelError::Closed);
                    }
                    // The reader may have detached the stream meanwhile.
                    let Some(stream) = st.stream.as_ref() else {
                        return Ok(());
                    };
                    if stream.as_raw_fd() != fd || revents & libc::POLLNVAL != 0 {
                        continue;
                    }
                    // Readable with nothing queued means the peer is gone.
                    if pending_bytes(fd).map_err(ChannelError::Io)? == 0 {
                        st.detach();
                    }
                    return Ok(());
                }
                Target::Listener(fd) => {
                    let mut st = self.lock();
                    if st.closed {
                        return Err(ChannelError::Closed);
                    }
                    let Some(listener) = st.listener.as_ref() else {
                        return Ok(());
                    };
                    if listener.as_raw_fd() != fd || revents & libc::POLLNVAL != 0 {
                        continue;
                    }
                    match listener.try_accept() {
                        Ok(Some(stream)) => {
                            stream.set_nonblocking(true)?;
                            st.attach(stream);
                            return Ok(());
                        }
                        Ok(None) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
    }

    fn fd_for_select(&self) -> RawFd {
        let st = self.lock();
        if let Some(stream) = st.stream.as_ref() {
            return stream.as_raw_fd();
        }
        if let Some(listener) = st.listener.as_ref() {
            return listener.as_raw_fd();
        }
        self.wake.read_fd()
    }

    fn state(&self) -> ConnectionState {
        let st = self.lock();
        if st.closed {
            return ConnectionState::Disconnected;
        }
        if st.stream.is_some() {
            return ConnectionState::Connected;
        }
        if st.fresh && st.listener.is_some() {
            return ConnectionState::Waiting;
        }
        ConnectionState::Disconnected
    }

    fn close(&self) -> Result<()> {
        {
            let mut st = self.lock();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            // Shut down rather than drop: the descriptors stay valid for
            // any caller still parked in a poll, and go away on Drop.
            if let Some(stream) = st.stream.as_ref() {
                let _ = stream.shutdown();
            }
        }
        self.wake.notify();
        debug!("simple channel closed");
        Ok(())
    }
}

impl Drop for SimpleChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Bytes queued on the socket's receive side, via `FIONREAD`.
fn pending_bytes(fd: RawFd) -> std::io::Result<usize> {
    let mut count: libc::c_int = 0;
    // SAFETY: fd is an open socket and count is a valid out-pointer.
    if unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(count as usize)
}
