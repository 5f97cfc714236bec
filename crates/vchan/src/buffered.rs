//! Buffered channel: ring-staged transfers driven by a background I/O thread.
//!
//! The facade pushes into and pops from two rings; the I/O thread owns the
//! rendezvous socket, moves bytes between the rings and the socket whenever
//! the socket is ready, and drives the connection state machine.
//!
//! Wakeups run through two paths. The I/O thread is woken by `user_event`, a
//! self-pipe folded into its readiness poll. Facade callers park on a
//! condition variable guarded by the shared state; `wait` additionally keys
//! on a pending-signal flag so an event raised just before the caller parks
//! still satisfies it. Every facade-visible event also feeds the
//! `socket_event` pipe, whose read end is the descriptor behind
//! `fd_for_select`.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::{debug, warn};
use vchan_transport::{connect, RendezvousKey, RendezvousListener, VchanStream};

use crate::error::{is_disconnect, ChannelError, Result};
use crate::event::{poll_fds, EventPipe};
use crate::ring::Ring;
use crate::{ChannelConfig, ConnectionState, Vchan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

struct State {
    conn: ConnectionState,
    read_ring: Ring,
    write_ring: Ring,
    closed: bool,
    shutdown: bool,
    /// Set by the I/O thread on an unrecoverable endpoint error.
    failed: Option<std::io::ErrorKind>,
    /// True once the I/O thread has exited for good.
    io_done: bool,
    /// Set on every facade-visible event, consumed by `wait`. Level
    /// semantics: an event that fired before the caller parked still counts.
    signal: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Parks facade callers blocked in `wait`/`read`/`write`.
    cond: Condvar,
    /// Facade -> I/O thread: ring contents changed or shutdown requested.
    user_event: EventPipe,
    /// I/O thread -> facade: data arrived, space freed, state changed.
    /// Mirrors the condvar for external readiness multiplexers.
    socket_event: EventPipe,
    role: Role,
}

impl Shared {
    fn new(role: Role, conn: ConnectionState, config: &ChannelConfig) -> std::io::Result<Self> {
        Ok(Self {
            state: Mutex::new(State {
                conn,
                read_ring: Ring::with_capacity(config.read_min.max(1)),
                write_ring: Ring::with_capacity(config.write_min.max(1)),
                closed: false,
                shutdown: false,
                failed: None,
                io_done: false,
                signal: false,
            }),
            cond: Condvar::new(),
            user_event: EventPipe::new()?,
            socket_event: EventPipe::new()?,
            role,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_on<'a>(&self, st: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.cond.wait(st).unwrap_or_else(|e| e.into_inner())
    }

    /// Wake every facade waiter: the condvar for parked threads and the
    /// event pipe for external multiplexers.
    fn notify_facade(&self) {
        self.lock().signal = true;
        self.cond.notify_all();
        self.socket_event.notify();
    }

    fn set_conn(&self, conn: ConnectionState) {
        self.lock().conn = conn;
        debug!(?conn, "channel state changed");
        self.notify_facade();
    }
}

/// Buffered ("full") channel variant.
///
/// Construct with [`Channel::server`] or [`Channel::client`]; all transfer
/// operations come from the [`Vchan`] trait.
pub struct Channel {
    shared: Arc<Shared>,
    socket_path: PathBuf,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Open as server: bind the rendezvous socket, listen, enter `Waiting`.
    pub fn server(local_domain: u32, peer_domain: u32, port: u32) -> Result<Self> {
        Self::server_with_config(local_domain, peer_domain, port, &ChannelConfig::default())
    }

    /// Open as server with explicit options.
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

        let shared = Arc::new(Shared::new(Role::Server, ConnectionState::Waiting, config)?);
        debug!(path = %path.display(), "channel server waiting for peer");

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("vchan-io".into())
            .spawn(move || server_io(&thread_shared, listener))?;

        Ok(Self {
            shared,
            socket_path: path,
            io_thread: Mutex::new(Some(handle)),
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

        let shared = Arc::new(Shared::new(Role::Client, ConnectionState::Connected, config)?);
        debug!(path = %path.display(), "channel client connected");

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("vchan-io".into())
            .spawn(move || client_io(&thread_shared, stream))?;

        Ok(Self {
            shared,
            socket_path: path,
            io_thread: Mutex::new(Some(handle)),
        })
    }

    /// Path of the rendezvous socket backing this channel.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.lock()
    }

    fn check_open(&self, st: &State) -> Result<()> {
        if st.closed {
            return Err(ChannelError::Closed);
        }
        if let Some(kind) = st.failed {
            return Err(ChannelError::Io(kind.into()));
        }
        Ok(())
    }

    /// True when no peer can ever attach again, so blocking is pointless.
    fn peer_gone(&self, st: &State) -> bool {
        st.io_done
            || (self.shared.role == Role::Client && st.conn == ConnectionState::Disconnected)
    }
}

impl Vchan for Channel {
    fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut st = self.lock();
        loop {
            self.check_open(&st)?;
            if st.write_ring.available() > 0 {
                let n = st.write_ring.push(data);
                drop(st);
                self.shared.user_event.notify();
                return Ok(n);
            }
            if self.peer_gone(&st) {
                return Err(ChannelError::Disconnected);
            }
            st = self.shared.wait_on(st);
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
        let mut st = self.lock();
        loop {
            if st.closed {
                return Err(ChannelError::Closed);
            }
            // Staged data is delivered even after an endpoint failure.
            if st.read_ring.filled() > 0 {
                let n = st.read_ring.pop(buf);
                drop(st);
                self.shared.user_event.notify();
                // Consuming data consumes the matching readiness, so an
                // external multiplexer on `fd_for_select` does not keep
                // seeing a readable descriptor after the ring is empty.
                self.shared.socket_event.drain();
                return Ok(n);
            }
            if let Some(kind) = st.failed {
                return Err(ChannelError::Io(kind.into()));
            }
            if self.peer_gone(&st) {
                return Err(ChannelError::Disconnected);
            }
            st = self.shared.wait_on(st);
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
        Ok(st.read_ring.filled())
    }

    fn buffer_space(&self) -> Result<usize> {
        let st = self.lock();
        if st.closed {
            return Err(ChannelError::Closed);
        }
        Ok(st.write_ring.available())
    }

    fn wait(&self) -> Result<()> {
        let mut st = self.lock();
        if st.closed {
            return Err(ChannelError::Closed);
        }
        while !st.signal && !st.closed {
            st = self.shared.wait_on(st);
        }
        st.signal = false;
        let closed = st.closed;
        drop(st);
        self.shared.socket_event.drain();
        if closed {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn fd_for_select(&self) -> RawFd {
        self.shared.socket_event.read_fd()
    }

    fn state(&self) -> ConnectionState {
        self.lock().conn
    }

    fn close(&self) -> Result<()> {
        {
            let mut st = self.lock();
            if st.closed {
                return Ok(());
            }
            st.closed = true;
            st.shutdown = true;
        }
        self.shared.user_event.notify();
        self.shared.notify_facade();
        if let Some(handle) = self.io_thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
        debug!("channel closed");
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

enum CommOutcome {
    /// Peer detached cleanly or by reset; a server may accept another.
    PeerGone,
    /// Shutdown requested through `close`.
    Shutdown,
    /// Hard endpoint error, recorded in the shared state.
    Failed,
}

fn server_io(shared: &Shared, listener: RendezvousListener) {
    loop {
        let stream = match wait_for_peer(shared, &listener) {
            Some(stream) => stream,
            None => break,
        };
        if let Err(err) = stream.set_nonblocking(true) {
            warn!(%err, "peer socket setup failed");
            record_failure(shared, std::io::ErrorKind::Other);
            break;
        }
        shared.set_conn(ConnectionState::Connected);
        let outcome = comm_loop(shared, &stream);
        shared.set_conn(ConnectionState::Disconnected);
        match outcome {
            // Keep listening: a new peer may attach without the channel
            // being reconstructed.
            CommOutcome::PeerGone => {
                if shared.lock().shutdown {
                    break;
                }
                continue;
            }
            CommOutcome::Shutdown | CommOutcome::Failed => break,
        }
    }
    finish_io(shared);
}

fn client_io(shared: &Shared, stream: VchanStream) {
    let _ = comm_loop(shared, &stream);
    shared.set_conn(ConnectionState::Disconnected);
    finish_io(shared);
}

fn finish_io(shared: &Shared) {
    shared.lock().io_done = true;
    shared.notify_facade();
}

fn record_failure(shared: &Shared, kind: std::io::ErrorKind) {
    shared.lock().failed = Some(kind);
    shared.notify_facade();
}

/// Block until a peer connects or shutdown is requested.
fn wait_for_peer(shared: &Shared, listener: &RendezvousListener) -> Option<VchanStream> {
    loop {
        // The close wakeup byte may already have been consumed by a comm
        // loop pass, so the flag is authoritative.
        if shared.lock().shutdown {
            return None;
        }
        let mut fds = [
            libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: shared.user_event.read_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        if let Err(err) = poll_fds(&mut fds, -1) {
            warn!(%err, "poll failed while waiting for peer");
            record_failure(shared, err.kind());
            return None;
        }

        if fds[1].revents & libc::POLLIN != 0 {
            shared.user_event.drain();
            if shared.lock().shutdown {
                return None;
            }
        }

        if fds[0].revents & libc::POLLIN != 0 {
            match listener.try_accept() {
                Ok(Some(stream)) => {
                    debug!("peer attached");
                    return Some(stream);
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!(%err, "accept failed");
                    record_failure(shared, std::io::ErrorKind::Other);
                    return None;
                }
            }
        }
    }
}

/// Move bytes between the rings and the socket until the peer detaches, a
/// hard error occurs, or shutdown is requested.
fn comm_loop(shared: &Shared, stream: &VchanStream) -> CommOutcome {
    loop {
        let (want_in, want_out) = {
            let st = shared.lock();
            if st.shutdown {
                // Orderly close: bytes already accepted by the facade are
                // flushed to the peer before the loop tears down. No more
                // filling, though.
                if st.write_ring.is_empty() {
                    return CommOutcome::Shutdown;
                }
                (false, true)
            } else {
                (st.read_ring.available() > 0, st.write_ring.filled() > 0)
            }
        };

        let mut events: libc::c_short = 0;
        if want_in {
            events |= libc::POLLIN;
        }
        if want_out {
            events |= libc::POLLOUT;
        }

        // With no actionable direction, poll only the event pipe: a socket
        // entry would still report POLLHUP for a hung-up peer and spin.
        let sock_fd = if events != 0 { stream.as_raw_fd() } else { -1 };
        let mut fds = [
            libc::pollfd {
                fd: sock_fd,
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: shared.user_event.read_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        if let Err(err) = poll_fds(&mut fds, -1) {
            warn!(%err, "poll failed in I/O loop");
            record_failure(shared, err.kind());
            return CommOutcome::Failed;
        }

        if fds[1].revents & libc::POLLIN != 0 {
            shared.user_event.drain();
        }
        let revents = fds[0].revents;

        let mut st = shared.lock();
        if st.shutdown && st.write_ring.is_empty() {
            return CommOutcome::Shutdown;
        }

        let mut progress = false;
        let mut peer_gone = false;

        if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 && want_in {
            match fill_read_ring(&mut st.read_ring, stream) {
                Ok((bytes, eof)) => {
                    progress |= bytes > 0;
                    peer_gone |= eof;
                }
                Err(err) => {
                    drop(st);
                    warn!(%err, "socket read failed");
                    record_failure(shared, err.kind());
                    return CommOutcome::Failed;
                }
            }
        }

        if revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR) != 0 && want_out {
            match drain_write_ring(&mut st.write_ring, stream) {
                Ok((bytes, gone)) => {
                    progress |= bytes > 0;
                    peer_gone |= gone;
                }
                Err(err) => {
                    drop(st);
                    warn!(%err, "socket write failed");
                    record_failure(shared, err.kind());
                    return CommOutcome::Failed;
                }
            }
        }

        drop(st);
        if progress {
            shared.notify_facade();
        }
        if peer_gone {
            debug!("peer detached");
            return CommOutcome::PeerGone;
        }
    }
}

/// Pull socket bytes into the read ring until it fills or the socket runs
/// dry. Returns (bytes moved, saw EOF).
fn fill_read_ring(ring: &mut Ring, mut stream: &VchanStream) -> std::io::Result<(usize, bool)> {
    let mut bytes = 0;
    loop {
        let chunk = ring.tail_slice_mut();
        if chunk.is_empty() {
            return Ok((bytes, false));
        }
        match stream.read(chunk) {
            Ok(0) => return Ok((bytes, true)),
            Ok(n) => {
                ring.advance_tail(n);
                bytes += n;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok((bytes, false)),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) if is_disconnect(&err) => return Ok((bytes, true)),
            Err(err) => return Err(err),
        }
    }
}

/// Push write-ring bytes into the socket until the ring empties or the
/// socket backs up. Returns (bytes moved, peer gone).
fn drain_write_ring(ring: &mut Ring, mut stream: &VchanStream) -> std::io::Result<(usize, bool)> {
    let mut bytes = 0;
    loop {
        let chunk = ring.head_slice();
        if chunk.is_empty() {
            return Ok((bytes, false));
        }
        match stream.write(chunk) {
            Ok(0) => return Ok((bytes, true)),
            Ok(n) => {
                ring.advance_head(n);
                bytes += n;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok((bytes, false)),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) if is_disconnect(&err) => return Ok((bytes, true)),
            Err(err) => return Err(err),
        }
    }
}
