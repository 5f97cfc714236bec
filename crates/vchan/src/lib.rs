//! Bidirectional, ordered byte-stream channels over a local stream socket.
//!
//! A channel connects exactly two endpoints — a server that listens on a
//! rendezvous socket and a client that connects to it — and moves
//! undifferentiated bytes in both directions, in order. Two variants
//! implement the same [`Vchan`] capability surface:
//!
//! - [`Channel`] (buffered): a background I/O thread and two fixed-capacity
//!   ring buffers decouple caller timing from socket timing. Writes made
//!   before a peer attaches are staged and delivered on connect, and
//!   buffered data survives a disconnect until delivered.
//! - [`SimpleChannel`]: connection signaling only. Transfers go straight to
//!   the socket, a write requires an attached peer, and `buffer_space`
//!   degrades to a 0/1 connectivity indicator.
//!
//! A server keeps accepting after its peer departs: the state machine walks
//! `Waiting` → `Connected` → `Disconnected` → `Connected` without
//! reconstructing the channel. Clients are single-shot; a failed or lost
//! client connection means constructing a new channel.
//!
//! ```no_run
//! use vchan::{Channel, Vchan};
//!
//! let server = Channel::server(1, 2, 42)?;
//! let client = Channel::client(2, 1, 42)?;
//!
//! client.send(b"Hello World")?;
//! let mut buf = [0u8; 11];
//! server.recv(&mut buf)?;
//! assert_eq!(&buf, b"Hello World");
//! # Ok::<(), vchan::ChannelError>(())
//! ```

pub mod buffered;
pub mod error;
pub mod simple;

mod event;
mod ring;

use std::os::fd::RawFd;
use std::path::PathBuf;

pub use buffered::Channel;
pub use error::{ChannelError, Result};
pub use simple::SimpleChannel;
pub use vchan_transport::{default_socket_dir, RendezvousKey};

/// Observable connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The peer detached, or a client channel lost its connection.
    Disconnected,
    /// A peer is attached.
    Connected,
    /// Server only: listening, no peer has attached yet.
    Waiting,
}

/// Default minimum staging buffer capacity, in bytes.
pub const DEFAULT_BUFFER_MIN: usize = 1024;

/// Construction options shared by both channel variants.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Directory holding rendezvous sockets.
    pub socket_dir: PathBuf,
    /// Capacity of the local read staging buffer (buffered variant only).
    pub read_min: usize,
    /// Capacity of the local write staging buffer (buffered variant only).
    pub write_min: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            read_min: DEFAULT_BUFFER_MIN,
            write_min: DEFAULT_BUFFER_MIN,
        }
    }
}

/// The channel capability surface, implemented by both variants.
///
/// All operations take `&self`: a channel supports one thread issuing
/// write-side calls concurrently with another thread issuing read-side
/// calls. Multiple writers (or multiple readers) need external
/// serialization.
pub trait Vchan: Send + Sync {
    /// Best-effort write.
    ///
    /// Accepts as much of `data` as currently fits and returns the count,
    /// which may be short. Blocks only while zero bytes can be accepted.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Write all of `data`, blocking until every byte is accepted.
    ///
    /// Returns `data.len()` on success.
    fn send(&self, data: &[u8]) -> Result<usize>;

    /// Read at least one byte, at most `buf.len()`.
    ///
    /// Blocks while nothing is available; a short read is expected and
    /// correct. Returns 0 only for an empty `buf`.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes, assembling across arrivals.
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Bytes immediately available to `read`/`recv` without blocking.
    fn data_ready(&self) -> Result<usize>;

    /// Free capacity for `write`.
    ///
    /// Buffered variant: free bytes in the local write buffer. Simple
    /// variant: 0 with no peer attached, 1 otherwise — a connectivity
    /// indicator, not a byte count.
    fn buffer_space(&self) -> Result<usize>;

    /// Block until any channel-relevant event: data arrival, space freed,
    /// peer attach or detach, close.
    fn wait(&self) -> Result<()>;

    /// Descriptor equivalent to the event `wait` blocks on, for integration
    /// into an external readiness multiplexer.
    fn fd_for_select(&self) -> RawFd;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Release the channel. Idempotent; any blocked operation on another
    /// thread unblocks with [`ChannelError::Closed`], and every subsequent
    /// operation fails the same way.
    fn close(&self) -> Result<()>;

    /// Loop `wait` until `pred` holds. No timeout and no backoff; a caller
    /// needing a deadline closes the channel from a watchdog instead.
    fn wait_for(&self, pred: &mut dyn FnMut() -> bool) -> Result<()> {
        while !pred() {
            self.wait()?;
        }
        Ok(())
    }

    /// Loop `wait` until the channel reaches `state`.
    fn wait_for_state(&self, state: ConnectionState) -> Result<()> {
        self.wait_for(&mut || self.state() == state)
    }
}
