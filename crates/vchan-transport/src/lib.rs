//! Rendezvous endpoint for vchan channels.
//!
//! A channel's rendezvous point is a named bidirectional byte stream
//! addressed by a (local domain, peer domain, port) triple. This crate
//! derives the socket path from that triple and provides bind/accept/connect
//! over filesystem-path Unix domain sockets.
//!
//! This is the lowest layer: it moves raw bytes and knows nothing about
//! connection states or staging buffers. The channel semantics live in the
//! `vchan` crate.

pub mod addr;
pub mod error;
pub mod stream;
pub mod uds;

pub use addr::{default_socket_dir, RendezvousKey, DEFAULT_SOCKET_DIR, SOCKET_DIR_ENV};
pub use error::{Result, TransportError};
pub use stream::VchanStream;
pub use uds::{connect, RendezvousListener};
