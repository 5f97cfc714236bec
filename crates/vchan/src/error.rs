use vchan_transport::TransportError;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The rendezvous endpoint could not be created or connected.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error on the underlying endpoint during a transfer.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted after `close`.
    #[error("channel is closed")]
    Closed,

    /// No peer is attached and the operation requires one.
    #[error("no peer connected")]
    NotConnected,

    /// The peer detached and the operation can no longer complete.
    #[error("peer disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// True if `err` means the peer went away rather than a hard endpoint fault.
pub(crate) fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}
