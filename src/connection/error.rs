use thiserror::Error;

/// Errors that can occur while establishing or running a peer connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer sent something the handshake does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer lacks a feature every client must support.
    #[error("missing required features: {0}")]
    MissingFeatures(String),

    /// The peer's identity could not be resolved on any hub.
    #[error("unknown user")]
    UnknownUser,

    /// The certificate keyprint does not match the one the hub published.
    #[error("keyprint mismatch")]
    KeyprintMismatch,

    /// An inbound connection nobody asked for.
    #[error("unexpected connection")]
    UnexpectedConnection,

    /// Both sides want to download and drew the same number.
    #[error("direction conflict")]
    DirectionConflict,

    #[error("connection not found")]
    NotFound,

    #[error("user offline")]
    Offline,
}

impl ConnectionError {
    /// Failures that suppress automatic reconnects until forced.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ConnectionError::Protocol(_)
                | ConnectionError::MissingFeatures(_)
                | ConnectionError::KeyprintMismatch
                | ConnectionError::DirectionConflict
        )
    }
}
