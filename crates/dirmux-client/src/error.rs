use std::time::Duration;

use crate::MessageId;

/// Errors that can occur in client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level error, including DNS and connect failures.
    #[error("transport error: {0}")]
    Transport(#[from] dirmux_transport::TransportError),

    /// Message encoding or decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] dirmux_frame::FrameError),

    /// I/O error on a connection the client still considers open.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is gone.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The server announced it was closing the connection.
    #[error("server closed the connection: {0}")]
    ServerShutdownNotice(String),

    /// TLS negotiation failed while writing.
    #[error("TLS handshake failed: {reason} (certificate problems: [{}])", .problems.join("; "))]
    TlsHandshakeFailed {
        reason: String,
        problems: Vec<String>,
    },

    /// No response arrived within the request's time limit.
    #[error("client timed out after {timeout:?} waiting for message {message_id}")]
    ClientTimeout {
        message_id: MessageId,
        timeout: Duration,
    },

    /// The reader thread terminated while the connection was in use.
    #[error("reader thread died: {0}")]
    ReaderDied(String),

    /// No outstanding request carries this message id.
    #[error("no outstanding request with message id {0}")]
    NoSuchRequest(MessageId),

    /// A request with this message id is already in flight.
    #[error("message id {0} is already in flight")]
    DuplicateMessageId(MessageId),

    /// The connection has no transport.
    #[error("not connected")]
    NotConnected,

    /// The operation is not allowed in the connection's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The server answered with something the client cannot accept.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
