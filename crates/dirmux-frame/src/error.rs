/// Errors that can occur during message encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A top-level element that is not an LDAPMessage SEQUENCE.
    #[error("unexpected top-level tag 0x{tag:02x} ({len} bytes)")]
    UnexpectedTag { tag: u8, len: usize },

    /// The bytes do not form a valid BER encoding of the expected shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The message exceeds the configured maximum size.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing messages.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete message was received.
    #[error("connection closed (incomplete message)")]
    ConnectionClosed,
}

impl FrameError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed(detail.into())
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
