use std::fmt;
use std::io;

use dirmux_client::ClientError;
use dirmux_frame::{result_code, FrameError};
use dirmux_transport::TransportError;

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::MessageTooLarge { .. } | FrameError::Malformed(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn client_error(context: &str, err: ClientError) -> CliError {
    match err {
        ClientError::Transport(err) => transport_error(context, err),
        ClientError::Frame(err) => frame_error(context, err),
        ClientError::Io(err) => io_error(context, err),
        ClientError::ClientTimeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ClientError::TlsHandshakeFailed { .. } => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        ClientError::Protocol(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        ClientError::ConnectionClosed(_)
        | ClientError::ServerShutdownNotice(_)
        | ClientError::ReaderDied(_)
        | ClientError::NotConnected => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

/// Exit code for an operation that completed with a non-success result.
pub fn result_exit_code(code: i32) -> i32 {
    match code {
        result_code::SUCCESS => SUCCESS,
        result_code::INVALID_CREDENTIALS
        | result_code::AUTH_METHOD_NOT_SUPPORTED
        | result_code::STRONGER_AUTH_REQUIRED => PERMISSION_DENIED,
        result_code::TIME_LIMIT_EXCEEDED => TIMEOUT,
        _ => FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timeouts_map_to_124() {
        let err = ClientError::ClientTimeout {
            message_id: 3,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(client_error("bind failed", err).code, TIMEOUT);
    }

    #[test]
    fn refused_connect_is_a_plain_failure() {
        let err = ClientError::Transport(TransportError::Connect {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        });
        let cli = client_error("connect failed", err);
        assert_eq!(cli.code, FAILURE);
        assert!(cli.message.starts_with("connect failed: "));
    }

    #[test]
    fn credential_failures_are_permission_denied() {
        assert_eq!(result_exit_code(result_code::SUCCESS), SUCCESS);
        assert_eq!(
            result_exit_code(result_code::INVALID_CREDENTIALS),
            PERMISSION_DENIED
        );
        assert_eq!(result_exit_code(result_code::BUSY), FAILURE);
    }
}
