use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dirmux_frame::{FrameConfig, DEFAULT_MAX_MESSAGE};
use dirmux_transport::TlsUpgrader;

/// Settings applied when a [`Connection`](crate::Connection) attaches to a
/// transport.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing the TCP connection. `None` blocks.
    pub connect_timeout: Option<Duration>,
    /// Socket write timeout. A write that stalls longer fails the request.
    pub write_timeout: Option<Duration>,
    /// How often the reader thread wakes up to check for a stop request.
    pub reader_poll_interval: Duration,
    /// Maximum encoded message size in either direction.
    pub max_message_size: usize,
    /// Protocol version used for binds issued by this crate.
    pub protocol_version: u8,
    /// Send an unbind on shutdown when the connection is bound.
    pub unbind_on_shutdown: bool,
    /// Wrap the socket in TLS immediately after connecting.
    pub tls_on_connect: bool,
    /// TLS implementation for `tls_on_connect` and StartTLS.
    pub tls: Option<Arc<dyn TlsUpgrader>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(30)),
            reader_poll_interval: Duration::from_millis(250),
            max_message_size: DEFAULT_MAX_MESSAGE,
            protocol_version: 3,
            unbind_on_shutdown: true,
            tls_on_connect: false,
            tls: None,
        }
    }
}

impl ConnectionConfig {
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Zero is clamped to one millisecond; a zero socket timeout means
    /// "block forever".
    pub fn with_reader_poll_interval(mut self, interval: Duration) -> Self {
        self.reader_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn with_protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_unbind_on_shutdown(mut self, unbind: bool) -> Self {
        self.unbind_on_shutdown = unbind;
        self
    }

    pub fn with_tls(mut self, upgrader: Arc<dyn TlsUpgrader>) -> Self {
        self.tls = Some(upgrader);
        self
    }

    pub fn with_tls_on_connect(mut self, enabled: bool) -> Self {
        self.tls_on_connect = enabled;
        self
    }

    pub(crate) fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_message_size: self.max_message_size,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("reader_poll_interval", &self.reader_poll_interval)
            .field("max_message_size", &self.max_message_size)
            .field("protocol_version", &self.protocol_version)
            .field("unbind_on_shutdown", &self.unbind_on_shutdown)
            .field("tls_on_connect", &self.tls_on_connect)
            .field("tls", &self.tls.as_ref().map(|tls| tls.name()))
            .finish()
    }
}
