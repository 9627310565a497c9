//! Pluggable TLS upgrade.
//!
//! The multiplexing core never links a TLS library directly. A
//! [`TlsUpgrader`] is chosen when the connection is configured and is
//! asked to wrap an already connected plaintext stream, either right
//! after connect or in the middle of a session (StartTLS).

use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::stream::TransportStream;

/// Reading half handed to a connection's reader thread.
pub type BoxedReader = Box<dyn Read + Send>;

/// Writing half guarded by a connection's write path.
pub type BoxedWriter = Box<dyn Write + Send>;

/// Independent reader and writer halves over one underlying socket.
pub struct StreamPair {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl StreamPair {
    /// Plaintext halves: two clones of the same socket.
    pub fn plaintext(stream: &TransportStream) -> Result<Self> {
        Ok(Self {
            reader: Box::new(stream.try_clone()?),
            writer: Box::new(stream.try_clone()?),
        })
    }
}

impl fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPair").finish_non_exhaustive()
    }
}

/// Wraps a plaintext stream in an encrypted session.
pub trait TlsUpgrader: Send + Sync {
    /// Perform the client handshake over `stream` and return the encrypted
    /// halves.
    ///
    /// Certificate validation problems that do not abort the handshake are
    /// recorded in `problems`. A handshake that fails later, on first
    /// write, must surface as an `io::Error` wrapping [`TlsHandshakeError`].
    fn upgrade(
        &self,
        host: &str,
        stream: TransportStream,
        problems: &CertificateProblems,
    ) -> Result<StreamPair>;

    /// Implementation name for diagnostics.
    fn name(&self) -> &'static str {
        "tls"
    }
}

/// Handshake failure reported by a [`TlsUpgrader`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("TLS handshake failed: {reason}")]
pub struct TlsHandshakeError {
    pub reason: String,
}

impl TlsHandshakeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Wrap into an `io::Error` so it can cross `Read`/`Write` boundaries.
    pub fn into_io(self) -> std::io::Error {
        std::io::Error::other(self)
    }

    /// Find a handshake failure carried inside an `io::Error`.
    pub fn find(err: &std::io::Error) -> Option<&TlsHandshakeError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<TlsHandshakeError>())
    }
}

/// Accumulates certificate validation problems for error reporting.
///
/// Cloning shares the underlying list.
#[derive(Clone, Default)]
pub struct CertificateProblems {
    inner: Arc<Mutex<Vec<String>>>,
}

impl CertificateProblems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one problem description.
    pub fn record(&self, problem: impl Into<String>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(problem.into());
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl fmt::Debug for CertificateProblems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}
