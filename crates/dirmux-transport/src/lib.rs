//! Stream transport for directory-protocol clients.
//!
//! Provides the byte-stream boundary the multiplexing core consumes:
//! - TCP connections with DNS resolution, connect timeout and keepalive
//! - Unix domain stream sockets (local servers and socketpair tests)
//! - A pluggable [`TlsUpgrader`] that swaps a plaintext stream for an
//!   encrypted reader/writer pair in place
//!
//! This is the lowest layer of dirmux. Everything else builds on top of
//! the [`TransportStream`] type provided here.

pub mod error;
pub mod stream;
pub mod tcp;
pub mod tls;

pub use error::{Result, TransportError};
pub use stream::TransportStream;
pub use tls::{
    BoxedReader, BoxedWriter, CertificateProblems, StreamPair, TlsHandshakeError, TlsUpgrader,
};
