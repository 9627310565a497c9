//! Request/response multiplexing over a single directory-protocol connection.
//!
//! This is the concurrency core of dirmux. A [`Connection`] owns the
//! transport and one background reader thread; callers submit requests
//! through a [`Multiplexer`], which registers each one as a
//! [`PendingRequest`] in the connection's [`RequestTable`] and hands
//! replies back as the reader routes them by message id.

pub mod bind;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod multiplexer;
pub mod notification;
pub mod pending;
pub mod reader;
pub mod table;
pub mod tls;
pub mod write_access;

/// Integer correlating a request with its responses.
///
/// Positive for client-issued requests, 0 for unsolicited notifications,
/// negative for ephemeral write-access tokens.
pub type MessageId = i32;

pub use bind::BindMetadata;
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use connector::{connect, connect_with_config};
pub use error::{ClientError, Result};
pub use multiplexer::Multiplexer;
pub use notification::{ListenerId, UnsolicitedListener, UnsolicitedNotice};
pub use pending::PendingRequest;
pub use reader::ReaderState;
pub use table::RequestTable;
pub use write_access::WriteAccess;
