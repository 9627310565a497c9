//! Multiplexed directory-protocol client connections.
//!
//! dirmux runs many concurrent LDAP-style operations over one connection:
//! a single writer at a time, one background reader routing replies by
//! message id, bind sequencing, mid-session TLS upgrade and cooperative
//! shutdown.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and Unix stream sockets, pluggable TLS upgrade
//! - [`frame`]: BER framing of protocol messages and the request builders
//! - [`client`]: connections, pending requests and the multiplexer
//!   (behind the default `client` feature)

/// Re-export transport types.
pub mod transport {
    pub use dirmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use dirmux_frame::*;
}

/// Re-export client types (requires `client` feature).
#[cfg(feature = "client")]
pub mod client {
    pub use dirmux_client::*;
}
