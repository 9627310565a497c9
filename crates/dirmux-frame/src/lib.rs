//! BER framing of LDAPv3 messages.
//!
//! Every message on the wire is one BER `SEQUENCE`:
//! - An INTEGER message id correlating requests and responses
//! - A protocolOp CHOICE, identified by its APPLICATION tag
//! - Optional controls (`[0]`)
//!
//! The multiplexing core only routes by message id and operation tag;
//! this crate turns byte streams into [`Frame`]s and back, and provides
//! the handful of request builders and result decoders the core needs
//! for bind, unbind, abandon and extended operations.

pub mod ber;
pub mod codec;
pub mod error;
pub mod message;
pub mod op;
pub mod reader;
pub mod writer;

pub use codec::{decode_frame, encode_message, Frame, FrameConfig, DEFAULT_MAX_MESSAGE};
pub use error::{FrameError, Result};
pub use message::{
    encode_extended_response, encode_result, encode_search_entry, oid, result_code,
    ExtendedResponse, LdapResult, Request,
};
pub use op::ProtocolOp;
pub use reader::FrameReader;
pub use writer::FrameWriter;
