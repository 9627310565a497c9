//! Request builders and result decoders for the operations the
//! multiplexing core handles itself: bind, unbind, abandon and extended
//! operations. Response encoders are provided for in-process servers and
//! test harnesses.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::ber::{self, Decoder, ENUMERATED, INTEGER, OCTET_STRING, SEQUENCE, SET};
use crate::codec::{encode_message, Frame};
use crate::error::{FrameError, Result};
use crate::op::ProtocolOp;

/// Object identifiers the core recognises by literal value.
pub mod oid {
    /// Unsolicited notification: the server is about to close the connection.
    pub const NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";
    /// Extended operation: upgrade the connection to TLS in place.
    pub const START_TLS: &str = "1.3.6.1.4.1.1466.20037";
}

/// LDAPv3 result codes used by the core.
pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const OPERATIONS_ERROR: i32 = 1;
    pub const PROTOCOL_ERROR: i32 = 2;
    pub const TIME_LIMIT_EXCEEDED: i32 = 3;
    pub const AUTH_METHOD_NOT_SUPPORTED: i32 = 7;
    pub const STRONGER_AUTH_REQUIRED: i32 = 8;
    pub const REFERRAL: i32 = 10;
    pub const SASL_BIND_IN_PROGRESS: i32 = 14;
    pub const INVALID_CREDENTIALS: i32 = 49;
    pub const BUSY: i32 = 51;
    pub const UNAVAILABLE: i32 = 52;
    pub const UNWILLING_TO_PERFORM: i32 = 53;
    pub const OTHER: i32 = 80;
}

/// Simple authentication choice `[0]` of a BindRequest.
const AUTH_SIMPLE: u8 = 0x80;
const REFERRAL_TAG: u8 = 0xA3;
const EXTENDED_REQUEST_NAME: u8 = 0x80;
const EXTENDED_REQUEST_VALUE: u8 = 0x81;
const EXTENDED_RESPONSE_NAME: u8 = 0x8A;
const EXTENDED_RESPONSE_VALUE: u8 = 0x8B;

/// A request ready to be sent once a message id is assigned.
#[derive(Clone, PartialEq, Eq)]
pub struct Request {
    op: ProtocolOp,
    content: Bytes,
    controls: Option<Bytes>,
    message_id: Option<i32>,
}

impl Request {
    /// A request carrying already encoded operation content.
    pub fn new(op: ProtocolOp, content: impl Into<Bytes>) -> Self {
        Self {
            op,
            content: content.into(),
            controls: None,
            message_id: None,
        }
    }

    /// Attach encoded controls (the content of the `[0]` element).
    pub fn with_controls(mut self, controls: impl Into<Bytes>) -> Self {
        self.controls = Some(controls.into());
        self
    }

    /// Pin the message id instead of letting the connection assign one.
    pub fn with_message_id(mut self, message_id: i32) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// LDAPv3 simple bind. An empty DN and password is an anonymous bind.
    pub fn simple_bind(version: u8, dn: &str, password: &[u8]) -> Self {
        let mut content = BytesMut::new();
        ber::put_integer(INTEGER, i64::from(version), &mut content);
        ber::put_tlv(OCTET_STRING, dn.as_bytes(), &mut content);
        ber::put_tlv(AUTH_SIMPLE, password, &mut content);
        Self::new(ProtocolOp::BindRequest, content.freeze())
    }

    pub fn unbind() -> Self {
        Self::new(ProtocolOp::UnbindRequest, Bytes::new())
    }

    /// Ask the server to stop processing `target`.
    pub fn abandon(target: i32) -> Self {
        Self::new(
            ProtocolOp::AbandonRequest,
            ber::integer_content(i64::from(target)),
        )
    }

    /// Extended operation identified by `oid`.
    pub fn extended(oid: &str, value: Option<&[u8]>) -> Self {
        let mut content = BytesMut::new();
        ber::put_tlv(EXTENDED_REQUEST_NAME, oid.as_bytes(), &mut content);
        if let Some(value) = value {
            ber::put_tlv(EXTENDED_REQUEST_VALUE, value, &mut content);
        }
        Self::new(ProtocolOp::ExtendedRequest, content.freeze())
    }

    pub fn start_tls() -> Self {
        Self::extended(oid::START_TLS, None)
    }

    pub fn op(&self) -> ProtocolOp {
        self.op
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// The pinned message id, if any.
    pub fn message_id(&self) -> Option<i32> {
        self.message_id
    }

    /// Encode under `message_id` into `dst`.
    pub fn encode(&self, message_id: i32, dst: &mut BytesMut) -> Result<()> {
        encode_message(
            message_id,
            self.op,
            &self.content,
            self.controls.as_deref(),
            dst,
        )
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Request");
        dbg.field("op", &self.op).field("message_id", &self.message_id);
        if self.op == ProtocolOp::BindRequest {
            // Bind content carries credentials.
            dbg.field(
                "content",
                &format_args!("<redacted:{} bytes>", self.content.len()),
            );
        } else {
            dbg.field("content_len", &self.content.len());
        }
        dbg.field("has_controls", &self.controls.is_some()).finish()
    }
}

/// The LDAPResult carried by most terminal responses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    /// A result with the given code and message and no referrals.
    pub fn new(result_code: i32, diagnostic_message: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
            referrals: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(result_code::SUCCESS, "")
    }

    /// Decode the LDAPResult at the start of a response's operation.
    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.is_request() || !frame.is_terminal() {
            return Err(FrameError::malformed(format!(
                "{} does not carry an LDAPResult",
                frame.op
            )));
        }
        let content = frame.op_content();
        let mut decoder = Decoder::new(&content);
        Self::decode_from(&mut decoder)
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self> {
        let code = decoder.read_integer(ENUMERATED)?;
        let result_code = i32::try_from(code)
            .map_err(|_| FrameError::malformed(format!("result code {code} out of range")))?;
        let matched_dn = decoder.read_string(OCTET_STRING)?;
        let diagnostic_message = decoder.read_string(OCTET_STRING)?;

        let mut referrals = Vec::new();
        if let Some(urls) = decoder.read_optional(REFERRAL_TAG)? {
            let mut urls = Decoder::new(urls);
            while !urls.is_empty() {
                referrals.push(urls.read_string(OCTET_STRING)?);
            }
        }

        Ok(Self {
            result_code,
            matched_dn,
            diagnostic_message,
            referrals,
        })
    }

    pub fn is_success(&self) -> bool {
        self.result_code == result_code::SUCCESS
    }

    fn put_content(&self, dst: &mut BytesMut) {
        ber::put_integer(ENUMERATED, i64::from(self.result_code), dst);
        ber::put_tlv(OCTET_STRING, self.matched_dn.as_bytes(), dst);
        ber::put_tlv(OCTET_STRING, self.diagnostic_message.as_bytes(), dst);
        if !self.referrals.is_empty() {
            let mut urls = BytesMut::new();
            for url in &self.referrals {
                ber::put_tlv(OCTET_STRING, url.as_bytes(), &mut urls);
            }
            ber::put_tlv(REFERRAL_TAG, &urls, dst);
        }
    }
}

/// An ExtendedResponse: an LDAPResult plus an optional OID and value.
///
/// Unsolicited notifications (message id 0) use this shape.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub oid: Option<String>,
    pub value: Option<Bytes>,
}

impl ExtendedResponse {
    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.op != ProtocolOp::ExtendedResponse {
            return Err(FrameError::malformed(format!(
                "expected extendedResp, found {}",
                frame.op
            )));
        }
        let content = frame.op_content();
        let mut decoder = Decoder::new(&content);
        let result = LdapResult::decode_from(&mut decoder)?;
        let oid = decoder
            .read_optional(EXTENDED_RESPONSE_NAME)?
            .map(|raw| String::from_utf8_lossy(raw).into_owned());
        let value = decoder
            .read_optional(EXTENDED_RESPONSE_VALUE)?
            .map(Bytes::copy_from_slice);

        Ok(Self { result, oid, value })
    }

    /// Returns true if this is the server's notice of disconnection.
    pub fn is_notice_of_disconnection(&self) -> bool {
        self.oid.as_deref() == Some(oid::NOTICE_OF_DISCONNECTION)
    }
}

/// Encode a response whose operation content is a bare LDAPResult.
pub fn encode_result(
    message_id: i32,
    op: ProtocolOp,
    result: &LdapResult,
    dst: &mut BytesMut,
) -> Result<()> {
    let mut content = BytesMut::new();
    result.put_content(&mut content);
    encode_message(message_id, op, &content, None, dst)
}

pub fn encode_extended_response(
    message_id: i32,
    response: &ExtendedResponse,
    dst: &mut BytesMut,
) -> Result<()> {
    let mut content = BytesMut::new();
    response.result.put_content(&mut content);
    if let Some(oid) = &response.oid {
        ber::put_tlv(EXTENDED_RESPONSE_NAME, oid.as_bytes(), &mut content);
    }
    if let Some(value) = &response.value {
        ber::put_tlv(EXTENDED_RESPONSE_VALUE, value, &mut content);
    }
    encode_message(message_id, ProtocolOp::ExtendedResponse, &content, None, dst)
}

/// Encode a SearchResultEntry with the given attributes.
pub fn encode_search_entry(
    message_id: i32,
    dn: &str,
    attributes: &[(&str, &[&[u8]])],
    dst: &mut BytesMut,
) -> Result<()> {
    let mut list = BytesMut::new();
    for (name, values) in attributes {
        let mut vals = BytesMut::new();
        for value in values.iter() {
            ber::put_tlv(OCTET_STRING, value, &mut vals);
        }
        let mut attribute = BytesMut::new();
        ber::put_tlv(OCTET_STRING, name.as_bytes(), &mut attribute);
        ber::put_tlv(SET, &vals, &mut attribute);
        ber::put_tlv(SEQUENCE, &attribute, &mut list);
    }

    let mut content = BytesMut::new();
    ber::put_tlv(OCTET_STRING, dn.as_bytes(), &mut content);
    ber::put_tlv(SEQUENCE, &list, &mut content);
    encode_message(
        message_id,
        ProtocolOp::SearchResultEntry,
        &content,
        None,
        dst,
    )
}
