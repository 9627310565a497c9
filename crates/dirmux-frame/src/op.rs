//! LDAPv3 protocol operations, keyed by their APPLICATION tag.
//!
//! Requests the client sends and responses it routes. Only the tag is
//! interpreted; operation bodies stay opaque to the multiplexing core.

/// The protocolOp CHOICE of an LDAPMessage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolOp {
    BindRequest,
    BindResponse,
    UnbindRequest,
    SearchRequest,
    SearchResultEntry,
    SearchResultDone,
    SearchResultReference,
    ModifyRequest,
    ModifyResponse,
    AddRequest,
    AddResponse,
    DelRequest,
    DelResponse,
    ModifyDnRequest,
    ModifyDnResponse,
    CompareRequest,
    CompareResponse,
    AbandonRequest,
    ExtendedRequest,
    ExtendedResponse,
    IntermediateResponse,
    /// A tag this crate does not know.
    Unknown(u8),
}

impl ProtocolOp {
    /// Map a BER tag to an operation.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0x60 => Self::BindRequest,
            0x61 => Self::BindResponse,
            0x42 => Self::UnbindRequest,
            0x63 => Self::SearchRequest,
            0x64 => Self::SearchResultEntry,
            0x65 => Self::SearchResultDone,
            0x73 => Self::SearchResultReference,
            0x66 => Self::ModifyRequest,
            0x67 => Self::ModifyResponse,
            0x68 => Self::AddRequest,
            0x69 => Self::AddResponse,
            0x4A => Self::DelRequest,
            0x6B => Self::DelResponse,
            0x6C => Self::ModifyDnRequest,
            0x6D => Self::ModifyDnResponse,
            0x6E => Self::CompareRequest,
            0x6F => Self::CompareResponse,
            0x50 => Self::AbandonRequest,
            0x77 => Self::ExtendedRequest,
            0x78 => Self::ExtendedResponse,
            0x79 => Self::IntermediateResponse,
            other => Self::Unknown(other),
        }
    }

    /// The BER tag this operation is encoded under.
    pub fn tag(self) -> u8 {
        match self {
            Self::BindRequest => 0x60,
            Self::BindResponse => 0x61,
            Self::UnbindRequest => 0x42,
            Self::SearchRequest => 0x63,
            Self::SearchResultEntry => 0x64,
            Self::SearchResultDone => 0x65,
            Self::SearchResultReference => 0x73,
            Self::ModifyRequest => 0x66,
            Self::ModifyResponse => 0x67,
            Self::AddRequest => 0x68,
            Self::AddResponse => 0x69,
            Self::DelRequest => 0x4A,
            Self::DelResponse => 0x6B,
            Self::ModifyDnRequest => 0x6C,
            Self::ModifyDnResponse => 0x6D,
            Self::CompareRequest => 0x6E,
            Self::CompareResponse => 0x6F,
            Self::AbandonRequest => 0x50,
            Self::ExtendedRequest => 0x77,
            Self::ExtendedResponse => 0x78,
            Self::IntermediateResponse => 0x79,
            Self::Unknown(tag) => tag,
        }
    }

    /// Returns a human-readable name for the operation.
    pub fn name(self) -> &'static str {
        match self {
            Self::BindRequest => "bindRequest",
            Self::BindResponse => "bindResponse",
            Self::UnbindRequest => "unbindRequest",
            Self::SearchRequest => "searchRequest",
            Self::SearchResultEntry => "searchResEntry",
            Self::SearchResultDone => "searchResDone",
            Self::SearchResultReference => "searchResRef",
            Self::ModifyRequest => "modifyRequest",
            Self::ModifyResponse => "modifyResponse",
            Self::AddRequest => "addRequest",
            Self::AddResponse => "addResponse",
            Self::DelRequest => "delRequest",
            Self::DelResponse => "delResponse",
            Self::ModifyDnRequest => "modDNRequest",
            Self::ModifyDnResponse => "modDNResponse",
            Self::CompareRequest => "compareRequest",
            Self::CompareResponse => "compareResponse",
            Self::AbandonRequest => "abandonRequest",
            Self::ExtendedRequest => "extendedReq",
            Self::ExtendedResponse => "extendedResp",
            Self::IntermediateResponse => "intermediateResponse",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Returns true for operations a client sends.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::BindRequest
                | Self::UnbindRequest
                | Self::SearchRequest
                | Self::ModifyRequest
                | Self::AddRequest
                | Self::DelRequest
                | Self::ModifyDnRequest
                | Self::CompareRequest
                | Self::AbandonRequest
                | Self::ExtendedRequest
        )
    }

    /// Returns true when a response of this type closes out its request.
    ///
    /// Search entries, search references and intermediate responses are
    /// partial results; everything else ends the exchange.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Self::SearchResultEntry | Self::SearchResultReference | Self::IntermediateResponse
        )
    }

    /// Returns false for requests the server never answers.
    pub fn expects_reply(self) -> bool {
        !matches!(self, Self::UnbindRequest | Self::AbandonRequest)
    }
}

impl std::fmt::Display for ProtocolOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(tag) => write!(f, "unknown(0x{tag:02x})"),
            other => f.write_str(other.name()),
        }
    }
}
