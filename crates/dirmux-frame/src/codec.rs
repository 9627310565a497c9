use bytes::{BufMut, Bytes, BytesMut};

use crate::ber::{self, Decoder, INTEGER, SEQUENCE};
use crate::error::{FrameError, Result};
use crate::op::ProtocolOp;

/// Default maximum encoded message size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 16 * 1024 * 1024;

/// Controls are carried as `[0]` constructed after the protocolOp.
pub const CONTROLS_TAG: u8 = 0xA0;

/// One decoded LDAPMessage.
///
/// Only the envelope is interpreted: the message id and the protocolOp
/// tag. The encoded message is kept intact for higher layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message id correlating this message with its request.
    pub message_id: i32,
    /// The operation this message carries.
    pub op: ProtocolOp,
    raw: Bytes,
    op_start: usize,
    op_content_start: usize,
    op_end: usize,
}

impl Frame {
    /// Parse a complete encoded LDAPMessage.
    pub fn parse(raw: Bytes) -> Result<Self> {
        let header = ber::peek_header(&raw)?
            .ok_or_else(|| FrameError::malformed("truncated message header"))?;
        if header.tag != SEQUENCE {
            return Err(FrameError::UnexpectedTag {
                tag: header.tag,
                len: raw.len(),
            });
        }
        if header.total_len() != raw.len() {
            return Err(FrameError::malformed(format!(
                "message length {} does not match buffer length {}",
                header.total_len(),
                raw.len()
            )));
        }

        let base = header.header_len;
        let mut decoder = Decoder::new(&raw[base..]);

        let id = decoder.read_integer(INTEGER)?;
        let message_id = i32::try_from(id)
            .ok()
            .filter(|id| *id >= 0)
            .ok_or_else(|| FrameError::malformed(format!("message id {id} out of range")))?;

        let op = decoder.next_element()?;

        Ok(Self {
            message_id,
            op: ProtocolOp::from_tag(op.tag),
            op_start: base + op.full.start,
            op_content_start: base + op.content.start,
            op_end: base + op.full.end,
            raw,
        })
    }

    /// The complete encoded message.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// The protocolOp element, header included.
    pub fn op_element(&self) -> Bytes {
        self.raw.slice(self.op_start..self.op_end)
    }

    /// The protocolOp content octets.
    pub fn op_content(&self) -> Bytes {
        self.raw.slice(self.op_content_start..self.op_end)
    }

    /// Returns true if this message carries a client request.
    pub fn is_request(&self) -> bool {
        self.op.is_request()
    }

    /// Returns true if this message closes out its request.
    pub fn is_terminal(&self) -> bool {
        self.op.is_terminal()
    }

    /// Returns true for server-initiated messages (message id 0).
    pub fn is_unsolicited(&self) -> bool {
        self.message_id == 0
    }

    /// The total wire size of this message.
    pub fn wire_size(&self) -> usize {
        self.raw.len()
    }
}

/// Encode one LDAPMessage into the wire format.
///
/// ```text
/// SEQUENCE {
///     messageID   INTEGER,
///     protocolOp  [APPLICATION n] (op_content),
///     controls    [0] (controls) OPTIONAL
/// }
/// ```
pub fn encode_message(
    message_id: i32,
    op: ProtocolOp,
    op_content: &[u8],
    controls: Option<&[u8]>,
    dst: &mut BytesMut,
) -> Result<()> {
    if message_id < 0 {
        return Err(FrameError::malformed(format!(
            "message id {message_id} cannot be sent"
        )));
    }

    let mut body = BytesMut::with_capacity(op_content.len() + 16);
    ber::put_integer(INTEGER, i64::from(message_id), &mut body);
    ber::put_tlv(op.tag(), op_content, &mut body);
    if let Some(controls) = controls {
        ber::put_tlv(CONTROLS_TAG, controls, &mut body);
    }

    dst.reserve(body.len() + 6);
    dst.put_u8(SEQUENCE);
    ber::put_length(body.len(), dst);
    dst.put_slice(&body);
    Ok(())
}

/// Decode a message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
/// On success, consumes the message bytes from the buffer. A complete
/// top-level element that is not a SEQUENCE is consumed as well and
/// reported as [`FrameError::UnexpectedTag`] so the caller can skip it.
pub fn decode_frame(src: &mut BytesMut, max_message: usize) -> Result<Option<Frame>> {
    let Some(header) = ber::peek_header(src)? else {
        return Ok(None); // Need more data
    };

    let total = header.total_len();
    if total > max_message {
        return Err(FrameError::MessageTooLarge {
            size: total,
            max: max_message,
        });
    }
    if src.len() < total {
        return Ok(None); // Need more data
    }

    let raw = src.split_to(total).freeze();
    if header.tag != SEQUENCE {
        return Err(FrameError::UnexpectedTag {
            tag: header.tag,
            len: total,
        });
    }

    Frame::parse(raw).map(Some)
}

/// Configuration for the message codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum encoded message size in bytes. Default: 16 MiB.
    pub max_message_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
        }
    }
}
