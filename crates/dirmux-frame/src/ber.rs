//! Minimal BER primitives: definite-length TLV headers, INTEGER and
//! OCTET STRING. Only single-octet tags are supported, which covers every
//! tag LDAPv3 defines.

use std::ops::Range;

use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};

pub const BOOLEAN: u8 = 0x01;
pub const INTEGER: u8 = 0x02;
pub const OCTET_STRING: u8 = 0x04;
pub const ENUMERATED: u8 = 0x0A;
pub const SEQUENCE: u8 = 0x30;
pub const SET: u8 = 0x31;

/// Length octets beyond this are rejected (4 GiB is already absurd).
const MAX_LENGTH_OCTETS: usize = 4;

/// A decoded tag + length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u8,
    pub header_len: usize,
    pub content_len: usize,
}

impl Header {
    /// Header plus content.
    pub fn total_len(&self) -> usize {
        self.header_len + self.content_len
    }
}

/// Parse a TLV header from the start of `src`.
///
/// Returns `Ok(None)` when more bytes are needed to know the length.
pub fn peek_header(src: &[u8]) -> Result<Option<Header>> {
    if src.len() < 2 {
        return Ok(None);
    }

    let tag = src[0];
    if tag & 0x1F == 0x1F {
        return Err(FrameError::malformed(format!(
            "multi-octet tag 0x{tag:02x} not supported"
        )));
    }

    let first = src[1];
    if first & 0x80 == 0 {
        return Ok(Some(Header {
            tag,
            header_len: 2,
            content_len: first as usize,
        }));
    }

    let octets = (first & 0x7F) as usize;
    if octets == 0 {
        return Err(FrameError::malformed("indefinite length not allowed"));
    }
    if octets > MAX_LENGTH_OCTETS {
        return Err(FrameError::malformed(format!(
            "length uses {octets} octets (max {MAX_LENGTH_OCTETS})"
        )));
    }
    if src.len() < 2 + octets {
        return Ok(None);
    }

    let content_len = src[2..2 + octets]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);

    Ok(Some(Header {
        tag,
        header_len: 2 + octets,
        content_len,
    }))
}

/// Append a definite length.
pub fn put_length(len: usize, dst: &mut BytesMut) {
    if len < 0x80 {
        dst.put_u8(len as u8);
        return;
    }
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let significant = &bytes[skip..];
    dst.put_u8(0x80 | significant.len() as u8);
    dst.put_slice(significant);
}

/// Append a complete TLV.
pub fn put_tlv(tag: u8, content: &[u8], dst: &mut BytesMut) {
    dst.reserve(content.len() + 6);
    dst.put_u8(tag);
    put_length(content.len(), dst);
    dst.put_slice(content);
}

/// Append an INTEGER-encoded value under `tag`.
pub fn put_integer(tag: u8, value: i64, dst: &mut BytesMut) {
    let bytes = value.to_be_bytes();
    put_tlv(tag, &bytes[minimal_integer_start(&bytes)..], dst);
}

/// Content octets of a minimal two's-complement INTEGER.
pub fn integer_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    bytes[minimal_integer_start(&bytes)..].to_vec()
}

fn minimal_integer_start(bytes: &[u8; 8]) -> usize {
    let mut start = 0;
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    start
}

/// Decode INTEGER content octets.
pub fn decode_integer(content: &[u8]) -> Result<i64> {
    if content.is_empty() {
        return Err(FrameError::malformed("empty INTEGER"));
    }
    if content.len() > 8 {
        return Err(FrameError::malformed(format!(
            "INTEGER of {} octets does not fit in 64 bits",
            content.len()
        )));
    }
    let seed: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(content
        .iter()
        .fold(seed, |acc, b| (acc << 8) | i64::from(*b)))
}

/// A span inside a decoder's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: u8,
    /// Whole TLV, header included.
    pub full: Range<usize>,
    /// Content octets only.
    pub content: Range<usize>,
}

/// Sequential reader over the content of a constructed element.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Tag of the next element, if any.
    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Read the next element and return its spans.
    pub fn next_element(&mut self) -> Result<Element> {
        let rest = &self.buf[self.pos..];
        let header = peek_header(rest)?
            .ok_or_else(|| FrameError::malformed("truncated element header"))?;
        if header.total_len() > rest.len() {
            return Err(FrameError::malformed(format!(
                "element 0x{:02x} claims {} bytes, {} available",
                header.tag,
                header.content_len,
                rest.len() - header.header_len
            )));
        }

        let start = self.pos;
        let content_start = start + header.header_len;
        let end = start + header.total_len();
        self.pos = end;

        Ok(Element {
            tag: header.tag,
            full: start..end,
            content: content_start..end,
        })
    }

    /// Read the next element, requiring `tag`, and return its content.
    pub fn expect(&mut self, tag: u8) -> Result<&'a [u8]> {
        let element = self.next_element()?;
        if element.tag != tag {
            return Err(FrameError::malformed(format!(
                "expected tag 0x{tag:02x}, found 0x{:02x}",
                element.tag
            )));
        }
        Ok(&self.buf[element.content])
    }

    /// Read an INTEGER-encoded element under `tag`.
    pub fn read_integer(&mut self, tag: u8) -> Result<i64> {
        decode_integer(self.expect(tag)?)
    }

    /// Read a string-encoded element under `tag`, replacing invalid UTF-8.
    pub fn read_string(&mut self, tag: u8) -> Result<String> {
        Ok(String::from_utf8_lossy(self.expect(tag)?).into_owned())
    }

    /// Read the element only if its tag is `tag`.
    pub fn read_optional(&mut self, tag: u8) -> Result<Option<&'a [u8]>> {
        if self.peek_tag() == Some(tag) {
            self.expect(tag).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Skip whatever element comes next.
    pub fn skip(&mut self) -> Result<()> {
        self.next_element().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_lengths() {
        let mut buf = BytesMut::new();
        put_length(5, &mut buf);
        assert_eq!(buf.as_ref(), &[0x05]);

        buf.clear();
        put_length(0x80, &mut buf);
        assert_eq!(buf.as_ref(), &[0x81, 0x80]);

        buf.clear();
        put_length(0x1_0000, &mut buf);
        assert_eq!(buf.as_ref(), &[0x83, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn minimal_integer_encodings() {
        assert_eq!(integer_content(0), vec![0x00]);
        assert_eq!(integer_content(127), vec![0x7F]);
        assert_eq!(integer_content(128), vec![0x00, 0x80]);
        assert_eq!(integer_content(256), vec![0x01, 0x00]);
        assert_eq!(integer_content(-1), vec![0xFF]);
        assert_eq!(integer_content(-129), vec![0xFF, 0x7F]);
        assert_eq!(
            integer_content(i64::from(i32::MAX)),
            vec![0x7F, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn integer_decoding_sign_extends() {
        assert_eq!(decode_integer(&[0x00, 0x80]).unwrap(), 128);
        assert_eq!(decode_integer(&[0xFF, 0x7F]).unwrap(), -129);
        assert_eq!(decode_integer(&[0x05]).unwrap(), 5);
        assert!(decode_integer(&[]).is_err());
        assert!(decode_integer(&[0; 9]).is_err());
    }

    #[test]
    fn header_needs_more_bytes() {
        assert_eq!(peek_header(&[0x30]).unwrap(), None);
        assert_eq!(peek_header(&[0x30, 0x82, 0x01]).unwrap(), None);
    }

    #[test]
    fn header_rejects_indefinite_length() {
        assert!(matches!(
            peek_header(&[0x30, 0x80]),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn decoder_walks_sequence_content() {
        let mut content = BytesMut::new();
        put_integer(INTEGER, 42, &mut content);
        put_tlv(OCTET_STRING, b"cn=admin", &mut content);

        let mut decoder = Decoder::new(&content);
        assert_eq!(decoder.read_integer(INTEGER).unwrap(), 42);
        assert_eq!(decoder.read_optional(ENUMERATED).unwrap(), None);
        assert_eq!(decoder.read_string(OCTET_STRING).unwrap(), "cn=admin");
        assert!(decoder.is_empty());
    }

    #[test]
    fn decoder_rejects_overlong_element() {
        let bytes = [OCTET_STRING, 0x05, b'a', b'b'];
        let mut decoder = Decoder::new(&bytes);
        assert!(matches!(
            decoder.expect(OCTET_STRING),
            Err(FrameError::Malformed(_))
        ));
    }
}
