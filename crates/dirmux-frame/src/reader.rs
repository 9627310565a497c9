use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use tracing::debug;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete messages from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete messages.
/// Bytes already received stay buffered when the stream reports
/// `WouldBlock` or `TimedOut`, so a read timeout can be used to poll.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Top-level elements that are not LDAPMessage sequences are skipped.
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            match decode_frame(&mut self.buf, self.config.max_message_size) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(FrameError::UnexpectedTag { tag, len }) => {
                    debug!(tag, len, "skipping non-message element");
                    continue;
                }
                Err(err) => return Err(err),
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Number of received bytes not yet returned as a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::encode_message;
    use crate::op::ProtocolOp;

    fn wire(messages: &[(i32, ProtocolOp, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (id, op, content) in messages {
            encode_message(*id, *op, content, None, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_multiple_frames() {
        let bytes = wire(&[
            (1, ProtocolOp::SearchResultEntry, &b"one"[..]),
            (1, ProtocolOp::SearchResultEntry, &b"two"[..]),
            (2, ProtocolOp::DelResponse, &b"three"[..]),
        ]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!((f1.message_id, f1.op_content().as_ref()), (1, b"one".as_ref()));
        assert_eq!((f2.message_id, f2.op_content().as_ref()), (1, b"two".as_ref()));
        assert_eq!((f3.message_id, f3.op), (2, ProtocolOp::DelResponse));
    }

    #[test]
    fn read_frame_with_large_payload() {
        let payload = vec![0xAB; 64 * 1024];
        let bytes = wire(&[(9, ProtocolOp::SearchResultEntry, payload.as_slice())]);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.message_id, 9);
        assert_eq!(frame.op_content().as_ref(), payload.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: wire(&[(4, ProtocolOp::DelRequest, &b"slow"[..])]),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.message_id, 4);
        assert_eq!(frame.op_content().as_ref(), b"slow");
    }

    #[test]
    fn skips_non_sequence_elements() {
        let mut bytes = vec![0x04, 0x03, b'j', b'u', b'n'];
        bytes.extend(wire(&[(6, ProtocolOp::DelResponse, &b"ok"[..])]));

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.message_id, 6);
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        partial.put_u8(0x30);
        partial.put_u8(0x10);
        partial.put_slice(b"\x02\x01\x01only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let bytes = vec![0x30, 0x82, 0x04, 0x00];
        let cfg = FrameConfig {
            max_message_size: 16,
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge { .. }));
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn would_block_keeps_partial_bytes() {
        let bytes = wire(&[(8, ProtocolOp::DelResponse, &b"ok"[..])]);
        let split = bytes.len() / 2;
        let reader = StutteringReader {
            chunks: vec![
                Ok(bytes[..split].to_vec()),
                Err(ErrorKind::WouldBlock),
                Ok(bytes[split..].to_vec()),
            ],
        };
        let mut framed = FrameReader::new(reader);

        let err = framed.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
        assert_eq!(framed.buffered(), split);

        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.message_id, 8);
        assert_eq!(framed.buffered(), 0);
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = StutteringReader {
            chunks: vec![
                Err(ErrorKind::Interrupted),
                Ok(wire(&[(5, ProtocolOp::DelResponse, &b"ok"[..])])),
            ],
        };
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.message_id, 5);
    }

    struct StutteringReader {
        chunks: Vec<std::result::Result<Vec<u8>, ErrorKind>>,
    }

    impl Read for StutteringReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            match self.chunks.remove(0) {
                Ok(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Err(kind) => Err(std::io::Error::from(kind)),
            }
        }
    }

    #[test]
    #[cfg(unix)]
    fn roundtrip_over_socketpair() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer
            .send(11, &crate::message::Request::abandon(3))
            .unwrap();
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.message_id, 11);
        assert_eq!(frame.op, ProtocolOp::AbandonRequest);
    }
}
