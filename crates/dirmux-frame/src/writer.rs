use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::message::Request;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete messages to any `Write` stream.
///
/// Every call writes one whole message and flushes, so a caller holding
/// exclusive access to the writer never leaves a partial message behind
/// on success.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete, already decoded message (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_encoded(frame.raw())
    }

    /// Encode `request` under `message_id` and send it.
    pub fn send(&mut self, message_id: i32, request: &Request) -> Result<()> {
        self.buf.clear();
        request.encode(message_id, &mut self.buf)?;
        let encoded = self.buf.split().freeze();
        self.write_encoded(&encoded)
    }

    /// Write bytes that already form one encoded message, then flush.
    pub fn write_encoded(&mut self, encoded: &[u8]) -> Result<()> {
        if encoded.len() > self.config.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size: encoded.len(),
                max: self.config.max_message_size,
            });
        }

        let mut offset = 0usize;
        while offset < encoded.len() {
            match self.inner.write(&encoded[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
