//! Length-prefixed message framing shared by both pumps.
//!
//! ```text
//! +-----------+---------------------------+--------------------+
//! | flag (1B) | length (4B, big-endian)   | payload (length B) |
//! +-----------+---------------------------+--------------------+
//! ```
//!
//! The flag byte is `0` for an uncompressed payload and `1` for a compressed
//! one. A decoder never yields a message before its full frame has arrived.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::grpc::status::Status;

/// Size of the flag byte plus the length prefix.
pub const HEADER_LEN: usize = 5;

/// Default per-message size limit (4 MiB).
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

/// Largest payload the length prefix can describe.
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

/// Length prefix for a payload of `len` bytes.
pub fn frame_len(len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::TooLarge {
        len,
        max: MAX_FRAME_PAYLOAD,
    })
}

/// One message in transit, without its frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcMessage {
    compressed: bool,
    payload: Bytes,
}

impl GrpcMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            compressed: false,
            payload: payload.into(),
        }
    }

    pub fn with_compression(compressed: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            compressed,
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Length of the frame on the wire, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the framed message to `buf`. Fails without writing when the
    /// payload is longer than the length prefix allows.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame_len(self.payload.len())?;
        buf.reserve(self.encoded_len());
        buf.put_u8(u8::from(self.compressed));
        buf.put_u32(len);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encode the message as a complete frame.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid compressed flag {0:#04x}")]
    InvalidFlag(u8),

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("stream ended inside a message frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

impl From<FrameError> for Status {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { .. } => Status::resource_exhausted(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

/// Incremental decoder over a byte stream split at arbitrary points.
#[derive(Debug)]
pub struct MessageDecoder {
    buffer: BytesMut,
    max_message_len: usize,
}

impl MessageDecoder {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_message_len,
        }
    }

    /// Append bytes received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete message, or `None` if more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<GrpcMessage>, FrameError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let compressed = match self.buffer[0] {
            0 => false,
            1 => true,
            other => return Err(FrameError::InvalidFlag(other)),
        };
        let len = u32::from_be_bytes([self.buffer[1], self.buffer[2], self.buffer[3], self.buffer[4]])
            as usize;
        if len > self.max_message_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_message_len,
            });
        }

        let frame_len = HEADER_LEN + len;
        if self.buffer.len() < frame_len {
            self.buffer.reserve(frame_len - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(GrpcMessage {
            compressed,
            payload,
        }))
    }

    /// Check that the stream ended on a frame boundary.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated {
                buffered: self.buffer.len(),
            })
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}
