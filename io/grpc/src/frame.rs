//! gRPC message framing.
//!
//! gRPC messages are length-prefixed with the following format:
//! - 1 byte: compressed flag (0 = uncompressed, 1 = compressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload
//!
//! The decoder is incremental: transport chunks are fed in as they arrive and
//! complete frames are pulled out. A frame is only returned once all of its
//! payload bytes have been buffered, so short reads never surface as messages.

use crate::status::{Code, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the gRPC message header (1 byte flag + 4 bytes length).
pub const HEADER_SIZE: usize = 5;

/// Default maximum size of a received message (4MB, matches gRPC default).
pub const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Largest length a frame header may declare.
///
/// The length field is unsigned on the wire, but lengths that do not fit a
/// signed 32-bit integer are rejected.
pub const MAX_FRAME_LENGTH: u32 = i32::MAX as u32;

/// A decoded gRPC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Whether the payload is compressed with the call's negotiated encoding.
    pub compressed: bool,
    /// The (possibly compressed) message bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame.
    pub fn new(compressed: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            compressed,
            payload: payload.into(),
        }
    }

    /// Length of the payload in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Framing faults. Each one is fatal to the call it occurs on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The stream ended part way through a header or payload.
    #[error("Incomplete message.")]
    Incomplete,
    /// A length above [`MAX_FRAME_LENGTH`], either declared by a header or
    /// of a payload being framed.
    #[error("Message too large to represent: {length} bytes.")]
    TooLarge { length: usize },
    /// The message is larger than the configured receive limit.
    #[error("Received message exceeds the maximum configured message size.")]
    ReceiveLimitExceeded { length: usize, limit: usize },
    /// The message is larger than the configured send limit.
    #[error("Sending message exceeds the maximum configured message size.")]
    SendLimitExceeded { length: usize, limit: usize },
    /// A single-message request carried more than one frame.
    #[error("Additional data after the message received.")]
    AdditionalData,
    /// A compressed frame arrived but no provider handles the call's encoding.
    #[error("No decompression provider for encoding '{encoding}'.")]
    NoDecompressionProvider { encoding: String },
    /// The compression provider failed on the payload.
    #[error("Failed to decompress message: {0}")]
    Decompression(String),
    /// The compression provider failed on an outgoing payload.
    #[error("Failed to compress message: {0}")]
    Compression(String),
}

impl FrameError {
    /// The status code this fault is reported with.
    pub fn code(&self) -> Code {
        match self {
            FrameError::Incomplete
            | FrameError::TooLarge { .. }
            | FrameError::AdditionalData
            | FrameError::Decompression(_)
            | FrameError::Compression(_) => Code::Internal,
            FrameError::ReceiveLimitExceeded { .. } | FrameError::SendLimitExceeded { .. } => {
                Code::ResourceExhausted
            }
            FrameError::NoDecompressionProvider { .. } => Code::Unimplemented,
        }
    }
}

impl From<FrameError> for Status {
    fn from(e: FrameError) -> Self {
        Status::new(e.code(), e.to_string())
    }
}

/// Encode a message into gRPC wire format.
///
/// Returns the encoded message with the length prefix.
pub fn encode_message(data: &[u8]) -> Result<Bytes, FrameError> {
    encode_message_with_compression(data, false)
}

/// Encode a message with explicit compression flag.
pub fn encode_message_with_compression(
    data: &[u8],
    compressed: bool,
) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    encode_frame(compressed, data, &mut buf)?;
    Ok(buf.freeze())
}

/// Append one frame to `out`.
///
/// Payloads longer than [`MAX_FRAME_LENGTH`] are rejected and nothing is
/// written.
pub fn encode_frame(
    compressed: bool,
    payload: &[u8],
    out: &mut BytesMut,
) -> Result<(), FrameError> {
    encode_frame_with_limit(compressed, payload, out, MAX_FRAME_LENGTH)
}

fn encode_frame_with_limit(
    compressed: bool,
    payload: &[u8],
    out: &mut BytesMut,
    max_length: u32,
) -> Result<(), FrameError> {
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|&length| length <= max_length)
        .ok_or(FrameError::TooLarge {
            length: payload.len(),
        })?;
    out.reserve(HEADER_SIZE + payload.len());
    out.put_u8(u8::from(compressed));
    out.put_u32(length);
    out.put_slice(payload);
    Ok(())
}

/// Decode a single frame from the front of `buf`.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded, `Ok(None)` if
/// more data is needed, or `Err` on a framing fault. The length is validated
/// as soon as the header is available, before the payload arrives.
pub fn decode_message(
    buf: &mut BytesMut,
    max_message_size: Option<usize>,
) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    // Peek at header without consuming
    let compressed = buf[0] != 0;
    let declared = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);

    if declared > MAX_FRAME_LENGTH {
        return Err(FrameError::TooLarge {
            length: declared as usize,
        });
    }

    let length = declared as usize;
    if let Some(limit) = max_message_size
        && length > limit
    {
        return Err(FrameError::ReceiveLimitExceeded { length, limit });
    }

    let total_size = HEADER_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(length).freeze();

    Ok(Some(Frame {
        compressed,
        payload,
    }))
}

/// Stateful decoder for gRPC messages.
///
/// Useful for incrementally decoding messages from a stream.
#[derive(Debug)]
pub struct MessageDecoder {
    /// Buffer for incomplete messages.
    buffer: BytesMut,
    /// Receive limit, `None` for unlimited.
    max_message_size: Option<usize>,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder {
    /// Create a decoder with the default receive limit.
    pub fn new() -> Self {
        Self::with_max_message_size(Some(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE))
    }

    /// Create a decoder with an explicit receive limit (`None` = unlimited).
    pub fn with_max_message_size(max_message_size: Option<usize>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    /// The configured receive limit.
    pub fn max_message_size(&self) -> Option<usize> {
        self.max_message_size
    }

    /// Feed data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame.
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        decode_message(&mut self.buffer, self.max_message_size)
    }

    /// Signal that the underlying stream has ended.
    ///
    /// Ending on a frame boundary is a clean end of stream; any leftover
    /// bytes mean a header or payload was cut short.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Incomplete)
        }
    }

    /// Check if there's any buffered data.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Get the amount of buffered data.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
