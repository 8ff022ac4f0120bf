//! grpc - gRPC wire-level building blocks.
//!
//! This crate has no runtime dependency. It provides the pieces a gRPC
//! server needs below the call-dispatch layer:
//!
//! - length-prefixed message framing
//! - status codes and the terminal call status, rendered as trailers
//! - metadata with binary (`-bin`) entries
//! - the `grpc-timeout` header
//! - compression providers keyed by `grpc-encoding`
//!
//! # Architecture
//!
//! gRPC messages are framed as:
//! - 1 byte: compressed flag (0 = uncompressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload (typically protobuf)
//!
//! Message encoding is left to the application's marshallers.

pub mod compression;
pub mod frame;
pub mod metadata;
pub mod status;
pub mod timeout;

pub use compression::{
    CompressionLevel, CompressionProvider, CompressionRegistry, GzipCompressionProvider,
};
pub use frame::{
    DEFAULT_MAX_RECEIVE_MESSAGE_SIZE, Frame, FrameError, MessageDecoder, decode_message,
    encode_frame, encode_message,
};
pub use metadata::Metadata;
pub use status::{Code, Status};
pub use timeout::Timeout;
