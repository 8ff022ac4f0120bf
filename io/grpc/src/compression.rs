//! Message compression providers.
//!
//! A provider is keyed by its `grpc-encoding` name. The `identity` encoding
//! is always supported and never needs a provider.

use crate::frame::FrameError;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

/// Request header naming the encoding of compressed request frames.
pub const GRPC_ENCODING: &str = "grpc-encoding";
/// Header listing the encodings a peer accepts.
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
/// Request header a client uses to ask for a specific response encoding.
pub const GRPC_INTERNAL_ENCODING_REQUEST: &str = "grpc-internal-encoding-request";
/// The no-op encoding.
pub const IDENTITY: &str = "identity";

/// How hard a provider should work when compressing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Store only.
    None,
    #[default]
    Fastest,
    Optimal,
}

/// A compression algorithm usable for gRPC messages.
pub trait CompressionProvider: Send + Sync {
    /// The `grpc-encoding` name, e.g. `gzip`.
    fn encoding_name(&self) -> &str;

    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, FrameError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, FrameError>;

    /// Decompress, refusing output larger than `limit` bytes.
    fn decompress_limited(&self, data: &[u8], limit: Option<usize>) -> Result<Vec<u8>, FrameError> {
        let out = self.decompress(data)?;
        if let Some(limit) = limit
            && out.len() > limit
        {
            return Err(FrameError::ReceiveLimitExceeded {
                length: out.len(),
                limit,
            });
        }
        Ok(out)
    }
}

/// Gzip via `flate2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipCompressionProvider;

impl CompressionProvider for GzipCompressionProvider {
    fn encoding_name(&self) -> &str {
        "gzip"
    }

    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, FrameError> {
        let level = match level {
            CompressionLevel::None => flate2::Compression::none(),
            CompressionLevel::Fastest => flate2::Compression::fast(),
            CompressionLevel::Optimal => flate2::Compression::best(),
        };
        let mut encoder = flate2::write::GzEncoder::new(Vec::with_capacity(data.len() / 2), level);
        encoder
            .write_all(data)
            .map_err(|e| FrameError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| FrameError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        self.decompress_limited(data, None)
    }

    fn decompress_limited(&self, data: &[u8], limit: Option<usize>) -> Result<Vec<u8>, FrameError> {
        let decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        match limit {
            // Read one byte past the limit so an oversized message is detected
            // without inflating all of it.
            Some(limit) => {
                decoder
                    .take(limit as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| FrameError::Decompression(e.to_string()))?;
                if out.len() > limit {
                    return Err(FrameError::ReceiveLimitExceeded {
                        length: out.len(),
                        limit,
                    });
                }
            }
            None => {
                let mut decoder = decoder;
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| FrameError::Decompression(e.to_string()))?;
            }
        }
        Ok(out)
    }
}

/// The set of providers a server supports. Immutable once built.
#[derive(Clone, Default)]
pub struct CompressionRegistry {
    providers: HashMap<String, Arc<dyn CompressionProvider>>,
    /// Registration order, for the advertised accept-encoding list.
    order: Vec<String>,
}

impl fmt::Debug for CompressionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionRegistry")
            .field("encodings", &self.order)
            .finish()
    }
}

impl CompressionRegistry {
    /// Registry with no providers (identity only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in gzip provider.
    pub fn with_defaults() -> Self {
        Self::new().with_provider(Arc::new(GzipCompressionProvider))
    }

    /// Add a provider, replacing any existing one with the same name.
    pub fn with_provider(mut self, provider: Arc<dyn CompressionProvider>) -> Self {
        let name = provider.encoding_name().to_ascii_lowercase();
        if self.providers.insert(name.clone(), provider).is_none() {
            self.order.push(name);
        }
        self
    }

    /// Look up a provider. `identity` has none.
    pub fn get(&self, encoding: &str) -> Option<&Arc<dyn CompressionProvider>> {
        self.providers.get(&encoding.trim().to_ascii_lowercase())
    }

    /// Whether `encoding` can be handled (identity always can).
    pub fn supports(&self, encoding: &str) -> bool {
        encoding.trim().eq_ignore_ascii_case(IDENTITY) || self.get(encoding).is_some()
    }

    /// Value for `grpc-accept-encoding`: identity followed by every
    /// registered provider.
    pub fn accept_encoding(&self) -> String {
        std::iter::once(IDENTITY)
            .chain(self.order.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Whether a comma separated `grpc-accept-encoding` value lists `encoding`.
pub fn accepts(accept_encoding: &str, encoding: &str) -> bool {
    accept_encoding
        .split(',')
        .any(|e| e.trim().eq_ignore_ascii_case(encoding))
}
