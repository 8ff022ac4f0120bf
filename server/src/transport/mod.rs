//! The HTTP side of a call, as seen by the dispatch engine.
//!
//! The engine does not speak HTTP/2 itself. A host server hands it an
//! [`HttpRequest`] (headers plus a body stream) and a [`ResponseSink`] that
//! turns header, data and trailer writes into HTTP/2 frames.

pub mod memory;

use bytes::Bytes;
use futures::Stream;
use futures::future::BoxFuture;
use grpc::Metadata;
use std::fmt;
use std::io;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Request body: the raw DATA payload in arrival order.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// An inbound HTTP request routed to the engine.
pub struct HttpRequest {
    /// Request path, `/{service}/{method}`.
    pub path: String,
    /// Request headers, without pseudo-headers.
    pub headers: Metadata,
    /// The `:authority` of the request.
    pub host: Option<String>,
    /// Remote address of the client.
    pub peer: Option<String>,
    pub body: BodyStream,
    /// Fires when the client resets the stream or the connection drops.
    pub aborted: CancellationToken,
}

impl HttpRequest {
    /// `content-type` header, if present.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("host", &self.host)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Where a response goes.
///
/// Calls are made in protocol order: at most one `write_headers`, then any
/// number of `write_data`, then at most one `write_trailers`. A header write
/// with `end_of_stream` set is a trailers-only response and nothing follows.
pub trait ResponseSink: Send {
    fn write_headers(
        &mut self,
        http_status: u16,
        headers: Metadata,
        end_of_stream: bool,
    ) -> BoxFuture<'_, io::Result<()>>;

    /// Write body bytes. With `flush` unset the sink may hold the data back
    /// until a later flush or the trailers.
    fn write_data(&mut self, data: Bytes, flush: bool) -> BoxFuture<'_, io::Result<()>>;

    fn write_trailers(&mut self, trailers: Metadata) -> BoxFuture<'_, io::Result<()>>;
}
