//! The response half of a call.
//!
//! Owns the transport sink and enforces the response invariants: headers go
//! out at most once, data only after headers, and exactly one status ends
//! the response (as trailers, or folded into the headers when nothing was
//! sent yet).

use crate::context::WriteOptions;
use crate::error::Error;
use crate::metrics;
use crate::server::ServerOptions;
use crate::transport::ResponseSink;
use bytes::{Bytes, BytesMut};
use grpc::compression::{GRPC_ACCEPT_ENCODING, GRPC_ENCODING, IDENTITY};
use grpc::metadata::is_reserved_key;
use grpc::{CompressionProvider, FrameError, Metadata, Status};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub(crate) const GRPC_CONTENT_TYPE: &str = "application/grpc";

struct SinkState {
    sink: Box<dyn ResponseSink>,
    headers_sent: bool,
}

pub(crate) struct ResponseChannel {
    state: Mutex<SinkState>,
    finalized: AtomicBool,
    cancel: CancellationToken,
    options: Arc<ServerOptions>,
    /// Negotiated response encoding; `None` is identity.
    encoding: Option<Arc<dyn CompressionProvider>>,
}

impl ResponseChannel {
    pub(crate) fn new(
        sink: Box<dyn ResponseSink>,
        cancel: CancellationToken,
        options: Arc<ServerOptions>,
        encoding: Option<Arc<dyn CompressionProvider>>,
    ) -> Self {
        Self {
            state: Mutex::new(SinkState {
                sink,
                headers_sent: false,
            }),
            finalized: AtomicBool::new(false),
            cancel,
            options,
            encoding,
        }
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub(crate) fn encoding_name(&self) -> &str {
        self.encoding
            .as_ref()
            .map_or(IDENTITY, |p| p.encoding_name())
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_finalized() || self.cancel.is_cancelled() {
            Err(Error::request_complete())
        } else {
            Ok(())
        }
    }

    fn response_headers(&self, extra: &Metadata) -> Metadata {
        let mut headers = Metadata::new();
        headers.insert("content-type", GRPC_CONTENT_TYPE);
        headers.insert(GRPC_ENCODING, self.encoding_name());
        headers.insert(GRPC_ACCEPT_ENCODING, self.options.compression.accept_encoding());
        for (key, value) in extra.iter() {
            if !is_reserved_key(key) {
                headers.insert(key, value);
            }
        }
        headers
    }

    /// Send the response headers explicitly. Fails if they already went out.
    pub(crate) async fn send_headers(&self, extra: Metadata) -> Result<(), Error> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        self.ensure_open()?;
        if state.headers_sent {
            return Err(Error::invalid_operation(
                "Response headers can only be sent once per call.",
            ));
        }
        state.headers_sent = true;
        let headers = self.response_headers(&extra);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::request_complete()),
            result = state.sink.write_headers(200, headers, false) => result.map_err(Error::Transport),
        }
    }

    /// Serialize-independent half of a message write: enforce the send
    /// limit, compress when negotiated, and frame.
    pub(crate) fn encode(&self, payload: &[u8], options: WriteOptions) -> Result<Bytes, Error> {
        if let Some(limit) = self.options.max_send_message_size
            && payload.len() > limit
        {
            return Err(FrameError::SendLimitExceeded {
                length: payload.len(),
                limit,
            }
            .into());
        }

        let mut out = BytesMut::new();
        match &self.encoding {
            Some(provider)
                if !options.no_compress && payload.len() >= self.options.compression_min_size =>
            {
                let compressed = provider.compress(payload, self.options.compression_level)?;
                grpc::encode_frame(true, &compressed, &mut out)?;
            }
            _ => grpc::encode_frame(false, payload, &mut out)?,
        }
        Ok(out.freeze())
    }

    /// Write one framed message, sending default headers first if needed.
    pub(crate) async fn write_frame(&self, frame: Bytes, options: WriteOptions) -> Result<(), Error> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        self.ensure_open()?;

        let write = async {
            if !state.headers_sent {
                state.headers_sent = true;
                let headers = self.response_headers(&Metadata::new());
                state.sink.write_headers(200, headers, false).await?;
            }
            state.sink.write_data(frame, !options.buffer_hint).await
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::request_complete()),
            result = write => {
                result.map_err(Error::Transport)?;
                metrics::MESSAGES_SENT.increment();
                Ok(())
            }
        }
    }

    /// End the response with `status`. Context trailers come first.
    ///
    /// Only the first call has any effect; returns whether this call
    /// finalized the response.
    pub(crate) async fn finish(&self, status: &Status, trailers: Metadata) -> bool {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut block = trailers;
        block.extend_from(&status.to_trailers());

        let mut state = self.state.lock().await;
        let result = if state.headers_sent {
            state.sink.write_trailers(block).await
        } else {
            state.headers_sent = true;
            let mut headers = Metadata::new();
            headers.insert("content-type", GRPC_CONTENT_TYPE);
            headers.extend_from(&block);
            state.sink.write_headers(200, headers, true).await
        };

        if let Err(e) = result {
            tracing::debug!(error = %e, "failed to write call status");
        }
        true
    }

    /// Reject the request before it becomes a call: a trailers-only
    /// response with an explicit HTTP status.
    pub(crate) async fn reject(
        sink: &mut dyn ResponseSink,
        http_status: u16,
        status: &Status,
        extra: Metadata,
    ) {
        let mut headers = Metadata::new();
        headers.insert("content-type", GRPC_CONTENT_TYPE);
        headers.extend_from(&extra);
        headers.extend_from(&status.to_trailers());
        if let Err(e) = sink.write_headers(http_status, headers, true).await {
            tracing::debug!(error = %e, "failed to write rejection");
        }
    }
}

impl std::fmt::Debug for ResponseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseChannel")
            .field("finalized", &self.is_finalized())
            .field("encoding", &self.encoding_name())
            .finish()
    }
}
