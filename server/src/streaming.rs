//! Typed request readers and response writers over the framed body.

use crate::context::{ServerCallContext, WriteOptions};
use crate::error::Error;
use crate::method::Marshaller;
use crate::metrics;
use crate::transport::BodyStream;
use bytes::Bytes;
use futures::StreamExt;
use grpc::compression::IDENTITY;
use grpc::{CompressionProvider, FrameError, MessageDecoder};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Pulls message payloads off a request body.
///
/// Short reads are buffered until a whole frame is available. Every wait on
/// the body observes the call's cancellation.
pub(crate) struct FrameReader {
    body: BodyStream,
    decoder: MessageDecoder,
    eof: bool,
    cancel: CancellationToken,
    /// The request's `grpc-encoding`, `None` for identity.
    decompressor: Option<Arc<dyn CompressionProvider>>,
    max_message_size: Option<usize>,
}

impl FrameReader {
    pub(crate) fn new(
        body: BodyStream,
        max_message_size: Option<usize>,
        decompressor: Option<Arc<dyn CompressionProvider>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            body,
            decoder: MessageDecoder::with_max_message_size(max_message_size),
            eof: false,
            cancel,
            decompressor,
            max_message_size,
        }
    }

    /// The next decompressed payload, or `None` at a clean end of stream.
    pub(crate) async fn next_payload(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if let Some(frame) = self.decoder.decode()? {
                if !frame.compressed {
                    return Ok(Some(frame.payload));
                }
                let Some(provider) = &self.decompressor else {
                    return Err(FrameError::NoDecompressionProvider {
                        encoding: IDENTITY.to_string(),
                    }
                    .into());
                };
                let payload = provider.decompress_limited(&frame.payload, self.max_message_size)?;
                return Ok(Some(Bytes::from(payload)));
            }

            if self.eof {
                self.decoder.finish()?;
                return Ok(None);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                chunk = self.body.next() => match chunk {
                    Some(Ok(data)) => self.decoder.feed(&data),
                    Some(Err(e)) => return Err(Error::Transport(e)),
                    None => self.eof = true,
                },
            }
        }
    }

    /// Read a single-message request: exactly one frame, then end of
    /// stream.
    pub(crate) async fn read_single<T>(&mut self, marshaller: &Marshaller<T>) -> Result<T, Error> {
        let payload = self.next_payload().await?.ok_or(FrameError::Incomplete)?;
        if self.next_payload().await?.is_some() {
            return Err(FrameError::AdditionalData.into());
        }
        let message = marshaller.deserialize(&payload)?;
        metrics::MESSAGES_RECEIVED.increment();
        Ok(message)
    }
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("buffered", &self.decoder.buffered_len())
            .field("eof", &self.eof)
            .finish()
    }
}

struct ReaderState<T> {
    reader: FrameReader,
    marshaller: Marshaller<T>,
    current: Option<T>,
    done: bool,
}

/// The request messages of a client-streaming or duplex call.
///
/// One read may be outstanding at a time; clones share the same position.
pub struct RequestStream<T> {
    state: Arc<Mutex<ReaderState<T>>>,
    context: ServerCallContext,
}

impl<T> Clone for RequestStream<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            context: self.context.clone(),
        }
    }
}

impl<T: Send + 'static> RequestStream<T> {
    pub(crate) fn new(reader: FrameReader, marshaller: Marshaller<T>, context: ServerCallContext) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReaderState {
                reader,
                marshaller,
                current: None,
                done: false,
            })),
            context,
        }
    }

    /// Advance to the next message. Returns `false` once the client has
    /// finished sending.
    pub async fn move_next(&self) -> Result<bool, Error> {
        if self.context.is_complete() {
            return Err(Error::invalid_operation(
                "Can't read messages after the request is complete.",
            ));
        }
        let mut state = self.state.try_lock().map_err(|_| {
            Error::invalid_operation(
                "Can't read messages because a previous read is still in progress.",
            )
        })?;

        if state.done {
            state.current = None;
            return Ok(false);
        }
        match state.reader.next_payload().await? {
            Some(payload) => {
                let message = state.marshaller.deserialize(&payload)?;
                metrics::MESSAGES_RECEIVED.increment();
                state.current = Some(message);
                Ok(true)
            }
            None => {
                state.done = true;
                state.current = None;
                Ok(false)
            }
        }
    }

    /// The message the last successful `move_next` landed on.
    pub fn current(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.try_lock().ok()?.current.clone()
    }

    /// Take the current message, leaving nothing in its place.
    pub fn take_current(&self) -> Option<T> {
        self.state.try_lock().ok()?.current.take()
    }

    /// `move_next` and `take_current` in one step.
    pub async fn next_message(&self) -> Result<Option<T>, Error> {
        if self.move_next().await? {
            Ok(self.take_current())
        } else {
            Ok(None)
        }
    }
}

impl<T> fmt::Debug for RequestStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStream")
            .field("method", &self.context.method())
            .finish_non_exhaustive()
    }
}

struct WriterInner<T> {
    context: ServerCallContext,
    marshaller: Marshaller<T>,
    in_flight: Mutex<()>,
    completed: AtomicBool,
}

/// Writes the response messages of a server-streaming or duplex call.
pub struct ServerStreamWriter<T> {
    inner: Arc<WriterInner<T>>,
}

impl<T> Clone for ServerStreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ServerStreamWriter<T> {
    pub(crate) fn new(context: ServerCallContext, marshaller: Marshaller<T>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                context,
                marshaller,
                in_flight: Mutex::new(()),
                completed: AtomicBool::new(false),
            }),
        }
    }

    /// Write a message with the context's current write options.
    pub async fn write(&self, message: &T) -> Result<(), Error> {
        let options = self.inner.context.write_options();
        self.write_with_options(message, options).await
    }

    pub async fn write_with_options(&self, message: &T, options: WriteOptions) -> Result<(), Error> {
        if self.inner.completed.load(Ordering::Acquire) {
            return Err(Error::invalid_operation(
                "Writing is not allowed after writer was completed.",
            ));
        }
        let context = &self.inner.context;
        if context.is_complete() || context.is_cancelled() {
            return Err(Error::request_complete());
        }
        let _in_flight = self.inner.in_flight.try_lock().map_err(|_| {
            Error::invalid_operation(
                "Can't write the message because the previous write is in progress.",
            )
        })?;

        let payload = self.inner.marshaller.serialize(message)?;
        let response = context.response();
        let frame = response.encode(&payload, options)?;
        response.write_frame(frame, options).await
    }

    /// No writes are accepted after this.
    pub(crate) fn complete(&self) {
        self.inner.completed.store(true, Ordering::Release);
    }
}

impl<T> fmt::Debug for ServerStreamWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStreamWriter")
            .field("method", &self.inner.context.method())
            .field("completed", &self.inner.completed.load(Ordering::Relaxed))
            .finish()
    }
}
