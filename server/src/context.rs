//! Per-call state shared by handlers, interceptors and streaming adapters.

use crate::deadline::Deadline;
use crate::error::Error;
use crate::method::MethodInfo;
use crate::response::ResponseChannel;
use grpc::metadata::is_reserved_key;
use grpc::{Metadata, Status};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a response message is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Let the transport hold the message back instead of flushing it now.
    pub buffer_hint: bool,
    /// Send this message uncompressed even if the call negotiated an
    /// encoding.
    pub no_compress: bool,
}

impl WriteOptions {
    pub fn buffered() -> Self {
        Self {
            buffer_hint: true,
            ..Self::default()
        }
    }

    pub fn uncompressed() -> Self {
        Self {
            no_compress: true,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct MutableState {
    trailers: Metadata,
    status: Option<Status>,
    write_options: WriteOptions,
}

struct Inner {
    method: MethodInfo,
    host: Option<String>,
    peer: Option<String>,
    request_headers: Metadata,
    deadline: Deadline,
    cancellation: CancellationToken,
    deadline_expired: AtomicBool,
    state: Mutex<MutableState>,
    response: Arc<ResponseChannel>,
}

/// The context of one call.
///
/// Cheap to clone; all clones refer to the same call.
#[derive(Clone)]
pub struct ServerCallContext {
    inner: Arc<Inner>,
}

pub(crate) struct ContextParts {
    pub method: MethodInfo,
    pub host: Option<String>,
    pub peer: Option<String>,
    pub request_headers: Metadata,
    pub deadline: Deadline,
    pub cancellation: CancellationToken,
    pub response: Arc<ResponseChannel>,
}

impl ServerCallContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                method: parts.method,
                host: parts.host,
                peer: parts.peer,
                request_headers: parts.request_headers,
                deadline: parts.deadline,
                cancellation: parts.cancellation,
                deadline_expired: AtomicBool::new(false),
                state: Mutex::new(MutableState::default()),
                response: parts.response,
            }),
        }
    }

    /// Request path, `/{service}/{method}`.
    pub fn method(&self) -> &str {
        self.inner.method.path()
    }

    pub fn method_info(&self) -> &MethodInfo {
        &self.inner.method
    }

    pub fn host(&self) -> Option<&str> {
        self.inner.host.as_deref()
    }

    pub fn peer(&self) -> Option<&str> {
        self.inner.peer.as_deref()
    }

    pub fn request_headers(&self) -> &Metadata {
        &self.inner.request_headers
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline.instant()
    }

    /// Time left before the deadline; `None` without one.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.inner.deadline.remaining()
    }

    /// Fires on deadline expiry, client disconnect, or when the call is
    /// otherwise aborted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Whether the call's deadline has passed.
    pub fn is_deadline_exceeded(&self) -> bool {
        self.inner.deadline_expired.load(Ordering::Acquire) || self.inner.deadline.is_expired()
    }

    /// Whether the terminal status has been written.
    pub fn is_complete(&self) -> bool {
        self.inner.response.is_finalized()
    }

    /// The response encoding negotiated for this call.
    pub fn response_encoding(&self) -> &str {
        self.inner.response.encoding_name()
    }

    /// Send response headers now instead of with the first message.
    ///
    /// Headers go out at most once per call; a second attempt, or one after
    /// a message was written, fails.
    pub async fn write_response_headers(&self, headers: Metadata) -> Result<(), Error> {
        self.inner.response.send_headers(headers).await
    }

    /// Append a response trailer. Fails once the call is complete.
    pub fn add_trailer(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), Error> {
        let key = key.into();
        if is_reserved_key(&key) {
            return Err(Error::invalid_operation(format!(
                "Trailer '{key}' is reserved by the protocol."
            )));
        }
        self.with_open_state(|state| state.trailers.insert(key, value))
    }

    /// Append a binary trailer under a `-bin` key.
    pub fn add_binary_trailer(&self, key: impl Into<String>, value: &[u8]) -> Result<(), Error> {
        let key = key.into();
        if !grpc::metadata::is_binary_key(&key) {
            return Err(Error::invalid_operation(format!(
                "Binary trailer '{key}' must end with '-bin'."
            )));
        }
        self.with_open_state(|state| {
            state.trailers.insert_bin(key, value);
        })
    }

    /// Trailers added so far.
    pub fn trailers(&self) -> Metadata {
        self.inner.state.lock().trailers.clone()
    }

    /// Complete the call with `status` when the handler returns
    /// successfully.
    pub fn set_status(&self, status: Status) {
        self.inner.state.lock().status = Some(status);
    }

    pub fn write_options(&self) -> WriteOptions {
        self.inner.state.lock().write_options
    }

    /// Default options for response writes that don't pass their own.
    pub fn set_write_options(&self, options: WriteOptions) {
        self.inner.state.lock().write_options = options;
    }

    fn with_open_state<R>(&self, f: impl FnOnce(&mut MutableState) -> R) -> Result<R, Error> {
        let mut state = self.inner.state.lock();
        if self.is_complete() {
            return Err(Error::invalid_operation(
                "Trailers can't be modified after the call is complete.",
            ));
        }
        Ok(f(&mut state))
    }

    pub(crate) fn response(&self) -> &Arc<ResponseChannel> {
        &self.inner.response
    }

    pub(crate) fn mark_deadline_expired(&self) {
        self.inner.deadline_expired.store(true, Ordering::Release);
        self.inner.cancellation.cancel();
    }

    /// Take what the handler left behind for the final status.
    pub(crate) fn take_completion(&self) -> (Option<Status>, Metadata) {
        let mut state = self.inner.state.lock();
        (state.status.take(), std::mem::take(&mut state.trailers))
    }
}

impl fmt::Debug for ServerCallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallContext")
            .field("method", &self.method())
            .field("peer", &self.inner.peer)
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
