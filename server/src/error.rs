//! Call errors and their translation into a gRPC status.

use grpc::{FrameError, Status};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Boxed error as returned by marshallers and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) const DEADLINE_EXCEEDED: &str = "Deadline Exceeded";
pub(crate) const CANCELLED_BY_CLIENT: &str = "Call canceled by the client.";
pub(crate) const REQUEST_COMPLETE: &str = "Can't write the message because the request is complete.";
const HANDLER_ERROR: &str = "Exception was thrown by handler.";

/// Everything that can end a call unsuccessfully.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An explicit status, passed through as-is.
    #[error(transparent)]
    Status(#[from] Status),

    /// A framing fault on the request or response stream.
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Deadline Exceeded")]
    DeadlineExceeded,

    /// The call's cancellation signal fired while waiting.
    #[error("the call was cancelled")]
    Cancelled,

    /// A misuse of the call API, such as a second header write or two
    /// overlapping reads.
    #[error("{0}")]
    InvalidOperation(String),

    /// An application error raised by a handler, interceptor or activator.
    #[error("{type_name}: {source}")]
    Handler {
        type_name: &'static str,
        source: BoxError,
    },

    /// A handler panicked.
    #[error("panic: {0}")]
    Panic(String),

    /// The transport failed reading the request or writing the response.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl Error {
    /// Wrap an application error, capturing its type name for detailed
    /// error messages.
    pub fn handler<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Handler {
            type_name: short_type_name(std::any::type_name::<E>()),
            source: Box::new(error),
        }
    }

    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "invalid operation on call");
        Self::InvalidOperation(message)
    }

    pub(crate) fn request_complete() -> Self {
        Self::InvalidOperation(REQUEST_COMPLETE.to_string())
    }

    /// Build from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panic(message)
    }

    /// Whether this error was already reported where it was raised.
    pub(crate) fn is_logged(&self) -> bool {
        matches!(self, Error::InvalidOperation(_))
    }
}

impl From<BoxError> for Error {
    fn from(source: BoxError) -> Self {
        Self::Handler {
            type_name: "Error",
            source,
        }
    }
}

/// What the call handler knew about the call when it failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallState {
    pub deadline_expired: bool,
    pub cancelled: bool,
}

/// Translate an error into the status sent to the client.
///
/// Never fails: a panic while formatting the error becomes `Internal`
/// "Internal error".
pub fn to_status(error: &Error, state: CallState, detailed_errors: bool) -> Status {
    catch_unwind(AssertUnwindSafe(|| translate(error, state, detailed_errors)))
        .unwrap_or_else(|_| Status::internal("Internal error"))
}

fn translate(error: &Error, state: CallState, detailed_errors: bool) -> Status {
    match error {
        Error::Status(status) => status.clone(),
        Error::Frame(e) => Status::from(e.clone()),
        Error::DeadlineExceeded => Status::deadline_exceeded(DEADLINE_EXCEEDED),
        Error::Cancelled | Error::Transport(_) if state.deadline_expired => {
            Status::deadline_exceeded(DEADLINE_EXCEEDED)
        }
        Error::Cancelled => Status::cancelled(CANCELLED_BY_CLIENT),
        Error::Transport(_) if state.cancelled => Status::cancelled(CANCELLED_BY_CLIENT),
        Error::Transport(e) if detailed_errors => {
            Status::unavailable(format!("Transport error: {e}"))
        }
        Error::Transport(_) => Status::unavailable("Transport error."),
        Error::InvalidOperation(message) => Status::internal(message.clone()),
        Error::Handler { type_name, source } => handler_status(type_name, source, detailed_errors),
        Error::Panic(message) => handler_status("panic", message, detailed_errors),
    }
}

fn handler_status(type_name: &str, detail: &dyn std::fmt::Display, detailed_errors: bool) -> Status {
    if detailed_errors {
        Status::unknown(format!("{HANDLER_ERROR} {type_name}: {detail}"))
    } else {
        Status::unknown(HANDLER_ERROR)
    }
}

/// `my_crate::errors::NotFound<T>` -> `NotFound<T>`.
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
