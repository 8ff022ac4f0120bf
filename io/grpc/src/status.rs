//! gRPC status codes and the terminal status of a call.

use crate::metadata::Metadata;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::fmt;

/// Trailer carrying the numeric status code.
pub const GRPC_STATUS: &str = "grpc-status";
/// Trailer carrying the percent-encoded status message.
pub const GRPC_MESSAGE: &str = "grpc-message";

/// gRPC status codes (different from HTTP status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

const ALL_CODES: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

impl Code {
    /// Map a numeric value to a code. Values outside 0..=16 map to `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        ALL_CODES
            .get(value as usize)
            .copied()
            .unwrap_or(Code::Unknown)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }

    /// Canonical upper snake case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of a call: a code, an optional message and metadata that is
/// copied into the response trailers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: Option<String>,
    metadata: Metadata,
}

macro_rules! status_ctor {
    ($($(#[$doc:meta])* $name:ident => $code:ident,)*) => {
        $(
            $(#[$doc])*
            pub fn $name(message: impl Into<String>) -> Self {
                Self::new(Code::$code, message)
            }
        )*
    };
}

impl Status {
    /// Create a new status.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            metadata: Metadata::new(),
        }
    }

    /// Create an OK status with no message.
    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    /// Create a status from just a code.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            metadata: Metadata::new(),
        }
    }

    status_ctor! {
        cancelled => Cancelled,
        unknown => Unknown,
        invalid_argument => InvalidArgument,
        deadline_exceeded => DeadlineExceeded,
        not_found => NotFound,
        already_exists => AlreadyExists,
        permission_denied => PermissionDenied,
        resource_exhausted => ResourceExhausted,
        failed_precondition => FailedPrecondition,
        aborted => Aborted,
        out_of_range => OutOfRange,
        unimplemented => Unimplemented,
        internal => Internal,
        unavailable => Unavailable,
        data_loss => DataLoss,
        unauthenticated => Unauthenticated,
    }

    /// Attach metadata that is sent with the status trailers.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    /// The status message; `None` when absent or empty.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref().filter(|m| !m.is_empty())
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Render the status as trailer entries.
    ///
    /// The status metadata comes first, minus any protocol-owned keys, then
    /// `grpc-status` and (when non-empty) the percent-encoded `grpc-message`.
    pub fn to_trailers(&self) -> Metadata {
        let mut trailers = Metadata::new();
        for (key, value) in self.metadata.iter() {
            if !crate::metadata::is_reserved_key(key) {
                trailers.insert(key, value);
            }
        }
        trailers.insert(GRPC_STATUS, self.code.as_u32().to_string());
        if let Some(message) = self.message() {
            trailers.insert(GRPC_MESSAGE, percent_encode(message));
        }
        trailers
    }

    /// Read a status back out of trailers. Returns `None` without
    /// `grpc-status`.
    pub fn from_trailers(trailers: &Metadata) -> Option<Self> {
        let code = trailers.get(GRPC_STATUS)?.trim().parse::<u32>().ok()?;
        let mut status = Self::from_code(Code::from_u32(code));
        if let Some(message) = trailers.get(GRPC_MESSAGE) {
            status.message = Some(percent_decode(message));
        }
        for (key, value) in trailers.iter() {
            if !crate::metadata::is_reserved_key(key) {
                status.metadata.insert(key, value);
            }
        }
        Some(status)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(msg) = self.message() {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

/// ASCII bytes escaped in `grpc-message`. Non-ASCII bytes are always
/// escaped.
const GRPC_MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// Percent-encode a status message for the `grpc-message` trailer.
pub fn percent_encode(message: &str) -> String {
    utf8_percent_encode(message, GRPC_MESSAGE_ESCAPES).to_string()
}

/// Decode a percent-encoded `grpc-message` value.
///
/// Malformed escapes are kept literally and invalid UTF-8 is replaced, so
/// decoding never fails.
pub fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}
