//! Method descriptors and marshallers.

use crate::error::{BoxError, Error};
use bytes::Bytes;
use grpc::Status;
use std::fmt;
use std::sync::Arc;

/// The four RPC shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    DuplexStreaming,
}

impl MethodType {
    /// Whether the client sends exactly one message.
    pub fn has_single_request(self) -> bool {
        matches!(self, MethodType::Unary | MethodType::ServerStreaming)
    }

    /// Whether the server sends exactly one message.
    pub fn has_single_response(self) -> bool {
        matches!(self, MethodType::Unary | MethodType::ClientStreaming)
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MethodType::Unary => "unary",
            MethodType::ClientStreaming => "client_streaming",
            MethodType::ServerStreaming => "server_streaming",
            MethodType::DuplexStreaming => "duplex_streaming",
        })
    }
}

/// The untyped identity of a method, visible to interceptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    service: String,
    name: String,
    kind: MethodType,
    path: String,
}

impl MethodInfo {
    pub fn new(service: impl Into<String>, name: impl Into<String>, kind: MethodType) -> Self {
        let service = service.into();
        let name = name.into();
        let path = format!("/{service}/{name}");
        Self {
            service,
            name,
            kind,
            path,
        }
    }

    /// Fully qualified service name, e.g. `greet.Greeter`.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MethodType {
        self.kind
    }

    /// Request path, `/{service}/{name}`.
    pub fn path(&self) -> &str {
        &self.path
    }
}

type SerializeFn<T> = dyn Fn(&T) -> Result<Vec<u8>, BoxError> + Send + Sync;
type DeserializeFn<T> = dyn Fn(&[u8]) -> Result<T, BoxError> + Send + Sync;

/// Converts a message type to and from bytes.
pub struct Marshaller<T> {
    serializer: Arc<SerializeFn<T>>,
    deserializer: Arc<DeserializeFn<T>>,
}

impl<T> Clone for Marshaller<T> {
    fn clone(&self) -> Self {
        Self {
            serializer: self.serializer.clone(),
            deserializer: self.deserializer.clone(),
        }
    }
}

impl<T> fmt::Debug for Marshaller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marshaller")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Marshaller<T> {
    pub fn new<S, D>(serializer: S, deserializer: D) -> Self
    where
        S: Fn(&T) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Self {
            serializer: Arc::new(serializer),
            deserializer: Arc::new(deserializer),
        }
    }

    pub fn serialize(&self, message: &T) -> Result<Bytes, Error> {
        (self.serializer)(message).map(Bytes::from).map_err(|e| {
            tracing::debug!(error = %e, "failed to serialize response message");
            Error::Status(Status::internal("Failed to serialize response message."))
        })
    }

    pub fn deserialize(&self, payload: &[u8]) -> Result<T, Error> {
        (self.deserializer)(payload).map_err(|e| {
            tracing::debug!(error = %e, "failed to deserialize request message");
            Error::Status(Status::internal("Failed to deserialize request message."))
        })
    }
}

/// A typed method: its identity plus the marshallers for both directions.
/// Immutable once registered.
pub struct Method<Req, Resp> {
    info: MethodInfo,
    request: Marshaller<Req>,
    response: Marshaller<Resp>,
}

impl<Req, Resp> Clone for Method<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            info: self.info.clone(),
            request: self.request.clone(),
            response: self.response.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for Method<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method").field("info", &self.info).finish()
    }
}

impl<Req, Resp> Method<Req, Resp> {
    pub fn new(
        kind: MethodType,
        service: impl Into<String>,
        name: impl Into<String>,
        request: Marshaller<Req>,
        response: Marshaller<Resp>,
    ) -> Self {
        Self {
            info: MethodInfo::new(service, name, kind),
            request,
            response,
        }
    }

    pub fn info(&self) -> &MethodInfo {
        &self.info
    }

    pub fn kind(&self) -> MethodType {
        self.info.kind
    }

    pub fn request_marshaller(&self) -> &Marshaller<Req> {
        &self.request
    }

    pub fn response_marshaller(&self) -> &Marshaller<Resp> {
        &self.response
    }
}
