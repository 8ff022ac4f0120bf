//! gRPC call dispatch.
//!
//! Binds strongly typed unary, client-streaming, server-streaming and
//! duplex-streaming methods onto an HTTP request pipeline. The host server
//! owns the HTTP/2 connection and hands each request to [`Server::dispatch`]
//! together with a [`transport::ResponseSink`]; the engine takes care of
//! framing, deadlines, compression, interceptors and the final status.

pub mod activator;
pub mod config;
pub mod context;
pub mod deadline;
pub mod error;
mod handler;
pub mod interceptor;
mod invoker;
pub mod logging;
pub mod method;
pub mod metrics;
mod response;
pub mod server;
pub mod service;
pub mod streaming;
pub mod transport;

pub use activator::{FactoryActivator, ServiceActivator, SharedActivator};
pub use config::{Config, ConfigError, GrpcConfig, LoggingConfig};
pub use context::{ServerCallContext, WriteOptions};
pub use error::{BoxError, CallState, Error, Result, to_status};
pub use interceptor::{
    AnyMessage, CallFuture, CallOutcome, InterceptedCall, Interceptor, InterceptorActivator,
    InterceptorRegistration, Next, interceptor_fn,
};
pub use method::{Marshaller, Method, MethodInfo, MethodType};
pub use server::{Dispatch, Server, ServerBuilder};
pub use service::{ServiceBuilder, ServiceDefinition};
pub use streaming::{RequestStream, ServerStreamWriter};

pub use grpc::{Code, Metadata, Status};
