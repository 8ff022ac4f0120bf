//! Call handlers.
//!
//! A call handler owns one call from request headers to the final status.
//! It validates the request, sets up the context, runs the method-kind
//! specific body (read, invoke, write) and races it against the deadline and
//! the client going away. Whichever finishes first decides the status; a
//! handler that ignores cancellation keeps running for a grace period so its
//! cleanup can happen, but cannot hold the response open.

use crate::context::{ContextParts, ServerCallContext};
use crate::deadline::Deadline;
use crate::error::{CallState, Error, to_status};
use crate::interceptor::{AnyMessage, CallFuture, InterceptedCall};
use crate::invoker::{MethodInvoker, Terminal, take_request, take_response};
use crate::method::{Marshaller, Method, MethodInfo};
use crate::metrics;
use crate::response::{GRPC_CONTENT_TYPE, ResponseChannel};
use crate::server::ServerOptions;
use crate::streaming::{FrameReader, RequestStream, ServerStreamWriter};
use crate::transport::{HttpRequest, ResponseSink};
use futures::FutureExt;
use futures::future::BoxFuture;
use grpc::compression::{
    GRPC_ACCEPT_ENCODING, GRPC_ENCODING, GRPC_INTERNAL_ENCODING_REQUEST, IDENTITY, accepts,
};
use grpc::{CompressionProvider, CompressionRegistry, Metadata, Status};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;

const NO_MESSAGE_RETURNED: &str = "No message returned from method.";

pub(crate) type UnaryFn<S, Req, Resp> = Arc<
    dyn Fn(Arc<S>, Req, ServerCallContext) -> BoxFuture<'static, Result<Option<Resp>, Error>>
        + Send
        + Sync,
>;

pub(crate) type ClientStreamingFn<S, Req, Resp> = Arc<
    dyn Fn(Arc<S>, RequestStream<Req>, ServerCallContext) -> BoxFuture<'static, Result<Option<Resp>, Error>>
        + Send
        + Sync,
>;

pub(crate) type ServerStreamingFn<S, Req, Resp> = Arc<
    dyn Fn(Arc<S>, Req, ServerStreamWriter<Resp>, ServerCallContext) -> BoxFuture<'static, Result<(), Error>>
        + Send
        + Sync,
>;

pub(crate) type DuplexStreamingFn<S, Req, Resp> = Arc<
    dyn Fn(
            Arc<S>,
            RequestStream<Req>,
            ServerStreamWriter<Resp>,
            ServerCallContext,
        ) -> BoxFuture<'static, Result<(), Error>>
        + Send
        + Sync,
>;

/// The user method behind a handler, by kind.
pub(crate) enum Delegate<S, Req, Resp> {
    Unary(UnaryFn<S, Req, Resp>),
    ClientStreaming(ClientStreamingFn<S, Req, Resp>),
    ServerStreaming(ServerStreamingFn<S, Req, Resp>),
    DuplexStreaming(DuplexStreamingFn<S, Req, Resp>),
}

impl<S, Req, Resp> Clone for Delegate<S, Req, Resp> {
    fn clone(&self) -> Self {
        match self {
            Delegate::Unary(f) => Delegate::Unary(f.clone()),
            Delegate::ClientStreaming(f) => Delegate::ClientStreaming(f.clone()),
            Delegate::ServerStreaming(f) => Delegate::ServerStreaming(f.clone()),
            Delegate::DuplexStreaming(f) => Delegate::DuplexStreaming(f.clone()),
        }
    }
}

/// A routable method.
pub(crate) trait CallHandler: Send + Sync {
    fn method(&self) -> &MethodInfo;

    fn handle(
        self: Arc<Self>,
        request: HttpRequest,
        sink: Box<dyn ResponseSink>,
        options: Arc<ServerOptions>,
    ) -> BoxFuture<'static, ()>;
}

pub(crate) struct MethodHandler<S: 'static, Req, Resp> {
    method: Method<Req, Resp>,
    invoker: MethodInvoker<S>,
    delegate: Delegate<S, Req, Resp>,
}

impl<S, Req, Resp> MethodHandler<S, Req, Resp>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub(crate) fn new(
        method: Method<Req, Resp>,
        invoker: MethodInvoker<S>,
        delegate: Delegate<S, Req, Resp>,
    ) -> Self {
        Self {
            method,
            invoker,
            delegate,
        }
    }

    async fn serve(
        self: Arc<Self>,
        request: HttpRequest,
        mut sink: Box<dyn ResponseSink>,
        options: Arc<ServerOptions>,
    ) {
        let HttpRequest {
            headers,
            host,
            peer,
            body,
            aborted,
            ..
        } = request;

        if let Err(message) = validate_content_type(headers.get("content-type")) {
            tracing::debug!(reason = %message, "rejecting request");
            let status = Status::internal(message);
            ResponseChannel::reject(&mut *sink, 415, &status, Metadata::new()).await;
            return;
        }

        let decompressor = match request_encoding(&headers, &options.compression) {
            Ok(provider) => provider,
            Err(status) => {
                tracing::debug!(reason = status.message(), "rejecting request");
                let mut extra = Metadata::new();
                extra.insert(GRPC_ACCEPT_ENCODING, options.compression.accept_encoding());
                ResponseChannel::reject(&mut *sink, 200, &status, extra).await;
                return;
            }
        };

        let deadline = Deadline::from_headers(&headers, Instant::now());
        let encoding = response_encoding(&headers, &options);
        let cancellation = aborted.child_token();
        let response = Arc::new(ResponseChannel::new(
            sink,
            cancellation.clone(),
            options.clone(),
            encoding,
        ));
        let context = ServerCallContext::new(ContextParts {
            method: self.method.info().clone(),
            host,
            peer,
            request_headers: headers,
            deadline,
            cancellation: cancellation.clone(),
            response,
        });
        let reader = FrameReader::new(
            body,
            options.max_receive_message_size,
            decompressor,
            cancellation,
        );

        let _active = metrics::ActiveCall::start();
        tracing::debug!(deadline = ?context.time_remaining(), "call started");

        let body = self.run(context.clone(), reader).boxed();
        let status = complete(&context, deadline, body, &options).await;

        if status.is_ok() {
            metrics::CALLS_COMPLETED.increment();
        } else {
            metrics::CALLS_FAILED.increment();
        }
        tracing::debug!(code = %status.code(), "call finished");
    }

    /// The method-kind specific part of a call.
    async fn run(
        self: Arc<Self>,
        context: ServerCallContext,
        mut reader: FrameReader,
    ) -> Result<(), Error> {
        let request_marshaller = self.method.request_marshaller().clone();
        let response_marshaller = self.method.response_marshaller().clone();

        match self.delegate.clone() {
            Delegate::Unary(f) => {
                let request: AnyMessage = Box::new(reader.read_single(&request_marshaller).await?);
                let terminal: Terminal<S> = Box::new(move |service, mut call| -> CallFuture {
                    Box::pin(async move {
                        let request = take_request::<Req>(&mut call)?;
                        let response = f(service, request, call.context).await?;
                        Ok::<_, Error>(response.map(|r| Box::new(r) as AnyMessage))
                    })
                });
                let outcome = self
                    .invoker
                    .invoke(context.clone(), Some(request), terminal)
                    .await?;
                write_single(&context, &response_marshaller, outcome).await
            }
            Delegate::ClientStreaming(f) => {
                let stream = RequestStream::new(reader, request_marshaller, context.clone());
                let terminal: Terminal<S> = Box::new(move |service, call: InterceptedCall| -> CallFuture {
                    Box::pin(async move {
                        let response = f(service, stream, call.context).await?;
                        Ok::<_, Error>(response.map(|r| Box::new(r) as AnyMessage))
                    })
                });
                let outcome = self.invoker.invoke(context.clone(), None, terminal).await?;
                write_single(&context, &response_marshaller, outcome).await
            }
            Delegate::ServerStreaming(f) => {
                let request: AnyMessage = Box::new(reader.read_single(&request_marshaller).await?);
                let writer = ServerStreamWriter::new(context.clone(), response_marshaller);
                let handler_writer = writer.clone();
                let terminal: Terminal<S> = Box::new(move |service, mut call| -> CallFuture {
                    Box::pin(async move {
                        let request = take_request::<Req>(&mut call)?;
                        f(service, request, handler_writer, call.context).await?;
                        Ok::<_, Error>(None)
                    })
                });
                let outcome = self.invoker.invoke(context, Some(request), terminal).await;
                writer.complete();
                outcome.map(drop)
            }
            Delegate::DuplexStreaming(f) => {
                let stream = RequestStream::new(reader, request_marshaller, context.clone());
                let writer = ServerStreamWriter::new(context.clone(), response_marshaller);
                let handler_writer = writer.clone();
                let terminal: Terminal<S> = Box::new(move |service, call: InterceptedCall| -> CallFuture {
                    Box::pin(async move {
                        f(service, stream, handler_writer, call.context).await?;
                        Ok::<_, Error>(None)
                    })
                });
                let outcome = self.invoker.invoke(context, None, terminal).await;
                writer.complete();
                outcome.map(drop)
            }
        }
    }
}

impl<S, Req, Resp> CallHandler for MethodHandler<S, Req, Resp>
where
    S: Send + Sync + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn method(&self) -> &MethodInfo {
        self.invoker.method()
    }

    fn handle(
        self: Arc<Self>,
        request: HttpRequest,
        sink: Box<dyn ResponseSink>,
        options: Arc<ServerOptions>,
    ) -> BoxFuture<'static, ()> {
        let span = tracing::info_span!(
            "grpc_call",
            method = self.method.info().path(),
            kind = %self.method.kind(),
        );
        self.serve(request, sink, options).instrument(span).boxed()
    }
}

/// Write the single response of a unary or client-streaming call.
async fn write_single<T: 'static>(
    context: &ServerCallContext,
    marshaller: &Marshaller<T>,
    outcome: Option<AnyMessage>,
) -> Result<(), Error> {
    let Some(message) = take_response::<T>(outcome)? else {
        return Err(Status::cancelled(NO_MESSAGE_RETURNED).into());
    };
    let payload = marshaller.serialize(&message)?;
    let options = context.write_options();
    let response = context.response();
    let frame = response.encode(&payload, options)?;
    response.write_frame(frame, options).await
}

enum Race {
    Finished(Result<(), Error>),
    Interrupted(Error),
}

/// Drive the call body to a final status and write it.
async fn complete(
    context: &ServerCallContext,
    deadline: Deadline,
    body: BoxFuture<'static, Result<(), Error>>,
    options: &ServerOptions,
) -> Status {
    let cancellation = context.cancellation_token();
    let mut body = AssertUnwindSafe(body).catch_unwind();

    let race = tokio::select! {
        biased;
        result = &mut body => Race::Finished(result.unwrap_or_else(|panic| Err(Error::from_panic(panic)))),
        _ = deadline.expired() => {
            context.mark_deadline_expired();
            metrics::CALLS_DEADLINE_EXCEEDED.increment();
            tracing::debug!("deadline exceeded");
            Race::Interrupted(Error::DeadlineExceeded)
        }
        _ = cancellation.cancelled() => {
            tracing::debug!("call cancelled");
            Race::Interrupted(Error::Cancelled)
        }
    };

    let state = |context: &ServerCallContext| CallState {
        deadline_expired: context.is_deadline_exceeded(),
        cancelled: context.is_cancelled(),
    };

    match race {
        Race::Finished(result) => {
            let (explicit, trailers) = context.take_completion();
            let status = match result {
                Ok(()) => explicit.unwrap_or_else(Status::ok),
                Err(e) => {
                    log_failure(&e);
                    to_status(&e, state(context), options.detailed_errors)
                }
            };
            context.response().finish(&status, trailers).await;
            status
        }
        Race::Interrupted(e) => {
            let status = to_status(&e, state(context), options.detailed_errors);
            let (_, trailers) = context.take_completion();

            // A handler suspended in a sink write holds the response lock
            // until it observes the cancellation, so keep polling it while
            // the status goes out.
            let mut settled = None;
            {
                let finish = context.response().finish(&status, trailers);
                tokio::pin!(finish);
                loop {
                    tokio::select! {
                        biased;
                        _ = &mut finish => break,
                        result = &mut body, if settled.is_none() => settled = Some(result),
                    }
                }
            }
            let settled = match settled {
                Some(result) => Ok(result),
                None => tokio::time::timeout(options.grace_period, &mut body).await,
            };

            match settled {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::debug!(error = %e, "handler failed after the call ended"),
                Ok(Err(_)) => tracing::debug!("handler panicked after the call ended"),
                Err(_) => tracing::debug!(
                    grace_period = ?options.grace_period,
                    "handler ignored cancellation, abandoning it"
                ),
            }
            status
        }
    }
}

/// Log a failed call once, at a level that fits the cause.
fn log_failure(error: &Error) {
    match error {
        Error::Status(status) => {
            tracing::debug!(code = %status.code(), grpc_message = status.message(), "call failed with status")
        }
        Error::Frame(e) => tracing::debug!(error = %e, "malformed request"),
        Error::Cancelled | Error::DeadlineExceeded | Error::Transport(_) => {
            tracing::debug!(%error, "call interrupted")
        }
        e if e.is_logged() => {}
        e => tracing::error!(error = %e, "error in call handler"),
    }
}

/// `application/grpc` or `application/grpc+{subtype}`, ignoring case and
/// parameters.
pub(crate) fn validate_content_type(content_type: Option<&str>) -> Result<(), String> {
    let Some(value) = content_type else {
        return Err("Content-Type is missing from the request.".to_string());
    };
    let media_type = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let valid = media_type == GRPC_CONTENT_TYPE
        || media_type
            .strip_prefix("application/grpc+")
            .is_some_and(|subtype| !subtype.is_empty());
    if valid {
        Ok(())
    } else {
        Err(format!("Content-Type '{value}' is not supported."))
    }
}

/// The decompressor for the request's `grpc-encoding`, `None` for identity.
fn request_encoding(
    headers: &Metadata,
    registry: &CompressionRegistry,
) -> Result<Option<Arc<dyn CompressionProvider>>, Status> {
    let Some(encoding) = headers.get(GRPC_ENCODING).map(str::trim) else {
        return Ok(None);
    };
    if encoding.eq_ignore_ascii_case(IDENTITY) {
        return Ok(None);
    }
    match registry.get(encoding) {
        Some(provider) => Ok(Some(provider.clone())),
        None => Err(Status::unimplemented(format!(
            "Unsupported grpc-encoding value '{encoding}'. Supported encodings: {}",
            registry.accept_encoding()
        ))),
    }
}

/// Pick the response encoding: an explicit per-request choice, else the
/// configured one, as long as the client accepts it.
fn response_encoding(headers: &Metadata, options: &ServerOptions) -> Option<Arc<dyn CompressionProvider>> {
    let requested = headers
        .get(GRPC_INTERNAL_ENCODING_REQUEST)
        .or(options.response_compression_algorithm.as_deref())?
        .trim();
    if requested.eq_ignore_ascii_case(IDENTITY) {
        return None;
    }
    let accepted = headers
        .get(GRPC_ACCEPT_ENCODING)
        .is_some_and(|accept| accepts(accept, requested));
    if !accepted {
        tracing::debug!(encoding = requested, "client does not accept response encoding");
        return None;
    }
    options.compression.get(requested).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_validation() {
        assert!(validate_content_type(Some("application/grpc")).is_ok());
        assert!(validate_content_type(Some("application/grpc+proto")).is_ok());
        assert!(validate_content_type(Some("Application/GRPC; charset=utf-8")).is_ok());
        assert!(validate_content_type(Some("application/grpc+json;x=y")).is_ok());

        assert_eq!(
            validate_content_type(Some("application/json")).unwrap_err(),
            "Content-Type 'application/json' is not supported."
        );
        assert!(validate_content_type(Some("application/grpc+")).is_err());
        assert!(validate_content_type(Some("application/grpc-web")).is_err());
        assert_eq!(
            validate_content_type(None).unwrap_err(),
            "Content-Type is missing from the request."
        );
    }

    #[test]
    fn test_request_encoding() {
        let registry = CompressionRegistry::with_defaults();
        let mut headers = Metadata::new();
        assert!(request_encoding(&headers, &registry).unwrap().is_none());

        headers.set(GRPC_ENCODING, "identity");
        assert!(request_encoding(&headers, &registry).unwrap().is_none());

        headers.set(GRPC_ENCODING, "gzip");
        let provider = request_encoding(&headers, &registry).unwrap().unwrap();
        assert_eq!(provider.encoding_name(), "gzip");

        headers.set(GRPC_ENCODING, "br");
        let status = request_encoding(&headers, &registry)
            .err()
            .expect("expected unsupported encoding error");
        assert_eq!(status.code(), grpc::Code::Unimplemented);
        assert_eq!(
            status.message(),
            Some("Unsupported grpc-encoding value 'br'. Supported encodings: identity,gzip")
        );
    }

    #[test]
    fn test_response_encoding_negotiation() {
        let mut options = ServerOptions::default();
        let mut headers = Metadata::new();
        assert!(response_encoding(&headers, &options).is_none());

        options.response_compression_algorithm = Some("gzip".into());
        assert!(response_encoding(&headers, &options).is_none());

        headers.set(GRPC_ACCEPT_ENCODING, "identity, gzip");
        let chosen = response_encoding(&headers, &options).unwrap();
        assert_eq!(chosen.encoding_name(), "gzip");

        headers.set(GRPC_INTERNAL_ENCODING_REQUEST, "identity");
        assert!(response_encoding(&headers, &options).is_none());
    }
}
