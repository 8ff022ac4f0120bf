#![allow(dead_code)]

use grpc_server::transport::memory::{MemoryRequest, RecordedResponse, recording_sink};
use grpc_server::{
    Dispatch, Error, GrpcConfig, Marshaller, Method, MethodType, RequestStream, Server,
    ServerStreamWriter, ServiceBuilder, ServiceDefinition, Status,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const SERVICE: &str = "greet.Greeter";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterRequest {
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterReply {
    pub count: u32,
}

pub fn json<T: Serialize + DeserializeOwned + 'static>() -> Marshaller<T> {
    Marshaller::new(
        |message: &T| Ok(serde_json::to_vec(message)?),
        |payload: &[u8]| Ok(serde_json::from_slice(payload)?),
    )
}

pub fn encode<T: Serialize>(message: &T) -> Vec<u8> {
    serde_json::to_vec(message).unwrap()
}

pub fn method<Req, Resp>(kind: MethodType, name: &str) -> Method<Req, Resp>
where
    Req: Serialize + DeserializeOwned + 'static,
    Resp: Serialize + DeserializeOwned + 'static,
{
    Method::new(kind, SERVICE, name, json(), json())
}

pub fn path(name: &str) -> String {
    format!("/{SERVICE}/{name}")
}

#[derive(Default)]
pub struct Greeter {
    pub greeted: AtomicUsize,
}

/// The test service: one method per behavior under test.
pub fn greeter() -> ServiceBuilder<Greeter> {
    ServiceBuilder::shared(SERVICE, Greeter::default())
        .unary(
            method(MethodType::Unary, "SayHello"),
            |greeter, request: HelloRequest, _| async move {
                greeter.greeted.fetch_add(1, Ordering::SeqCst);
                Ok(Some(HelloReply {
                    message: format!("Hello {}", request.name),
                }))
            },
        )
        .unary(
            method::<HelloRequest, HelloReply>(MethodType::Unary, "Silent"),
            |_, _, _| async move { Ok(None) },
        )
        .unary(
            method(MethodType::Unary, "Slow"),
            |_, request: HelloRequest, _| async move {
                // Ignores cancellation on purpose.
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Some(HelloReply {
                    message: request.name,
                }))
            },
        )
        .unary(
            method::<HelloRequest, HelloReply>(MethodType::Unary, "Fail"),
            |_, _, _| async move { Err(Error::handler(std::io::Error::other("boom"))) },
        )
        .unary(
            method::<HelloRequest, HelloReply>(MethodType::Unary, "Panic"),
            |_, _, _| async move { panic!("handler exploded") },
        )
        .unary(
            method::<HelloRequest, HelloReply>(MethodType::Unary, "Deny"),
            |_, _, _| async move {
                let mut metadata = grpc_server::Metadata::new();
                metadata.insert("x-reason", "blocked");
                Err(Error::from(
                    Status::permission_denied("not allowed").with_metadata(metadata),
                ))
            },
        )
        .unary(
            method(MethodType::Unary, "Annotated"),
            |_, request: HelloRequest, ctx| async move {
                ctx.add_trailer("x-trace", "abc")?;
                ctx.add_binary_trailer("x-raw-bin", &[0, 1, 2])?;
                ctx.set_status(Status::already_exists("kept the reply"));
                Ok(Some(HelloReply {
                    message: request.name,
                }))
            },
        )
        .unary(
            method(MethodType::Unary, "HeadersTwice"),
            |_, request: HelloRequest, ctx| async move {
                ctx.write_response_headers(grpc_server::Metadata::new()).await?;
                ctx.write_response_headers(grpc_server::Metadata::new()).await?;
                Ok(Some(HelloReply {
                    message: request.name,
                }))
            },
        )
        .client_streaming(
            method(MethodType::ClientStreaming, "Accumulate"),
            |_, requests: RequestStream<CounterRequest>, _| async move {
                let mut total = 0;
                while let Some(request) = requests.next_message().await? {
                    total += request.count;
                }
                Ok(Some(CounterReply { count: total }))
            },
        )
        .server_streaming(
            method(MethodType::ServerStreaming, "CountUp"),
            |_, request: CounterRequest, responses: ServerStreamWriter<CounterReply>, _| async move {
                for count in 1..=request.count {
                    responses.write(&CounterReply { count }).await?;
                }
                Ok(())
            },
        )
        .duplex_streaming(
            method(MethodType::DuplexStreaming, "Echo"),
            |_,
             requests: RequestStream<HelloRequest>,
             responses: ServerStreamWriter<HelloReply>,
             _| async move {
                while let Some(request) = requests.next_message().await? {
                    responses
                        .write(&HelloReply {
                            message: request.name,
                        })
                        .await?;
                }
                Ok(())
            },
        )
}

pub fn greeter_service() -> ServiceDefinition {
    greeter().build().unwrap()
}

pub fn server(config: GrpcConfig) -> Server {
    Server::builder()
        .config(config)
        .add_service(greeter_service())
        .build()
        .unwrap()
}

pub fn default_server() -> Server {
    server(GrpcConfig::default())
}

/// Run a request to completion and return what was written.
pub async fn call(server: &Server, request: MemoryRequest) -> RecordedResponse {
    let (request, _abort) = request.build();
    let (sink, recorded) = recording_sink();
    let dispatch = server.dispatch(request, Box::new(sink)).await;
    assert!(matches!(dispatch, Dispatch::Handled));
    assert!(recorded.is_complete());
    recorded
}

/// Decode every response message.
pub fn messages<T: DeserializeOwned>(recorded: &RecordedResponse) -> Vec<T> {
    recorded
        .frames()
        .unwrap()
        .iter()
        .map(|frame| serde_json::from_slice(&frame.payload).unwrap())
        .collect()
}

pub fn hello(name: &str) -> Vec<u8> {
    encode(&HelloRequest {
        name: name.to_string(),
    })
}
