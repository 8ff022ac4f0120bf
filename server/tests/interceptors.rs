//! Integration tests for the interceptor chain.

mod common;

use common::*;
use grpc_server::transport::memory::MemoryRequest;
use grpc_server::{
    CallFuture, CallOutcome, Code, Error, InterceptedCall, Interceptor, InterceptorActivator,
    InterceptorRegistration, Next, Server, ServerCallContext, Status, interceptor_fn,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn recorder(name: &'static str, log: &Log) -> InterceptorRegistration {
    let log = log.clone();
    InterceptorRegistration::shared(
        name,
        interceptor_fn(move |call: InterceptedCall, next: Next| -> CallFuture {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(format!("pre {name}"));
                let outcome = next.run(call).await;
                log.lock().unwrap().push(format!("post {name}"));
                outcome
            })
        }),
    )
}

#[tokio::test]
async fn test_global_service_method_order() {
    let log = Log::default();
    let service = greeter()
        .interceptor(recorder("service", &log))
        .method_interceptor("SayHello", recorder("method", &log))
        .build()
        .unwrap();
    let server = Server::builder()
        .interceptor(recorder("global A", &log))
        .interceptor(recorder("global B", &log))
        .add_service(service)
        .build()
        .unwrap();

    let recorded = call(&server, MemoryRequest::new(path("SayHello")).message(&hello("x"))).await;
    assert_eq!(recorded.status().unwrap().code(), Code::Ok);

    let log = log.lock().unwrap().clone();
    assert_eq!(
        log,
        [
            "pre global A",
            "pre global B",
            "pre service",
            "pre method",
            "post method",
            "post service",
            "post global B",
            "post global A",
        ]
    );
}

#[tokio::test]
async fn test_method_interceptor_scope() {
    let log = Log::default();
    let service = greeter()
        .method_interceptor("SayHello", recorder("method", &log))
        .build()
        .unwrap();
    let server = Server::builder().add_service(service).build().unwrap();

    call(&server, MemoryRequest::new(path("Silent")).message(&hello("x"))).await;
    assert!(log.lock().unwrap().is_empty());

    call(&server, MemoryRequest::new(path("SayHello")).message(&hello("x"))).await;
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_short_circuit() {
    let service = greeter().build().unwrap();
    let deny = interceptor_fn(|call: InterceptedCall, next: Next| -> CallFuture {
        let authorized = call.context.request_headers().get("authorization") == Some("secret");
        if authorized {
            next.run(call)
        } else {
            Box::pin(async move {
                let outcome: CallOutcome = Err(Status::unauthenticated("missing credentials").into());
                outcome
            })
        }
    });
    let server = Server::builder()
        .interceptor(InterceptorRegistration::shared("auth", deny))
        .add_service(service)
        .build()
        .unwrap();

    let recorded = call(&server, MemoryRequest::new(path("SayHello")).message(&hello("x"))).await;
    let status = recorded.status().unwrap();
    assert_eq!(status.code(), Code::Unauthenticated);
    assert_eq!(status.message(), Some("missing credentials"));

    let request = MemoryRequest::new(path("SayHello"))
        .header("authorization", "secret")
        .message(&hello("x"));
    let recorded = call(&server, request).await;
    assert_eq!(recorded.status().unwrap().code(), Code::Ok);
}

#[tokio::test]
async fn test_request_and_response_rewrite() {
    let service = greeter().build().unwrap();
    let rewrite = interceptor_fn(|mut call: InterceptedCall, next: Next| -> CallFuture {
        Box::pin(async move {
            if let Some(request) = call.request_as::<HelloRequest>() {
                let name = request.name.to_uppercase();
                call.request = Some(Box::new(HelloRequest { name }));
            }
            let mut response = next.run(call).await?;
            if let Some(reply) = response.as_mut().and_then(|r| r.downcast_mut::<HelloReply>()) {
                reply.message.push('!');
            }
            Ok(response)
        })
    });
    let server = Server::builder()
        .interceptor(InterceptorRegistration::shared("rewrite", rewrite))
        .add_service(service)
        .build()
        .unwrap();

    let recorded = call(&server, MemoryRequest::new(path("SayHello")).message(&hello("bob"))).await;
    let replies: Vec<HelloReply> = messages(&recorded);
    assert_eq!(replies[0].message, "Hello BOB!");
}

#[tokio::test]
async fn test_wrong_request_type_from_interceptor() {
    let service = greeter().build().unwrap();
    let swap = interceptor_fn(|mut call: InterceptedCall, next: Next| -> CallFuture {
        call.request = Some(Box::new(42u32));
        next.run(call)
    });
    let server = Server::builder()
        .interceptor(InterceptorRegistration::shared("swap", swap))
        .add_service(service)
        .build()
        .unwrap();

    let recorded = call(&server, MemoryRequest::new(path("SayHello")).message(&hello("x"))).await;
    assert_eq!(recorded.status().unwrap().code(), Code::Internal);
}

struct Passthrough;

impl Interceptor for Passthrough {
    fn intercept(self: Arc<Self>, call: InterceptedCall, next: Next) -> CallFuture {
        next.run(call)
    }
}

#[derive(Default)]
struct Pool {
    created: AtomicUsize,
    released: AtomicUsize,
    fail: bool,
}

impl InterceptorActivator for Pool {
    fn create(&self, _: &ServerCallContext) -> Result<Arc<dyn Interceptor>, Error> {
        if self.fail {
            return Err(Status::unavailable("pool exhausted").into());
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Passthrough))
    }

    fn release(&self, _: Arc<dyn Interceptor>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_activated_interceptors_released() {
    let pool = Arc::new(Pool::default());
    let server = Server::builder()
        .interceptor(InterceptorRegistration::with_activator("pooled", pool.clone()))
        .add_service(greeter_service())
        .build()
        .unwrap();

    for method in ["SayHello", "Fail", "Panic", "CountUp"] {
        call(&server, MemoryRequest::new(path(method)).message(&hello("x"))).await;
    }

    // CountUp fails to decode a HelloRequest as a counter before activation.
    assert_eq!(pool.created.load(Ordering::SeqCst), 3);
    assert_eq!(pool.released.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_interceptor_activation_failure() {
    let pool = Arc::new(Pool {
        fail: true,
        ..Pool::default()
    });
    let server = Server::builder()
        .interceptor(InterceptorRegistration::with_activator("pooled", pool.clone()))
        .add_service(greeter_service())
        .build()
        .unwrap();

    let recorded = call(&server, MemoryRequest::new(path("SayHello")).message(&hello("x"))).await;
    let status = recorded.status().unwrap();
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(status.message(), Some("pool exhausted"));
    assert_eq!(pool.released.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_per_call_factory() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let registration = InterceptorRegistration::factory(
        "per-call",
        move |_: &ServerCallContext| -> Result<Passthrough, Error> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Passthrough)
        },
    );
    let server = Server::builder()
        .interceptor(registration)
        .add_service(greeter_service())
        .build()
        .unwrap();

    for _ in 0..2 {
        call(&server, MemoryRequest::new(path("SayHello")).message(&hello("x"))).await;
    }
    assert_eq!(built.load(Ordering::SeqCst), 2);
}
