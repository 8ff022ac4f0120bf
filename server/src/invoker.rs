//! Binds a method to its service activator and interceptors.
//!
//! One invocation activates the service instance, then each interceptor in
//! order, runs the pipeline, and releases everything in reverse. Release
//! also happens when the invocation is dropped part way, e.g. once the grace
//! period after a deadline runs out.

use crate::activator::{ServiceActivator, ServiceHandle};
use crate::context::ServerCallContext;
use crate::error::Error;
use crate::interceptor::{
    AnyMessage, CallFuture, CallOutcome, InterceptedCall, InterceptorLease,
    InterceptorRegistration, Next, activate_all, build_pipeline, release_all,
};
use crate::method::MethodInfo;
use std::sync::Arc;

/// The innermost step of a call, given the activated service.
pub(crate) type Terminal<S> = Box<dyn FnOnce(Arc<S>, InterceptedCall) -> CallFuture + Send>;

/// Everything activated for one call.
struct Activation<S: 'static> {
    leases: Vec<InterceptorLease>,
    service: ServiceHandle<S>,
}

impl<S: 'static> Drop for Activation<S> {
    fn drop(&mut self) {
        release_all(std::mem::take(&mut self.leases));
    }
}

pub(crate) struct MethodInvoker<S: 'static> {
    method: MethodInfo,
    activator: Arc<dyn ServiceActivator<S>>,
    interceptors: Vec<InterceptorRegistration>,
}

impl<S: Send + Sync + 'static> MethodInvoker<S> {
    /// `interceptors` is the full ordered list: global, service, method.
    pub(crate) fn new(
        method: MethodInfo,
        activator: Arc<dyn ServiceActivator<S>>,
        interceptors: Vec<InterceptorRegistration>,
    ) -> Self {
        Self {
            method,
            activator,
            interceptors,
        }
    }

    pub(crate) fn method(&self) -> &MethodInfo {
        &self.method
    }

    pub(crate) async fn invoke(
        &self,
        context: ServerCallContext,
        request: Option<AnyMessage>,
        terminal: Terminal<S>,
    ) -> CallOutcome {
        let service = ServiceHandle::activate(&self.activator, &context).inspect_err(|e| {
            tracing::debug!(error = %e, service = self.method.service(), "service activation failed");
        })?;
        let leases = activate_all(&self.interceptors, &context)?;
        let activation = Activation { leases, service };

        let instance = activation.service.service();
        let interceptors = activation
            .leases
            .iter()
            .filter_map(InterceptorLease::interceptor)
            .collect();
        let pipeline = build_pipeline(
            interceptors,
            Next::new(move |call| terminal(instance, call)),
        );

        let outcome = pipeline
            .run(InterceptedCall {
                context,
                method: self.method.clone(),
                request,
            })
            .await;
        drop(activation);
        outcome
    }
}

/// Take the request out of an intercepted call as `T`.
pub(crate) fn take_request<T: 'static>(call: &mut InterceptedCall) -> Result<T, Error> {
    match call.request.take().map(|m| m.downcast::<T>()) {
        Some(Ok(request)) => Ok(*request),
        Some(Err(_)) => Err(Error::invalid_operation(
            "Request message was replaced with a value of the wrong type.",
        )),
        None => Err(Error::invalid_operation("Request message is missing.")),
    }
}

/// Unwrap a single-response outcome as `T`. `None` means the method
/// produced no message.
pub(crate) fn take_response<T: 'static>(response: Option<AnyMessage>) -> Result<Option<T>, Error> {
    match response.map(|m| m.downcast::<T>()) {
        Some(Ok(message)) => Ok(Some(*message)),
        Some(Err(_)) => Err(Error::invalid_operation(
            "Response message was replaced with a value of the wrong type.",
        )),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::deadline::Deadline;
    use crate::interceptor::{Interceptor, InterceptorActivator};
    use crate::method::MethodType;
    use grpc::{Code, Status};
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Greeter;

    struct LoggingActivator {
        log: Log,
        fail: bool,
    }

    impl ServiceActivator<Greeter> for LoggingActivator {
        fn create(&self, _: &ServerCallContext) -> Result<Arc<Greeter>, Error> {
            if self.fail {
                return Err(Status::unavailable("no instance").into());
            }
            self.log.lock().push("create service".into());
            Ok(Arc::new(Greeter))
        }

        fn release(&self, _: Arc<Greeter>) {
            self.log.lock().push("release service".into());
        }
    }

    struct Passthrough;

    impl Interceptor for Passthrough {
        fn intercept(self: Arc<Self>, call: InterceptedCall, next: Next) -> CallFuture {
            next.run(call)
        }
    }

    struct LoggingInterceptor {
        name: &'static str,
        log: Log,
    }

    impl InterceptorActivator for LoggingInterceptor {
        fn create(&self, _: &ServerCallContext) -> Result<Arc<dyn Interceptor>, Error> {
            self.log.lock().push(format!("create {}", self.name));
            Ok(Arc::new(Passthrough))
        }

        fn release(&self, _: Arc<dyn Interceptor>) {
            self.log.lock().push(format!("release {}", self.name));
        }
    }

    fn invoker(log: &Log, fail: bool) -> MethodInvoker<Greeter> {
        let interceptors = ["A", "B"]
            .into_iter()
            .map(|name| {
                InterceptorRegistration::with_activator(
                    name,
                    Arc::new(LoggingInterceptor {
                        name,
                        log: log.clone(),
                    }),
                )
            })
            .collect();
        MethodInvoker::new(
            MethodInfo::new("test.Service", "Call", MethodType::Unary),
            Arc::new(LoggingActivator {
                log: log.clone(),
                fail,
            }),
            interceptors,
        )
    }

    fn echo(log: Log) -> Terminal<Greeter> {
        Box::new(move |_service: Arc<Greeter>, mut call: InterceptedCall| -> CallFuture {
            Box::pin(async move {
                log.lock().push("handler".into());
                let n: u32 = take_request(&mut call)?;
                Ok::<_, Error>(Some(Box::new(n + 1) as AnyMessage))
            })
        })
    }

    #[tokio::test]
    async fn test_activation_brackets_the_call() {
        let (ctx, _) = test_context(Deadline::none());
        let log: Log = Default::default();

        let outcome = invoker(&log, false)
            .invoke(ctx, Some(Box::new(1u32)), echo(log.clone()))
            .await
            .unwrap();
        assert_eq!(take_response::<u32>(outcome).unwrap(), Some(2));
        assert_eq!(
            *log.lock(),
            vec![
                "create service",
                "create A",
                "create B",
                "handler",
                "release B",
                "release A",
                "release service",
            ]
        );
    }

    #[tokio::test]
    async fn test_release_after_handler_error() {
        let (ctx, _) = test_context(Deadline::none());
        let log: Log = Default::default();
        let terminal: Terminal<Greeter> = Box::new(|_: Arc<Greeter>, _: InterceptedCall| -> CallFuture {
            Box::pin(async {
                let outcome: CallOutcome = Err(Status::not_found("missing").into());
                outcome
            })
        });

        assert!(invoker(&log, false).invoke(ctx, None, terminal).await.is_err());
        assert_eq!(log.lock().last().map(String::as_str), Some("release service"));
    }

    #[tokio::test]
    async fn test_activation_failure_skips_handler() {
        let (ctx, _) = test_context(Deadline::none());
        let log: Log = Default::default();

        let err = invoker(&log, true)
            .invoke(ctx, Some(Box::new(1u32)), echo(log.clone()))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Status(s) if s.code() == Code::Unavailable));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_invocation_still_releases() {
        let (ctx, _) = test_context(Deadline::none());
        let log: Log = Default::default();
        let terminal: Terminal<Greeter> =
            Box::new(|_: Arc<Greeter>, _: InterceptedCall| -> CallFuture {
                Box::pin(futures::future::pending::<CallOutcome>())
            });

        let invoker = invoker(&log, false);
        let mut call = Box::pin(invoker.invoke(ctx, None, terminal));
        assert!(futures::poll!(call.as_mut()).is_pending());
        drop(call);

        assert_eq!(
            log.lock()[3..],
            ["release B", "release A", "release service"]
        );
    }

    #[test]
    fn test_wrong_request_type() {
        let mut call = InterceptedCall {
            context: test_context(Deadline::none()).0,
            method: MethodInfo::new("s", "m", MethodType::Unary),
            request: Some(Box::new("text")),
        };
        assert!(take_request::<u32>(&mut call).is_err());
        assert!(take_response::<u32>(None).unwrap().is_none());
    }
}
