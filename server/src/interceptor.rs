//! Server interceptors.
//!
//! An interceptor wraps the rest of the call: it receives the call and a
//! [`Next`] continuation, may inspect or replace the request, run code
//! before and after the continuation, or answer the call itself without
//! calling `next` at all.
//!
//! Registrations are ordered global, then service, then method, and the
//! first registered interceptor is the outermost: with `[A, B, C]` the
//! pre-processing runs A, B, C and the post-processing C, B, A.

use crate::context::ServerCallContext;
use crate::error::Error;
use crate::method::MethodInfo;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A type-erased request or response message.
pub type AnyMessage = Box<dyn Any + Send>;

/// Result of running the rest of a call.
///
/// For unary and client-streaming methods this is the response message;
/// `None` means the method produced no message. Streaming-response methods
/// always yield `None` since their messages were written as they went.
pub type CallOutcome = Result<Option<AnyMessage>, Error>;

pub type CallFuture = BoxFuture<'static, CallOutcome>;

/// The call as it flows through the interceptor chain.
pub struct InterceptedCall {
    pub context: ServerCallContext,
    pub method: MethodInfo,
    /// The request message for unary and server-streaming methods. Streamed
    /// requests are read by the handler and are not visible here.
    pub request: Option<AnyMessage>,
}

impl InterceptedCall {
    /// Borrow the request as `T`, if that is its type.
    pub fn request_as<T: 'static>(&self) -> Option<&T> {
        self.request.as_ref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for InterceptedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptedCall")
            .field("method", &self.method.path())
            .field("has_request", &self.request.is_some())
            .finish()
    }
}

/// The remainder of the chain.
pub struct Next {
    run: Box<dyn FnOnce(InterceptedCall) -> CallFuture + Send>,
}

impl Next {
    pub fn new<F>(run: F) -> Self
    where
        F: FnOnce(InterceptedCall) -> CallFuture + Send + 'static,
    {
        Self { run: Box::new(run) }
    }

    /// Continue the call.
    pub fn run(self, call: InterceptedCall) -> CallFuture {
        (self.run)(call)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Next")
    }
}

/// Middleware around a call.
pub trait Interceptor: Send + Sync + 'static {
    fn intercept(self: Arc<Self>, call: InterceptedCall, next: Next) -> CallFuture;
}

/// Interceptor from a closure.
pub struct FnInterceptor<F> {
    f: F,
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(InterceptedCall, Next) -> CallFuture + Send + Sync + 'static,
{
    fn intercept(self: Arc<Self>, call: InterceptedCall, next: Next) -> CallFuture {
        (self.f)(call, next)
    }
}

/// Build an interceptor from a closure.
pub fn interceptor_fn<F>(f: F) -> FnInterceptor<F>
where
    F: Fn(InterceptedCall, Next) -> CallFuture + Send + Sync + 'static,
{
    FnInterceptor { f }
}

/// Creates an interceptor for each call and releases it afterwards.
pub trait InterceptorActivator: Send + Sync + 'static {
    fn create(&self, context: &ServerCallContext) -> Result<Arc<dyn Interceptor>, Error>;

    /// Called once per successful `create`, when the call is done with the
    /// interceptor, however the call ended.
    fn release(&self, _interceptor: Arc<dyn Interceptor>) {}
}

struct SharedInterceptor(Arc<dyn Interceptor>);

impl InterceptorActivator for SharedInterceptor {
    fn create(&self, _: &ServerCallContext) -> Result<Arc<dyn Interceptor>, Error> {
        Ok(self.0.clone())
    }
}

struct FactoryInterceptor<F>(F);

impl<F, I> InterceptorActivator for FactoryInterceptor<F>
where
    F: Fn(&ServerCallContext) -> Result<I, Error> + Send + Sync + 'static,
    I: Interceptor,
{
    fn create(&self, context: &ServerCallContext) -> Result<Arc<dyn Interceptor>, Error> {
        Ok(Arc::new((self.0)(context)?))
    }
}

/// One entry in an interceptor list.
#[derive(Clone)]
pub struct InterceptorRegistration {
    name: String,
    activator: Arc<dyn InterceptorActivator>,
}

impl InterceptorRegistration {
    /// One instance shared by every call.
    pub fn shared<I: Interceptor>(name: impl Into<String>, interceptor: I) -> Self {
        Self {
            name: name.into(),
            activator: Arc::new(SharedInterceptor(Arc::new(interceptor))),
        }
    }

    /// A fresh instance per call. The factory closure carries whatever
    /// construction arguments the interceptor needs.
    pub fn factory<F, I>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ServerCallContext) -> Result<I, Error> + Send + Sync + 'static,
        I: Interceptor,
    {
        Self {
            name: name.into(),
            activator: Arc::new(FactoryInterceptor(factory)),
        }
    }

    /// A custom activator, for interceptors whose lifetime is managed
    /// elsewhere.
    pub fn with_activator(
        name: impl Into<String>,
        activator: Arc<dyn InterceptorActivator>,
    ) -> Self {
        Self {
            name: name.into(),
            activator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create this call's instance, paired with its release.
    pub(crate) fn activate(&self, context: &ServerCallContext) -> Result<InterceptorLease, Error> {
        let interceptor = self.activator.create(context)?;
        Ok(InterceptorLease {
            activator: self.activator.clone(),
            interceptor: Some(interceptor),
        })
    }
}

impl fmt::Debug for InterceptorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorRegistration")
            .field("name", &self.name)
            .finish()
    }
}

/// A created interceptor, released on drop.
pub(crate) struct InterceptorLease {
    activator: Arc<dyn InterceptorActivator>,
    interceptor: Option<Arc<dyn Interceptor>>,
}

impl InterceptorLease {
    pub(crate) fn interceptor(&self) -> Option<Arc<dyn Interceptor>> {
        self.interceptor.clone()
    }
}

impl Drop for InterceptorLease {
    fn drop(&mut self) {
        if let Some(interceptor) = self.interceptor.take() {
            self.activator.release(interceptor);
        }
    }
}

/// Activate every registration in order.
///
/// If one fails, the ones already created are released before the error is
/// returned.
pub(crate) fn activate_all(
    registrations: &[InterceptorRegistration],
    context: &ServerCallContext,
) -> Result<Vec<InterceptorLease>, Error> {
    let mut leases = Vec::with_capacity(registrations.len());
    for registration in registrations {
        match registration.activate(context) {
            Ok(lease) => leases.push(lease),
            Err(e) => {
                tracing::debug!(interceptor = registration.name(), "interceptor activation failed");
                release_all(leases);
                return Err(e);
            }
        }
    }
    Ok(leases)
}

/// Release leases innermost first.
pub(crate) fn release_all(mut leases: Vec<InterceptorLease>) {
    while let Some(lease) = leases.pop() {
        drop(lease);
    }
}

/// Fold interceptors around `terminal`; the first one ends up outermost.
pub(crate) fn build_pipeline(interceptors: Vec<Arc<dyn Interceptor>>, terminal: Next) -> Next {
    interceptors
        .into_iter()
        .rev()
        .fold(terminal, |next, interceptor| {
            Next::new(move |call| interceptor.intercept(call, next))
        })
}
