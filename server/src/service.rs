//! Service registration.
//!
//! A [`ServiceBuilder`] collects the methods of one service together with
//! the delegates that implement them, its activator and its interceptors.
//! The result is a [`ServiceDefinition`] to hand to the server builder.

use crate::activator::{ServiceActivator, SharedActivator};
use crate::config::ConfigError;
use crate::context::ServerCallContext;
use crate::error::Error;
use crate::handler::{CallHandler, Delegate, MethodHandler};
use crate::interceptor::InterceptorRegistration;
use crate::invoker::MethodInvoker;
use crate::method::{Method, MethodInfo, MethodType};
use crate::streaming::{RequestStream, ServerStreamWriter};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type Bind = Box<dyn FnOnce(Vec<InterceptorRegistration>) -> Arc<dyn CallHandler> + Send>;

struct PendingMethod {
    info: MethodInfo,
    bind: Bind,
}

/// A method ready to be bound into the routing table.
pub(crate) struct RegisteredMethod {
    pub(crate) info: MethodInfo,
    /// Service then method interceptors; global ones are prepended by the
    /// server.
    pub(crate) interceptors: Vec<InterceptorRegistration>,
    pub(crate) bind: Bind,
}

/// The built registration table of one service.
pub struct ServiceDefinition {
    name: String,
    pub(crate) methods: Vec<RegisteredMethod>,
}

impl ServiceDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registered methods, in registration order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodInfo> {
        self.methods.iter().map(|m| &m.info)
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("methods", &self.methods().map(MethodInfo::name).collect::<Vec<_>>())
            .finish()
    }
}

/// Builds a [`ServiceDefinition`] for a service implemented by `S`.
pub struct ServiceBuilder<S: 'static> {
    name: String,
    activator: Arc<dyn ServiceActivator<S>>,
    interceptors: Vec<InterceptorRegistration>,
    method_interceptors: HashMap<String, Vec<InterceptorRegistration>>,
    methods: Vec<PendingMethod>,
    errors: Vec<String>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// `name` is the fully qualified service name, e.g. `greet.Greeter`.
    pub fn new(name: impl Into<String>, activator: impl ServiceActivator<S>) -> Self {
        Self::with_activator(name, Arc::new(activator))
    }

    /// Every call shares `service`.
    pub fn shared(name: impl Into<String>, service: S) -> Self {
        Self::new(name, SharedActivator::new(service))
    }

    pub fn with_activator(name: impl Into<String>, activator: Arc<dyn ServiceActivator<S>>) -> Self {
        Self {
            name: name.into(),
            activator,
            interceptors: Vec::new(),
            method_interceptors: HashMap::new(),
            methods: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// An interceptor for every method of this service. Runs inside global
    /// interceptors and outside method ones.
    pub fn interceptor(mut self, registration: InterceptorRegistration) -> Self {
        self.interceptors.push(registration);
        self
    }

    /// An interceptor for one method, by method name.
    pub fn method_interceptor(
        mut self,
        method: impl Into<String>,
        registration: InterceptorRegistration,
    ) -> Self {
        self.method_interceptors
            .entry(method.into())
            .or_default()
            .push(registration);
        self
    }

    pub fn unary<Req, Resp, F, Fut>(self, method: Method<Req, Resp>, handler: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Arc<S>, Req, ServerCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Resp>, Error>> + Send + 'static,
    {
        let delegate = move |service: Arc<S>,
                             request: Req,
                             context: ServerCallContext|
              -> BoxFuture<'static, Result<Option<Resp>, Error>> {
            Box::pin(handler(service, request, context))
        };
        self.add(method, MethodType::Unary, Delegate::Unary(Arc::new(delegate)))
    }

    pub fn client_streaming<Req, Resp, F, Fut>(self, method: Method<Req, Resp>, handler: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Arc<S>, RequestStream<Req>, ServerCallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Resp>, Error>> + Send + 'static,
    {
        let delegate = move |service: Arc<S>,
                             requests: RequestStream<Req>,
                             context: ServerCallContext|
              -> BoxFuture<'static, Result<Option<Resp>, Error>> {
            Box::pin(handler(service, requests, context))
        };
        self.add(
            method,
            MethodType::ClientStreaming,
            Delegate::ClientStreaming(Arc::new(delegate)),
        )
    }

    pub fn server_streaming<Req, Resp, F, Fut>(self, method: Method<Req, Resp>, handler: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Arc<S>, Req, ServerStreamWriter<Resp>, ServerCallContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let delegate = move |service: Arc<S>,
                             request: Req,
                             responses: ServerStreamWriter<Resp>,
                             context: ServerCallContext|
              -> BoxFuture<'static, Result<(), Error>> {
            Box::pin(handler(service, request, responses, context))
        };
        self.add(
            method,
            MethodType::ServerStreaming,
            Delegate::ServerStreaming(Arc::new(delegate)),
        )
    }

    pub fn duplex_streaming<Req, Resp, F, Fut>(self, method: Method<Req, Resp>, handler: F) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Arc<S>, RequestStream<Req>, ServerStreamWriter<Resp>, ServerCallContext) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let delegate = move |service: Arc<S>,
                             requests: RequestStream<Req>,
                             responses: ServerStreamWriter<Resp>,
                             context: ServerCallContext|
              -> BoxFuture<'static, Result<(), Error>> {
            Box::pin(handler(service, requests, responses, context))
        };
        self.add(
            method,
            MethodType::DuplexStreaming,
            Delegate::DuplexStreaming(Arc::new(delegate)),
        )
    }

    fn add<Req, Resp>(
        mut self,
        method: Method<Req, Resp>,
        registered_as: MethodType,
        delegate: Delegate<S, Req, Resp>,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let info = method.info().clone();
        if info.kind() != registered_as {
            self.errors.push(format!(
                "method '{}' is {} but was registered as {}",
                info.path(),
                info.kind(),
                registered_as
            ));
            return self;
        }
        if info.service() != self.name {
            self.errors.push(format!(
                "method '{}' does not belong to service '{}'",
                info.path(),
                self.name
            ));
            return self;
        }

        let activator = self.activator.clone();
        let bind: Bind = Box::new(move |interceptors| -> Arc<dyn CallHandler> {
            let invoker = MethodInvoker::new(method.info().clone(), activator, interceptors);
            Arc::new(MethodHandler::new(method, invoker, delegate))
        });
        self.methods.push(PendingMethod { info, bind });
        self
    }

    pub fn build(self) -> Result<ServiceDefinition, ConfigError> {
        let Self {
            name,
            interceptors,
            mut method_interceptors,
            methods,
            mut errors,
            ..
        } = self;

        let mut seen = HashSet::new();
        for method in &methods {
            if !seen.insert(method.info.name().to_string()) {
                errors.push(format!("method '{}' is registered twice", method.info.path()));
            }
        }
        for method_name in method_interceptors.keys() {
            if !seen.contains(method_name) {
                errors.push(format!(
                    "interceptor registered for unknown method '{name}/{method_name}'"
                ));
            }
        }
        if let Some(error) = errors.into_iter().next() {
            return Err(ConfigError::Invalid(error));
        }

        let methods = methods
            .into_iter()
            .map(|method| {
                let scoped = method_interceptors
                    .remove(method.info.name())
                    .unwrap_or_default();
                RegisteredMethod {
                    interceptors: interceptors.iter().cloned().chain(scoped).collect(),
                    info: method.info,
                    bind: method.bind,
                }
            })
            .collect();

        Ok(ServiceDefinition { name, methods })
    }
}

impl<S: 'static> fmt::Debug for ServiceBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish()
    }
}
