//! The dispatching server: routes requests to registered methods.

use crate::config::{ConfigError, GrpcConfig};
use crate::handler::CallHandler;
use crate::interceptor::InterceptorRegistration;
use crate::method::MethodInfo;
use crate::metrics;
use crate::response::ResponseChannel;
use crate::service::ServiceDefinition;
use crate::transport::{HttpRequest, ResponseSink};
use grpc::{CompressionLevel, CompressionProvider, CompressionRegistry, Metadata, Status};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Settings shared read-only by every call.
#[derive(Debug, Clone)]
pub(crate) struct ServerOptions {
    pub max_receive_message_size: Option<usize>,
    pub max_send_message_size: Option<usize>,
    pub detailed_errors: bool,
    pub compression: CompressionRegistry,
    pub response_compression_algorithm: Option<String>,
    pub compression_level: CompressionLevel,
    pub compression_min_size: usize,
    pub grace_period: Duration,
    pub ignore_unknown_services: bool,
    pub ignore_unknown_methods: bool,
}

impl ServerOptions {
    fn new(config: &GrpcConfig, compression: CompressionRegistry) -> Self {
        Self {
            max_receive_message_size: config.max_receive_message_size,
            max_send_message_size: config.max_send_message_size,
            detailed_errors: config.enable_detailed_errors,
            compression,
            response_compression_algorithm: config.response_compression_algorithm.clone(),
            compression_level: config.response_compression_level,
            compression_min_size: config.compression_min_size,
            grace_period: config.deadline_grace_period(),
            ignore_unknown_services: config.ignore_unknown_services,
            ignore_unknown_methods: config.ignore_unknown_methods,
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new(&GrpcConfig::default(), CompressionRegistry::with_defaults())
    }
}

/// What became of a dispatched request.
pub enum Dispatch {
    /// The engine answered the request.
    Handled,
    /// No method matched and the server is configured to pass unknown
    /// routes on. The request and sink are handed back untouched.
    NotFound(HttpRequest, Box<dyn ResponseSink>),
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Handled => f.write_str("Handled"),
            Dispatch::NotFound(request, _) => f.debug_tuple("NotFound").field(&request.path).finish(),
        }
    }
}

pub struct ServerBuilder {
    config: GrpcConfig,
    compression: CompressionRegistry,
    interceptors: Vec<InterceptorRegistration>,
    services: Vec<ServiceDefinition>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: GrpcConfig::default(),
            compression: CompressionRegistry::with_defaults(),
            interceptors: Vec::new(),
            services: Vec::new(),
        }
    }
}

impl ServerBuilder {
    pub fn config(mut self, config: GrpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a compression provider in addition to the built-in gzip.
    pub fn compression_provider(mut self, provider: Arc<dyn CompressionProvider>) -> Self {
        self.compression = self.compression.with_provider(provider);
        self
    }

    /// An interceptor for every method on the server. Global interceptors
    /// are the outermost.
    pub fn interceptor(mut self, registration: InterceptorRegistration) -> Self {
        self.interceptors.push(registration);
        self
    }

    pub fn add_service(mut self, service: ServiceDefinition) -> Self {
        self.services.push(service);
        self
    }

    pub fn build(self) -> Result<Server, ConfigError> {
        self.config.validate()?;
        if let Some(algorithm) = &self.config.response_compression_algorithm
            && !self.compression.supports(algorithm)
        {
            return Err(ConfigError::Invalid(format!(
                "no compression provider for response_compression_algorithm '{algorithm}'"
            )));
        }

        let mut services = HashSet::new();
        let mut methods: HashMap<String, Arc<dyn CallHandler>> = HashMap::new();
        for service in self.services {
            if !services.insert(service.name().to_string()) {
                return Err(ConfigError::Invalid(format!(
                    "service '{}' is registered twice",
                    service.name()
                )));
            }
            for method in service.methods {
                let interceptors = self
                    .interceptors
                    .iter()
                    .cloned()
                    .chain(method.interceptors)
                    .collect();
                let handler = (method.bind)(interceptors);
                methods.insert(method.info.path().to_string(), handler);
            }
        }

        tracing::debug!(
            services = services.len(),
            methods = methods.len(),
            "grpc server built"
        );

        Ok(Server {
            options: Arc::new(ServerOptions::new(&self.config, self.compression)),
            services,
            methods,
        })
    }
}

/// Routes requests to registered methods. Immutable once built.
pub struct Server {
    options: Arc<ServerOptions>,
    services: HashSet<String>,
    methods: HashMap<String, Arc<dyn CallHandler>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The method registered at `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<&MethodInfo> {
        self.methods.get(path).map(|handler| handler.method())
    }

    /// Serve one request to completion.
    ///
    /// Unknown routes are answered with `Unimplemented`, or handed back in
    /// [`Dispatch::NotFound`] when the matching ignore flag is set.
    pub async fn dispatch(&self, request: HttpRequest, mut sink: Box<dyn ResponseSink>) -> Dispatch {
        if let Some(handler) = self.methods.get(&request.path) {
            handler
                .clone()
                .handle(request, sink, self.options.clone())
                .await;
            return Dispatch::Handled;
        }

        let known_service = service_name(&request.path).is_some_and(|s| self.services.contains(s));
        let pass_through = if known_service {
            self.options.ignore_unknown_methods
        } else {
            self.options.ignore_unknown_services
        };
        if pass_through {
            return Dispatch::NotFound(request, sink);
        }

        let message = if known_service {
            "Method is unimplemented."
        } else {
            "Service is unimplemented."
        };
        metrics::CALLS_UNIMPLEMENTED.increment();
        tracing::debug!(path = %request.path, reason = message, "no method for request");
        ResponseChannel::reject(&mut *sink, 200, &Status::unimplemented(message), Metadata::new()).await;
        Dispatch::Handled
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.methods.keys().collect();
        paths.sort();
        f.debug_struct("Server")
            .field("methods", &paths)
            .field("options", &self.options)
            .finish()
    }
}

/// `/pkg.Service/Method` -> `pkg.Service`.
fn service_name(path: &str) -> Option<&str> {
    let (service, _) = path.strip_prefix('/')?.rsplit_once('/')?;
    Some(service)
}
