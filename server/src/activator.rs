//! Service instance activation.
//!
//! Every call resolves its service instance through a [`ServiceActivator`]
//! and hands it back when the call is over. `create` and `release` are
//! paired: each successful `create` gets exactly one `release`, whether the
//! call succeeds, fails or is cancelled.

use crate::context::ServerCallContext;
use crate::error::Error;
use std::fmt;
use std::sync::Arc;

pub trait ServiceActivator<S>: Send + Sync + 'static {
    fn create(&self, context: &ServerCallContext) -> Result<Arc<S>, Error>;

    fn release(&self, _service: Arc<S>) {}
}

/// Every call uses the same instance.
pub struct SharedActivator<S> {
    service: Arc<S>,
}

impl<S> SharedActivator<S> {
    pub fn new(service: S) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    pub fn from_arc(service: Arc<S>) -> Self {
        Self { service }
    }
}

impl<S: Send + Sync + 'static> ServiceActivator<S> for SharedActivator<S> {
    fn create(&self, _: &ServerCallContext) -> Result<Arc<S>, Error> {
        Ok(self.service.clone())
    }
}

/// A new instance per call, built by a factory closure.
pub struct FactoryActivator<F> {
    factory: F,
}

impl<F> FactoryActivator<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<S, F> ServiceActivator<S> for FactoryActivator<F>
where
    S: Send + Sync + 'static,
    F: Fn(&ServerCallContext) -> Result<S, Error> + Send + Sync + 'static,
{
    fn create(&self, context: &ServerCallContext) -> Result<Arc<S>, Error> {
        (self.factory)(context).map(Arc::new)
    }
}

/// An activated instance; released when dropped.
pub(crate) struct ServiceHandle<S: 'static> {
    activator: Arc<dyn ServiceActivator<S>>,
    service: Arc<S>,
}

impl<S: 'static> ServiceHandle<S> {
    pub(crate) fn activate(
        activator: &Arc<dyn ServiceActivator<S>>,
        context: &ServerCallContext,
    ) -> Result<Self, Error> {
        let service = activator.create(context)?;
        Ok(Self {
            activator: activator.clone(),
            service,
        })
    }

    pub(crate) fn service(&self) -> Arc<S> {
        self.service.clone()
    }
}

impl<S: 'static> Drop for ServiceHandle<S> {
    fn drop(&mut self) {
        self.activator.release(self.service.clone());
    }
}

impl<S: 'static> fmt::Debug for ServiceHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service", &std::any::type_name::<S>())
            .finish()
    }
}
