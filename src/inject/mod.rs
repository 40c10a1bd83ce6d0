//! Resource injection.
//!
//! A decorator acquires one resource before the wrapped handler runs and
//! registers its release with the invocation's cleanup registry. Handlers
//! receive their resources as a nested tuple: the outermost decorator's
//! resource is the innermost element, so
//!
//! ```text
//! with_database(with_config(handler))
//! ```
//!
//! calls `handler(invocation, (settings, (session, ())))`. Each decorator
//! peels one element off, and the lifecycle adapter supplies the final `()`.

pub mod config;
pub mod database;

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::config::ConfigError;
use crate::error::{Classify, ErrorKind};
use crate::lifecycle::{CleanupHandler, Invocation};

pub use self::config::{with_config, with_config_from, ConfigFactory};
pub use database::{
    check_health, with_database, with_database_from, ConnectionPool, Connector, DatabaseConfig,
    DatabaseError, DatabaseFactory, DbSession,
};

/// Errors raised while acquiring a resource.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// A required setting, such as `DATABASE_URL`, is absent.
    #[error("missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("invalid value for {name}: {value:?}")]
    InvalidConfiguration { name: String, value: String },

    #[error("failed to load settings: {0}")]
    Settings(#[from] ConfigError),

    #[error("failed to acquire {resource}")]
    Acquisition {
        resource: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },

    /// No capacity became available in time.
    #[error("{resource} exhausted: no capacity after {waited:?}")]
    Exhausted { resource: String, waited: Duration },
}

impl ResourceError {
    /// Wraps a factory failure.
    pub fn acquisition(
        resource: impl Into<String>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        ResourceError::Acquisition {
            resource: resource.into(),
            source: source.into(),
        }
    }
}

impl Classify for ResourceError {
    fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ResourceError::MissingConfiguration(_)
            | ResourceError::InvalidConfiguration { .. }
            | ResourceError::Settings(_) => Some(ErrorKind::Validation),
            ResourceError::Exhausted { .. } => Some(ErrorKind::ResourceExhaustion),
            // decided by the source
            ResourceError::Acquisition { .. } => None,
        }
    }
}

/// A freshly acquired resource and the handler that releases it.
pub struct Acquired<R> {
    resource: R,
    release: Option<CleanupHandler>,
}

impl<R> Acquired<R> {
    /// A resource that needs no release.
    pub fn new(resource: R) -> Self {
        Self {
            resource,
            release: None,
        }
    }

    pub fn with_release(resource: R, release: CleanupHandler) -> Self {
        Self {
            resource,
            release: Some(release),
        }
    }

    pub fn into_parts(self) -> (R, Option<CleanupHandler>) {
        (self.resource, self.release)
    }
}

impl<R: fmt::Debug> fmt::Debug for Acquired<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquired")
            .field("resource", &self.resource)
            .field("release", &self.release)
            .finish()
    }
}

/// Acquires one resource per invocation.
#[async_trait]
pub trait ResourceFactory<P, C>: Send + Sync
where
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    type Resource: Send + 'static;

    async fn acquire(
        &self,
        invocation: &Invocation<P, C>,
    ) -> Result<Acquired<Self::Resource>, ResourceError>;
}

/// A [`ResourceFactory`] backed by a closure.
///
/// The closure's future may not borrow the invocation; copy what it needs.
pub struct FnFactory<F>(F);

/// Turns a closure into a [`ResourceFactory`].
pub fn factory_fn<F>(f: F) -> FnFactory<F> {
    FnFactory(f)
}

#[async_trait]
impl<F, Fut, R, P, C> ResourceFactory<P, C> for FnFactory<F>
where
    F: Fn(&Invocation<P, C>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Acquired<R>, ResourceError>> + Send + 'static,
    R: Send + 'static,
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    type Resource = R;

    async fn acquire(&self, invocation: &Invocation<P, C>) -> Result<Acquired<R>, ResourceError> {
        (self.0)(invocation).await
    }
}

/// The generic injection decorator.
///
/// Returns a handler taking the remaining resources `D`. On each call the
/// factory runs first; if it fails the error is returned, nothing is
/// registered and `handler` never runs. On success the release is
/// registered immediately, before `handler` is called, so it runs at the
/// invocation's final drain even if `handler` fails.
pub fn inject<F, H, Fut, P, C, D, T, E>(
    factory: F,
    handler: H,
) -> impl Fn(Invocation<P, C>, D) -> BoxFuture<'static, Result<T, E>> + Send + Sync
where
    F: ResourceFactory<P, C> + 'static,
    H: Fn(Invocation<P, C>, (F::Resource, D)) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
    D: Send + 'static,
    E: From<ResourceError> + 'static,
    T: 'static,
{
    let factory = Arc::new(factory);
    let handler = Arc::new(handler);
    move |invocation: Invocation<P, C>, resources: D| -> BoxFuture<'static, Result<T, E>> {
        let factory = Arc::clone(&factory);
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let (resource, release) = factory.acquire(&invocation).await?.into_parts();
            if let Some(release) = release {
                tracing::trace!(label = release.label(), "registered resource release");
                invocation.register_cleanup(release);
            }
            (*handler)(invocation, (resource, resources)).await
        })
    }
}
