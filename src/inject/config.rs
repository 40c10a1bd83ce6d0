//! Settings injection.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use super::{inject, Acquired, ResourceError, ResourceFactory};
use crate::config::SettingsLoader;
use crate::lifecycle::Invocation;

/// Provides a typed settings object to each invocation.
///
/// Settings are read-only and need no release.
pub struct ConfigFactory<S> {
    loader: SettingsLoader,
    cached: bool,
    _settings: PhantomData<fn() -> S>,
}

impl<S> ConfigFactory<S> {
    /// Loads `S` from the process environment once per process.
    pub fn cached() -> Self {
        Self {
            loader: SettingsLoader::new(),
            cached: true,
            _settings: PhantomData,
        }
    }

    /// Loads `S` with the given loader on every invocation.
    pub fn from_loader(loader: SettingsLoader) -> Self {
        Self {
            loader,
            cached: false,
            _settings: PhantomData,
        }
    }
}

#[async_trait]
impl<S, P, C> ResourceFactory<P, C> for ConfigFactory<S>
where
    S: DeserializeOwned + Send + Sync + 'static,
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    type Resource = Arc<S>;

    async fn acquire(&self, _invocation: &Invocation<P, C>) -> Result<Acquired<Arc<S>>, ResourceError> {
        let settings = if self.cached {
            self.loader.load_cached::<S>()?
        } else {
            Arc::new(self.loader.load::<S>()?)
        };
        Ok(Acquired::new(settings))
    }
}

/// Injects process-wide cached settings loaded from the environment.
pub fn with_config<S, H, Fut, P, C, D, T, E>(
    handler: H,
) -> impl Fn(Invocation<P, C>, D) -> BoxFuture<'static, Result<T, E>> + Send + Sync
where
    S: DeserializeOwned + Send + Sync + 'static,
    H: Fn(Invocation<P, C>, (Arc<S>, D)) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
    D: Send + 'static,
    E: From<ResourceError> + 'static,
    T: 'static,
{
    inject(ConfigFactory::<S>::cached(), handler)
}

/// Injects settings loaded by `loader` on every invocation.
pub fn with_config_from<S, H, Fut, P, C, D, T, E>(
    loader: SettingsLoader,
    handler: H,
) -> impl Fn(Invocation<P, C>, D) -> BoxFuture<'static, Result<T, E>> + Send + Sync
where
    S: DeserializeOwned + Send + Sync + 'static,
    H: Fn(Invocation<P, C>, (Arc<S>, D)) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
    D: Send + 'static,
    E: From<ResourceError> + 'static,
    T: 'static,
{
    inject(ConfigFactory::<S>::from_loader(loader), handler)
}
