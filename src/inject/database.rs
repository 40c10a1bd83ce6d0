//! Database session injection.
//!
//! The harness does not ship a database driver. A [`Connector`] opens
//! connections for whichever engine the application uses; this module adds
//! environment-driven configuration, a bounded process-wide
//! [`ConnectionPool`] and the [`DbSession`] handed to handlers.
//!
//! The pool keeps up to `pool_size` idle connections and allows
//! `max_overflow` extra ones that are closed on release. Idle connections
//! older than `pool_recycle` are closed instead of reused, and every reused
//! connection is pinged first.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{MappedMutexGuard, OnceCell, OwnedSemaphorePermit, Semaphore};

use super::{inject, Acquired, ResourceError, ResourceFactory};
use crate::error::{Classify, ErrorKind};
use crate::lifecycle::{CleanupHandler, Invocation};

const POOL_RESOURCE: &str = "database pool";
const CONNECTION_RESOURCE: &str = "database connection";

/// Errors reported by connectors and sessions.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("failed to connect to database")]
    Connect(#[source] Box<dyn Error + Send + Sync>),

    #[error("database session is closed")]
    Closed,

    #[error("query failed: {0}")]
    Query(String),
}

impl DatabaseError {
    pub fn connect(source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        DatabaseError::Connect(source.into())
    }
}

impl Classify for DatabaseError {
    fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            DatabaseError::Closed => Some(ErrorKind::Validation),
            DatabaseError::Connect(_) | DatabaseError::Query(_) => None,
        }
    }
}

/// Database settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// `DATABASE_URL`
    pub url: String,
    /// `DB_POOL_SIZE`
    pub pool_size: usize,
    /// `DB_MAX_OVERFLOW`
    pub max_overflow: usize,
    /// `DB_POOL_RECYCLE`, in seconds
    pub pool_recycle: Duration,
    /// `DB_ACQUIRE_TIMEOUT`, in seconds
    pub acquire_timeout: Duration,
    /// `DB_APPLICATION_NAME`
    pub application_name: String,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: 2,
            max_overflow: 3,
            pool_recycle: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(10),
            application_name: "async_lambda_harness".to_string(),
        }
    }

    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::MissingConfiguration`] when `DATABASE_URL` is
    /// unset or empty, and [`ResourceError::InvalidConfiguration`] when a
    /// numeric variable does not parse.
    pub fn from_env() -> Result<Self, ResourceError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ResourceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                ResourceError::MissingConfiguration(
                    "DATABASE_URL environment variable is required".to_string(),
                )
            })?;

        let mut config = Self::new(url);
        if let Some(size) = parse(&lookup, "DB_POOL_SIZE")? {
            config.pool_size = size;
        }
        if let Some(overflow) = parse(&lookup, "DB_MAX_OVERFLOW")? {
            config.max_overflow = overflow;
        }
        if let Some(secs) = parse(&lookup, "DB_POOL_RECYCLE")? {
            config.pool_recycle = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "DB_ACQUIRE_TIMEOUT")? {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(name) = lookup("DB_APPLICATION_NAME").filter(|n| !n.is_empty()) {
            config.application_name = name;
        }
        Ok(config)
    }

    /// Upper bound on concurrently open sessions.
    pub fn max_connections(&self) -> usize {
        self.pool_size + self.max_overflow
    }
}

fn parse<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ResourceError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ResourceError::InvalidConfiguration {
                name: name.to_string(),
                value,
            }),
    }
}

/// Opens connections for a concrete database engine.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self, config: &DatabaseConfig) -> Result<Self::Connection, DatabaseError>;

    /// Checks that a pooled connection is still usable.
    async fn ping(&self, _connection: &mut Self::Connection) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn close(&self, connection: Self::Connection) -> Result<(), DatabaseError> {
        drop(connection);
        Ok(())
    }
}

struct Pooled<T> {
    connection: T,
    opened: Instant,
}

struct Checkout<T> {
    pooled: Pooled<T>,
    _permit: OwnedSemaphorePermit,
}

/// A bounded pool of connections shared by every invocation in the process.
pub struct ConnectionPool<K: Connector> {
    connector: Arc<K>,
    config: DatabaseConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Pooled<K::Connection>>>,
}

impl<K: Connector> ConnectionPool<K> {
    pub fn new(connector: Arc<K>, config: DatabaseConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections()));
        Self {
            connector,
            config,
            permits,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Sessions that can still be opened without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    /// Opens a session, reusing an idle connection when one is healthy.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Exhausted`] if no slot frees up within
    /// `acquire_timeout`, or [`ResourceError::Acquisition`] if connecting
    /// fails.
    pub async fn checkout(self: &Arc<Self>) -> Result<DbSession<K>, ResourceError> {
        let waited = self.config.acquire_timeout;
        let permit = match tokio::time::timeout(waited, Arc::clone(&self.permits).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(closed)) => return Err(ResourceError::acquisition(POOL_RESOURCE, closed)),
            Err(_) => {
                tracing::warn!(
                    max_connections = self.config.max_connections(),
                    "database pool exhausted"
                );
                return Err(ResourceError::Exhausted {
                    resource: POOL_RESOURCE.to_string(),
                    waited,
                });
            }
        };

        let pooled = match self.reuse_idle().await {
            Some(pooled) => pooled,
            None => {
                let connection = self
                    .connector
                    .connect(&self.config)
                    .await
                    .map_err(|e| ResourceError::acquisition(CONNECTION_RESOURCE, e))?;
                tracing::debug!(application = %self.config.application_name, "opened database connection");
                Pooled {
                    connection,
                    opened: Instant::now(),
                }
            }
        };

        Ok(DbSession {
            inner: Arc::new(SessionInner {
                pool: Arc::clone(self),
                slot: tokio::sync::Mutex::new(Some(Checkout {
                    pooled,
                    _permit: permit,
                })),
            }),
        })
    }

    /// Closes every idle connection.
    pub async fn dispose(&self) {
        let idle = std::mem::take(&mut *self.idle());
        for pooled in idle {
            self.close_quietly(pooled.connection).await;
        }
    }

    async fn reuse_idle(&self) -> Option<Pooled<K::Connection>> {
        loop {
            let mut pooled = self.idle().pop()?;
            if pooled.opened.elapsed() >= self.config.pool_recycle {
                self.close_quietly(pooled.connection).await;
                continue;
            }
            match self.connector.ping(&mut pooled.connection).await {
                Ok(()) => return Some(pooled),
                Err(e) => {
                    tracing::debug!(error = %e, "discarding stale database connection");
                    self.close_quietly(pooled.connection).await;
                }
            }
        }
    }

    async fn release(&self, checkout: Checkout<K::Connection>) -> Result<(), DatabaseError> {
        let Checkout { pooled, _permit } = checkout;
        let keep = pooled.opened.elapsed() < self.config.pool_recycle;
        {
            let mut idle = self.idle();
            if keep && idle.len() < self.config.pool_size {
                idle.push(pooled);
                return Ok(());
            }
        }
        self.connector.close(pooled.connection).await
    }

    async fn close_quietly(&self, connection: K::Connection) {
        if let Err(e) = self.connector.close(connection).await {
            tracing::warn!(error = %e, "failed to close database connection");
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Pooled<K::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Connector> fmt::Debug for ConnectionPool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_connections", &self.config.max_connections())
            .field("available", &self.available())
            .field("idle", &self.idle_count())
            .finish()
    }
}

struct SessionInner<K: Connector> {
    pool: Arc<ConnectionPool<K>>,
    slot: tokio::sync::Mutex<Option<Checkout<K::Connection>>>,
}

/// A checked-out connection.
///
/// Clones share the same connection. Closing returns it to the pool; the
/// injection decorator registers that close as the invocation's release.
pub struct DbSession<K: Connector> {
    inner: Arc<SessionInner<K>>,
}

impl<K: Connector> Clone for DbSession<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Connector> DbSession<K> {
    /// Locks the underlying connection for use.
    pub async fn connection(&self) -> Result<MappedMutexGuard<'_, K::Connection>, DatabaseError> {
        let guard = self.inner.slot.lock().await;
        tokio::sync::MutexGuard::try_map(guard, |slot| {
            slot.as_mut().map(|checkout| &mut checkout.pooled.connection)
        })
        .map_err(|_| DatabaseError::Closed)
    }

    /// Returns the connection to the pool. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), DatabaseError> {
        let checkout = self.inner.slot.lock().await.take();
        match checkout {
            Some(checkout) => self.inner.pool.release(checkout).await,
            None => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.slot.lock().await.is_none()
    }

    fn release_handler(&self) -> CleanupHandler {
        let session = self.clone();
        CleanupHandler::future("database session", move || async move {
            session.close().await.map_err(Into::into)
        })
    }
}

impl<K: Connector> fmt::Debug for DbSession<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSession").finish_non_exhaustive()
    }
}

/// Hands each invocation a [`DbSession`] from a lazily created pool.
///
/// The pool, and the configuration it is built from, are created on the
/// first acquisition. Clones share the pool.
pub struct DatabaseFactory<K: Connector> {
    connector: Arc<K>,
    config: Option<DatabaseConfig>,
    pool: Arc<OnceCell<Arc<ConnectionPool<K>>>>,
}

impl<K: Connector> Clone for DatabaseFactory<K> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<K: Connector> DatabaseFactory<K> {
    /// A factory configured from the environment on first use.
    pub fn new(connector: K) -> Self {
        Self {
            connector: Arc::new(connector),
            config: None,
            pool: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_config(connector: K, config: DatabaseConfig) -> Self {
        Self {
            config: Some(config),
            ..Self::new(connector)
        }
    }

    /// The shared pool, creating it on first use.
    pub async fn pool(&self) -> Result<&Arc<ConnectionPool<K>>, ResourceError> {
        self.pool
            .get_or_try_init(|| async {
                let config = match &self.config {
                    Some(config) => config.clone(),
                    None => DatabaseConfig::from_env()?,
                };
                tracing::info!(
                    pool_size = config.pool_size,
                    max_overflow = config.max_overflow,
                    "initialised database pool"
                );
                Ok::<_, ResourceError>(Arc::new(ConnectionPool::new(
                    Arc::clone(&self.connector),
                    config,
                )))
            })
            .await
    }

    pub async fn session(&self) -> Result<DbSession<K>, ResourceError> {
        self.pool().await?.checkout().await
    }

    /// Opens a session, pings its connection and returns it to the pool.
    pub async fn check_health(&self) -> Result<(), ResourceError> {
        let session = self.session().await?;
        let ping = {
            let mut connection = session
                .connection()
                .await
                .map_err(|e| ResourceError::acquisition(CONNECTION_RESOURCE, e))?;
            self.connector.ping(&mut connection).await
        };
        session
            .close()
            .await
            .map_err(|e| ResourceError::acquisition(CONNECTION_RESOURCE, e))?;
        ping.map_err(|e| ResourceError::acquisition(CONNECTION_RESOURCE, e))
    }
}

#[async_trait]
impl<K, P, C> ResourceFactory<P, C> for DatabaseFactory<K>
where
    K: Connector,
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    type Resource = DbSession<K>;

    async fn acquire(&self, _invocation: &Invocation<P, C>) -> Result<Acquired<DbSession<K>>, ResourceError> {
        let session = self.session().await?;
        let release = session.release_handler();
        Ok(Acquired::with_release(session, release))
    }
}

/// Verifies that the database behind `factory` answers.
pub async fn check_health<K: Connector>(factory: &DatabaseFactory<K>) -> Result<(), ResourceError> {
    factory.check_health().await
}

/// Injects a [`DbSession`] using a pool configured from the environment.
pub fn with_database<K, H, Fut, P, C, D, T, E>(
    connector: K,
    handler: H,
) -> impl Fn(Invocation<P, C>, D) -> BoxFuture<'static, Result<T, E>> + Send + Sync
where
    K: Connector,
    H: Fn(Invocation<P, C>, (DbSession<K>, D)) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
    D: Send + 'static,
    E: From<ResourceError> + 'static,
    T: 'static,
{
    inject(DatabaseFactory::new(connector), handler)
}

/// Injects a [`DbSession`] from an existing factory, sharing its pool.
pub fn with_database_from<K, H, Fut, P, C, D, T, E>(
    factory: DatabaseFactory<K>,
    handler: H,
) -> impl Fn(Invocation<P, C>, D) -> BoxFuture<'static, Result<T, E>> + Send + Sync
where
    K: Connector,
    H: Fn(Invocation<P, C>, (DbSession<K>, D)) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
    D: Send + 'static,
    E: From<ResourceError> + 'static,
    T: 'static,
{
    inject(factory, handler)
}
