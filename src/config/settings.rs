//! Typed application settings from the environment.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use ::config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;

use super::ConfigError;

type SettingsCache = Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

static CACHE: OnceLock<SettingsCache> = OnceLock::new();

/// Deserialises a settings type from environment variables.
///
/// Variable names are matched case-insensitively against field names, so
/// `DATABASE_URL` fills `database_url`. With a prefix set, only variables
/// starting with `<PREFIX>_` are read and the prefix is stripped. `__`
/// separates nested keys. Unknown variables are ignored.
///
/// ```
/// use async_lambda_harness::config::SettingsLoader;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct AppSettings {
///     stage: String,
///     #[serde(default)]
///     debug: bool,
/// }
///
/// let settings: AppSettings = SettingsLoader::new()
///     .with_vars([("STAGE", "prod")])
///     .load()?;
/// assert_eq!(settings.stage, "prod");
/// # Ok::<(), async_lambda_harness::config::ConfigError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct SettingsLoader {
    prefix: Option<String>,
    file: Option<PathBuf>,
    vars: Option<HashMap<String, String>>,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only read variables starting with `<prefix>_`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Read a TOML file first; the environment still overrides it.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use these variables instead of the process environment.
    pub fn with_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.vars = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Loads a settings instance.
    pub fn load<S: DeserializeOwned>(&self) -> Result<S, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = &self.file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml));
        }

        let env = match &self.prefix {
            Some(prefix) => Environment::with_prefix(prefix).prefix_separator("_"),
            None => Environment::default(),
        };
        let config = builder
            .add_source(
                env.separator("__")
                    .try_parsing(true)
                    .source(self.vars.clone()),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Loads `S` from the process environment once and reuses it afterwards.
    ///
    /// A failed load is not cached, so a later call retries.
    pub fn cached<S>() -> Result<Arc<S>, ConfigError>
    where
        S: DeserializeOwned + Send + Sync + 'static,
    {
        Self::new().load_cached()
    }

    /// Like [`SettingsLoader::cached`], with this loader's sources.
    ///
    /// The cache is keyed by type only: the first successful load of `S`
    /// wins regardless of which loader performed it.
    pub fn load_cached<S>(&self) -> Result<Arc<S>, ConfigError>
    where
        S: DeserializeOwned + Send + Sync + 'static,
    {
        let cache = CACHE.get_or_init(Default::default);
        let key = TypeId::of::<S>();

        if let Some(hit) = lock(cache).get(&key).cloned() {
            if let Ok(settings) = hit.downcast::<S>() {
                return Ok(settings);
            }
        }

        let settings = Arc::new(self.load::<S>()?);
        let entry = Arc::clone(
            lock(cache)
                .entry(key)
                .or_insert_with(|| settings.clone() as Arc<dyn Any + Send + Sync>),
        );
        Ok(entry.downcast::<S>().unwrap_or(settings))
    }

    /// Drops every cached settings instance.
    pub fn clear_cache() {
        if let Some(cache) = CACHE.get() {
            lock(cache).clear();
        }
    }
}

fn lock(cache: &SettingsCache) -> std::sync::MutexGuard<'_, HashMap<TypeId, Arc<dyn Any + Send + Sync>>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}
