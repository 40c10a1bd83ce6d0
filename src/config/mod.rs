//! Harness configuration.
//!
//! [`HarnessConfig`] is layered the usual way: built-in defaults, then an
//! optional TOML file, then `LAMBDA_HARNESS_*` environment variables.
//! Application settings go through [`SettingsLoader`], and secrets through a
//! [`SecretStore`].

pub mod secrets;
pub mod settings;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::lifecycle::{CleanupRegistry, ReleaseOrder};
use crate::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::retry::{delay_from_secs, PolicyError, RetryPolicy};

pub use secrets::{extract_secret_key, EnvSecretStore, SecretError, SecretStore, StaticSecretStore};
pub use settings::SettingsLoader;

/// Names the TOML file [`HarnessConfig::load`] reads.
pub const CONFIG_PATH_VAR: &str = "LAMBDA_HARNESS_CONFIG";

/// Prefix of environment overrides, e.g. `LAMBDA_HARNESS_MAX_RETRIES`.
pub const ENV_PREFIX: &str = "LAMBDA_HARNESS";

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid retry configuration: {0}")]
    Policy(#[from] PolicyError),
}

impl Classify for ConfigError {
    fn error_kind(&self) -> Option<ErrorKind> {
        Some(ErrorKind::Validation)
    }
}

/// Process-level harness settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub max_retries: u32,
    /// Base retry delay in seconds.
    pub retry_delay_secs: f64,
    pub max_retry_delay_secs: f64,
    pub unknown_max_retries: u32,
    pub release_order: ReleaseOrder,
    /// Whether SIGINT/SIGTERM drain the cleanup registry before exiting.
    pub install_signal_handlers: bool,
    pub signal_exit_code: i32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_format: LogFormat::Text,
            max_retries: 3,
            retry_delay_secs: 1.0,
            max_retry_delay_secs: 60.0,
            unknown_max_retries: 2,
            release_order: ReleaseOrder::Registration,
            install_signal_handlers: true,
            signal_exit_code: 0,
        }
    }
}

impl HarnessConfig {
    /// Loads defaults, the file named by `LAMBDA_HARNESS_CONFIG` (if set) and
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the named file does not exist, a value has the
    /// wrong type, or the retry settings are invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from);
        Self::build(file.as_deref(), None)
    }

    /// Loads a specific TOML file plus environment overrides.
    ///
    /// ```no_run
    /// use async_lambda_harness::config::HarnessConfig;
    ///
    /// let config = HarnessConfig::from_file("harness.toml")?;
    /// # Ok::<(), async_lambda_harness::config::ConfigError>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::build(Some(path.as_ref()), None)
    }

    /// Loads from an explicit set of `LAMBDA_HARNESS_*` variables instead of
    /// the process environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(None, Some(vars))
    }

    fn build(file: Option<&Path>, vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?;

        let harness: HarnessConfig = config.try_deserialize()?;
        harness.retry_policy()?;
        Ok(harness)
    }

    /// Builds the validated retry policy.
    pub fn retry_policy(&self) -> Result<RetryPolicy, PolicyError> {
        Ok(RetryPolicy::from_secs(self.max_retries, self.retry_delay_secs)?
            .with_max_delay(delay_from_secs(self.max_retry_delay_secs)?)?
            .with_unknown_max_retries(self.unknown_max_retries))
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::new()
            .with_level(self.log_level)
            .with_format(self.log_format)
    }

    /// A fresh registry releasing in the configured order.
    pub fn cleanup_registry(&self) -> Arc<CleanupRegistry> {
        Arc::new(CleanupRegistry::with_order(self.release_order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn toml_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::from_vars(HashMap::new()).unwrap();
        assert_eq!(config, HarnessConfig::default());

        let policy = config.retry_policy().unwrap();
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_env_overrides() {
        let config = HarnessConfig::from_vars(vars(&[
            ("LAMBDA_HARNESS_MAX_RETRIES", "5"),
            ("LAMBDA_HARNESS_RETRY_DELAY_SECS", "0.5"),
            ("LAMBDA_HARNESS_LOG_LEVEL", "debug"),
            ("LAMBDA_HARNESS_RELEASE_ORDER", "reverse"),
            ("LAMBDA_HARNESS_INSTALL_SIGNAL_HANDLERS", "false"),
        ]))
        .unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.release_order, ReleaseOrder::Reverse);
        assert!(!config.install_signal_handlers);
        assert_eq!(
            config.retry_policy().unwrap().retry_delay,
            Duration::from_millis(500)
        );
        assert_eq!(config.cleanup_registry().order(), ReleaseOrder::Reverse);
    }

    #[test]
    fn test_from_file() {
        let file = toml_file(
            r#"
max_retries = 1
log_format = "json"
signal_exit_code = 143
"#,
        );

        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.signal_exit_code, 143);
        assert_eq!(config.unknown_max_retries, 2);
    }

    #[test]
    fn test_missing_file() {
        let err = HarnessConfig::from_file("/nonexistent/harness.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
        assert_eq!(err.error_kind(), Some(ErrorKind::Validation));
    }

    #[test]
    fn test_invalid_retry_settings_rejected() {
        let err = HarnessConfig::from_vars(vars(&[("LAMBDA_HARNESS_RETRY_DELAY_SECS", "-2")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Policy(PolicyError::InvalidDelay(_))));

        let err = HarnessConfig::from_vars(vars(&[
            ("LAMBDA_HARNESS_RETRY_DELAY_SECS", "10"),
            ("LAMBDA_HARNESS_MAX_RETRY_DELAY_SECS", "5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Policy(PolicyError::DelayCapBelowBase { .. })));
    }

    #[test]
    fn test_wrong_type_is_load_error() {
        let err = HarnessConfig::from_vars(vars(&[("LAMBDA_HARNESS_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
