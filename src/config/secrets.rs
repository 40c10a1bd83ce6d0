//! Secret lookup.
//!
//! A [`SecretStore`] resolves a secret name, optionally picking one key out
//! of a JSON secret. Stores are consumed by settings code, never by the
//! lifecycle core.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// Errors from a secret store.
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("access to secret '{0}' denied")]
    AccessDenied(String),

    #[error("secret backend error for '{name}': {message}")]
    Backend { name: String, message: String },
}

impl Classify for SecretError {
    fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            SecretError::NotFound(_) => Some(ErrorKind::Validation),
            SecretError::AccessDenied(_) => Some(ErrorKind::Permission),
            SecretError::Backend { .. } => None,
        }
    }
}

/// A source of secret values.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetches the raw secret string for `name`.
    async fn fetch(&self, name: &str, region: Option<&str>) -> Result<String, SecretError>;

    /// Fetches a secret, extracting `key` when the secret is a JSON object.
    ///
    /// An empty name yields an empty string without touching the backend.
    async fn get_secret(
        &self,
        name: &str,
        key: Option<&str>,
        region: Option<&str>,
    ) -> Result<String, SecretError> {
        if name.is_empty() {
            return Ok(String::new());
        }
        let raw = self.fetch(name, region).await?;
        Ok(extract_secret_key(&raw, key))
    }
}

/// Picks `key` out of a JSON secret.
///
/// Without a key, or when the secret is not JSON, the raw value is returned.
/// A JSON object without the key yields an empty string. Non-string values
/// are rendered as JSON.
pub fn extract_secret_key(raw: &str, key: Option<&str>) -> String {
    let Some(key) = key.filter(|_| !raw.is_empty()) else {
        return raw.to_string();
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => match map.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        },
        Ok(_) => String::new(),
        Err(_) => raw.to_string(),
    }
}

/// Resolves secrets from environment variables.
///
/// The secret name is upper-cased with every non-alphanumeric character
/// replaced by `_`, so `myapp/db-url` reads `MYAPP_DB_URL`. The region is
/// ignored.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: Option<String>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends `<PREFIX>_` to every variable name.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    /// The environment variable a secret name maps to.
    pub fn var_name(&self, name: &str) -> String {
        let base: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix.to_ascii_uppercase(), base),
            None => base,
        }
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(&self, name: &str, _region: Option<&str>) -> Result<String, SecretError> {
        let var = self.var_name(name);
        std::env::var(&var).map_err(|e| match e {
            std::env::VarError::NotPresent => SecretError::NotFound(name.to_string()),
            std::env::VarError::NotUnicode(_) => SecretError::Backend {
                name: name.to_string(),
                message: format!("{var} is not valid unicode"),
            },
        })
    }
}

/// An in-memory store, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn fetch(&self, name: &str, _region: Option<&str>) -> Result<String, SecretError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_secret_key() {
        let raw = r#"{"url": "postgres://db", "port": 5432}"#;
        assert_eq!(extract_secret_key(raw, Some("url")), "postgres://db");
        assert_eq!(extract_secret_key(raw, Some("port")), "5432");
        assert_eq!(extract_secret_key(raw, Some("missing")), "");
        assert_eq!(extract_secret_key(raw, None), raw);
        assert_eq!(extract_secret_key("plain-token", Some("url")), "plain-token");
    }

    #[test]
    fn test_env_var_name_mapping() {
        assert_eq!(EnvSecretStore::new().var_name("myapp/db-url"), "MYAPP_DB_URL");
        assert_eq!(
            EnvSecretStore::with_prefix("secret").var_name("api.key"),
            "SECRET_API_KEY"
        );
    }

    #[tokio::test]
    async fn test_static_store_lookup() {
        let store = StaticSecretStore::new()
            .with_secret("myapp/db", r#"{"url": "postgres://db"}"#)
            .with_secret("myapp/token", "abc123");

        assert_eq!(
            store.get_secret("myapp/db", Some("url"), None).await.unwrap(),
            "postgres://db"
        );
        assert_eq!(
            store.get_secret("myapp/token", None, Some("eu-west-1")).await.unwrap(),
            "abc123"
        );
        assert!(matches!(
            store.get_secret("nope", None, None).await,
            Err(SecretError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_name_is_empty_secret() {
        let store = StaticSecretStore::new();
        assert_eq!(store.get_secret("", Some("url"), None).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_env_store_reads_variable() {
        std::env::set_var("ALH_SECRET_TEST_DB_URL", "postgres://from-env");
        let store = EnvSecretStore::with_prefix("alh_secret_test");

        let value = store.get_secret("db-url", None, None).await.unwrap();
        assert_eq!(value, "postgres://from-env");

        let missing = store.get_secret("absent", None, None).await.unwrap_err();
        assert_eq!(missing.error_kind(), Some(ErrorKind::Validation));
    }
}
