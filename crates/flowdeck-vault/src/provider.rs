//! Secret providers.
//!
//! A provider turns a reference path (plus optional key selector) into a
//! secret value.  Providers are registered by name with the
//! [`crate::SecretManager`]; the built-in [`EnvProvider`] reads the
//! process environment.

use async_trait::async_trait;
use flowdeck_core::{EngineError, Result};

/// A pluggable secret backend.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// The name references use to select this provider.
    fn name(&self) -> &str;

    /// Fetch the secret at `path`.  `key` selects a field when the stored
    /// secret is structured.  Returns `Ok(None)` when the secret does not
    /// exist; the manager decides whether that is an error.
    async fn fetch(&self, path: &str, key: Option<&str>) -> Result<Option<String>>;
}

/// Reads secrets from the process environment.
///
/// The reference path is the variable name.  When a key selector is
/// present, the variable's value is parsed as JSON and the key is looked
/// up inside it (`secret:env://SERVICE_CREDS#api_key`).
#[derive(Debug, Default)]
pub struct EnvProvider;

impl EnvProvider {
    /// Create the provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn fetch(&self, path: &str, key: Option<&str>) -> Result<Option<String>> {
        let Ok(raw) = std::env::var(path) else {
            return Ok(None);
        };

        let Some(key) = key else {
            return Ok(Some(raw));
        };

        let parsed: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            EngineError::invalid_config(format!(
                "environment variable `{path}` is not JSON but reference uses key `{key}`"
            ))
            .with_source(e)
        })?;

        match parsed.get(key) {
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Ok(Some(other.to_string())),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_provider_reads_variable() {
        // Env mutations are process-global; use names unique to this test.
        unsafe { std::env::set_var("FLOWDECK_TEST_PLAIN", "s3cret") };
        let provider = EnvProvider::new();

        let value = provider.fetch("FLOWDECK_TEST_PLAIN", None).await.unwrap();
        assert_eq!(value.as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn env_provider_missing_is_none() {
        let provider = EnvProvider::new();
        let value = provider.fetch("FLOWDECK_TEST_ABSENT", None).await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn env_provider_key_selector() {
        unsafe {
            std::env::set_var(
                "FLOWDECK_TEST_JSON",
                r#"{ "api_key": "k-123", "other": 7 }"#,
            )
        };
        let provider = EnvProvider::new();

        let value = provider
            .fetch("FLOWDECK_TEST_JSON", Some("api_key"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("k-123"));

        let missing = provider
            .fetch("FLOWDECK_TEST_JSON", Some("nope"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn env_provider_key_on_non_json_fails() {
        unsafe { std::env::set_var("FLOWDECK_TEST_NOT_JSON", "plain") };
        let provider = EnvProvider::new();

        let err = provider
            .fetch("FLOWDECK_TEST_NOT_JSON", Some("k"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, flowdeck_core::ErrorKind::InvalidConfig);
    }
}
