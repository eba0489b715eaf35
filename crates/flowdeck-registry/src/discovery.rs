//! Integration discovery.
//!
//! Scans a local `integrations/` directory for `*.toml` manifests, each
//! declaring an HTTP-backed tool.  Files whose names start with `_` or
//! contain `.test.` are skipped.  A manifest looks like:
//!
//! ```toml
//! name = "weatherapi"
//! description = "Weather lookups"
//! base_url = "https://api.weather.example/v2/"
//! auth_style = "header:X-Api-Key"
//! ```
//!
//! Each discovered manifest registers an initializer that builds a
//! [`crate::http::GenericHttpClient`] for the declared endpoint.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use flowdeck_core::{EngineError, Result, ToolClient};
use flowdeck_reliability::RateLimiterRegistry;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::http::{AuthStyle, GenericHttpClient};
use crate::initializer::{Initializer, ResolvedToolConfig};

/// A parsed integration manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationManifest {
    /// SDK name workflows refer to.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Root endpoint for dotted action paths.
    pub base_url: String,
    /// How the `token` auth value is attached (default `bearer`).
    #[serde(default)]
    pub auth_style: Option<String>,
}

/// Load every manifest in a directory.
///
/// Missing directories yield an empty list.  Unparseable manifests are
/// logged and skipped rather than failing discovery.
pub fn load_manifests(dir: &Path) -> Result<Vec<IntegrationManifest>> {
    if !dir.exists() {
        debug!(path = %dir.display(), "integrations directory does not exist");
        return Ok(Vec::new());
    }

    let mut manifests = Vec::new();

    let entries = std::fs::read_dir(dir)
        .map_err(|e| EngineError::internal("failed to read integrations dir").with_source(e))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| EngineError::internal("failed to read dir entry").with_source(e))?;
        let path = entry.path();

        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with(".toml")
            || file_name.starts_with('_')
            || file_name.contains(".test.")
        {
            continue;
        }

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read manifest");
                continue;
            }
        };

        match toml::from_str::<IntegrationManifest>(&raw) {
            Ok(manifest) => {
                info!(
                    name = %manifest.name,
                    path = %path.display(),
                    "discovered integration"
                );
                manifests.push(manifest);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid integration manifest");
            }
        }
    }

    Ok(manifests)
}

/// Initializer backed by a discovered manifest.
pub struct ManifestInitializer {
    manifest: IntegrationManifest,
    limiter: Option<RateLimiterRegistry>,
}

impl ManifestInitializer {
    /// Wrap a manifest as an initializer.
    pub fn new(manifest: IntegrationManifest, limiter: Option<RateLimiterRegistry>) -> Self {
        Self { manifest, limiter }
    }
}

#[async_trait]
impl Initializer for ManifestInitializer {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> Option<&str> {
        self.manifest.description.as_deref()
    }

    async fn initialize(&self, config: &ResolvedToolConfig) -> Result<Arc<dyn ToolClient>> {
        let style = match &self.manifest.auth_style {
            Some(s) => AuthStyle::parse(s)?,
            None => AuthStyle::Bearer,
        };
        let token = config.auth.get("token").cloned();

        let client = GenericHttpClient::new(
            self.manifest.name.clone(),
            &self.manifest.base_url,
            style,
            token,
            self.limiter.clone(),
        )?;
        Ok(Arc::new(client))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn discovers_valid_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "weather.toml",
            r#"
name = "weatherapi"
description = "Weather lookups"
base_url = "https://api.weather.example/v2/"
auth_style = "header:X-Api-Key"
"#,
        );
        write(
            dir.path(),
            "issues.toml",
            r#"
name = "issuetracker"
base_url = "https://issues.example/api/"
"#,
        );

        let manifests = load_manifests(dir.path()).unwrap();
        assert_eq!(manifests.len(), 2);
    }

    #[test]
    fn skips_underscore_and_test_files() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "_draft.toml",
            "name = \"draft\"\nbase_url = \"https://x.example/\"\n",
        );
        write(
            dir.path(),
            "svc.test.toml",
            "name = \"t\"\nbase_url = \"https://x.example/\"\n",
        );
        write(dir.path(), "notes.md", "not a manifest");

        let manifests = load_manifests(dir.path()).unwrap();
        assert!(manifests.is_empty());
    }

    #[test]
    fn invalid_manifest_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken.toml", "this = is not = valid");
        write(
            dir.path(),
            "good.toml",
            "name = \"ok\"\nbase_url = \"https://x.example/\"\n",
        );

        let manifests = load_manifests(dir.path()).unwrap();
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].name, "ok");
    }

    #[test]
    fn missing_directory_is_empty() {
        let manifests = load_manifests(Path::new("/nonexistent/integrations")).unwrap();
        assert!(manifests.is_empty());
    }
}
