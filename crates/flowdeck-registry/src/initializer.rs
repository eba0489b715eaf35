//! Integration initializers.
//!
//! An initializer turns a resolved tool config into a live client.  They
//! are explicit: a tool whose SDK has no registered initializer (and no
//! MCP endpoint) fails at first dispatch rather than falling back to
//! structural guessing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use flowdeck_core::{Result, ToolClient, workflow::ToolConfig};
use serde_json::{Map, Value};

/// A tool config after secret resolution.
///
/// `auth` values are the literal resolved secrets; the rest of the config
/// is byte-identical to what the workflow declared.
#[derive(Debug, Clone)]
pub struct ResolvedToolConfig {
    /// The SDK identifier, after alias normalization.
    pub sdk: String,
    /// Resolved authentication material.
    pub auth: BTreeMap<String, String>,
    /// Free-form SDK options.
    pub options: Map<String, Value>,
}

impl ResolvedToolConfig {
    /// Build from the declared config and resolved auth map.
    pub fn new(config: &ToolConfig, sdk: String, auth: BTreeMap<String, String>) -> Self {
        Self {
            sdk,
            auth,
            options: config.options.clone(),
        }
    }

    /// Fetch a string option.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

/// Builds clients for one SDK.
#[async_trait]
pub trait Initializer: Send + Sync {
    /// The SDK identifier this initializer serves.
    fn name(&self) -> &str;

    /// Optional human-readable description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Validate a config before any client is built.  Returns a list of
    /// problems; an empty list means the config is acceptable.
    fn validate(&self, _config: &ToolConfig) -> Vec<String> {
        Vec::new()
    }

    /// Build a live client from a resolved config.
    async fn initialize(&self, config: &ResolvedToolConfig) -> Result<Arc<dyn ToolClient>>;
}

/// Package-name alias map applied before initializer lookup, so a workflow
/// can declare a familiar SDK name that maps onto the registered one
/// (e.g. `google-gmail` → `googleapis`).
pub fn default_aliases() -> Vec<(&'static str, &'static str)> {
    vec![
        ("google-gmail", "googleapis"),
        ("google-calendar", "googleapis"),
        ("google-sheets", "googleapis"),
        ("gh", "github"),
    ]
}
