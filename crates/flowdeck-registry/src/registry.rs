//! The SDK registry.
//!
//! Tracks every tool a workflow may call.  A tool is registered with its
//! declared [`ToolConfig`] and stays unloaded until the first dispatch:
//! loading resolves secret references in the auth map, normalizes the SDK
//! name through the alias map, builds the client via its registered
//! initializer (or the MCP connector when the config carries an
//! `mcp_url`), and wraps it in the reliability layer.  Built clients are
//! cached until [`SdkRegistry::clear`].

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use flowdeck_core::workflow::ToolConfig;
use flowdeck_core::{EngineError, Result, ToolClient};
use flowdeck_reliability::{
    CircuitBreakerRegistry, RateLimiterRegistry, ReliabilityConfig, ReliableClient, SchemaRegistry,
};
use flowdeck_vault::SecretManager;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::builtin::core::CoreClient;
use crate::builtin::event::{EventBridge, EventClient};
use crate::builtin::script::ScriptClient;
use crate::initializer::{Initializer, ResolvedToolConfig, default_aliases};

/// A registered tool: its config plus the lazily-built client.
struct SdkInstance {
    name: String,
    config: ToolConfig,
    client: OnceCell<Arc<dyn ToolClient>>,
}

/// Registry stats snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    /// Number of registered tools (built-ins included).
    pub registered: usize,
    /// Number of tools whose clients have been built.
    pub loaded: usize,
}

/// Process-wide catalog of tools, initializers, and the reliability stack.
pub struct SdkRegistry {
    instances: DashMap<String, Arc<SdkInstance>>,
    initializers: DashMap<String, Arc<dyn Initializer>>,
    aliases: DashMap<String, String>,
    secrets: SecretManager,
    circuits: CircuitBreakerRegistry,
    limiter: RateLimiterRegistry,
    schemas: SchemaRegistry,
    reliability: ReliabilityConfig,
}

impl SdkRegistry {
    /// Create a registry with default reliability settings and the
    /// built-in SDKs registered.
    pub fn new(secrets: SecretManager) -> Self {
        Self::with_reliability(secrets, ReliabilityConfig::default())
    }

    /// Create a registry with explicit reliability settings.
    pub fn with_reliability(secrets: SecretManager, reliability: ReliabilityConfig) -> Self {
        let registry = Self {
            instances: DashMap::new(),
            initializers: DashMap::new(),
            aliases: DashMap::new(),
            secrets,
            circuits: CircuitBreakerRegistry::new(),
            limiter: RateLimiterRegistry::new(),
            schemas: SchemaRegistry::new(),
            reliability,
        };

        for (from, to) in default_aliases() {
            registry.aliases.insert(from.to_string(), to.to_string());
        }

        registry.register_builtin("core", Arc::new(CoreClient::new()));
        registry.register_builtin("script", Arc::new(ScriptClient::new()));
        registry.register_builtin("event", Arc::new(EventClient::disconnected()));

        registry
    }

    /// The circuit registry shared with every wrapped client.
    pub fn circuits(&self) -> &CircuitBreakerRegistry {
        &self.circuits
    }

    /// The rate-limiter registry shared with every wrapped client.
    pub fn limiter(&self) -> &RateLimiterRegistry {
        &self.limiter
    }

    /// The input-schema registry consulted by the reliability wrapper.
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Attach the event-source manager, replacing the disconnected `event`
    /// built-in.
    pub fn attach_event_bridge(&self, bridge: Arc<dyn EventBridge>) {
        self.register_builtin("event", Arc::new(EventClient::new(bridge)));
    }

    fn register_builtin(&self, name: &str, client: Arc<dyn ToolClient>) {
        let cell = OnceCell::new();
        // A builtin's client exists from the start; set never fails on a
        // fresh cell.
        let _ = cell.set(client);
        self.instances.insert(
            name.to_string(),
            Arc::new(SdkInstance {
                name: name.to_string(),
                config: ToolConfig::new(name),
                client: cell,
            }),
        );
    }

    /// Register a tool from a workflow's `tools:` map.
    ///
    /// # Errors
    ///
    /// `PROVIDER_CONFLICT` when the name is already registered (including
    /// the built-in names).
    pub fn register_tool(&self, name: impl Into<String>, config: ToolConfig) -> Result<()> {
        let name = name.into();

        // `workflow` and `parallel` have no instances here (the engine
        // intercepts them), but their names are still reserved.
        if crate::builtin::RESERVED_PREFIXES.contains(&name.as_str())
            || self.instances.contains_key(&name)
        {
            return Err(EngineError::provider_conflict(format!(
                "tool `{name}` is already registered"
            )));
        }

        if let Some(initializer) = self.initializers.get(&self.resolve_alias(&config.sdk)) {
            let problems = initializer.validate(&config);
            if !problems.is_empty() {
                return Err(EngineError::invalid_config(format!(
                    "invalid config for tool `{name}`: {}",
                    problems.join("; ")
                )));
            }
        }

        info!(tool = %name, sdk = %config.sdk, "tool registered");
        self.instances.insert(
            name.clone(),
            Arc::new(SdkInstance {
                name,
                config,
                client: OnceCell::new(),
            }),
        );
        Ok(())
    }

    /// Register an initializer for an SDK.
    pub fn register_initializer(&self, initializer: Arc<dyn Initializer>) {
        debug!(sdk = initializer.name(), "initializer registered");
        self.initializers
            .insert(initializer.name().to_string(), initializer);
    }

    /// Add a package-name alias applied before initializer lookup.
    pub fn register_alias(&self, from: impl Into<String>, to: impl Into<String>) {
        self.aliases.insert(from.into(), to.into());
    }

    fn resolve_alias(&self, sdk: &str) -> String {
        self.aliases
            .get(sdk)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| sdk.to_string())
    }

    /// Dispatch an action string `"<tool>.<path…>"` with resolved inputs.
    ///
    /// `permissions`, when present, is consulted before anything else: a
    /// tool mapped to `false` fails with `AUTHORIZATION_FAILED`.
    pub async fn execute(
        &self,
        action: &str,
        inputs: Value,
        permissions: Option<&BTreeMap<String, bool>>,
    ) -> Result<Value> {
        let (tool_name, path) = action.split_once('.').ok_or_else(|| {
            EngineError::invalid_config(format!(
                "action `{action}` is not of the form `<tool>.<path>`"
            ))
        })?;

        if let Some(permissions) = permissions
            && permissions.get(tool_name) == Some(&false)
        {
            return Err(EngineError::authorization_failed(format!(
                "workflow permissions deny tool `{tool_name}`"
            ))
            .with_action(action));
        }

        let instance = self
            .instances
            .get(tool_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                EngineError::provider_not_found(format!("tool `{tool_name}` is not registered"))
                    .with_action(action)
            })?;

        let client = instance
            .client
            .get_or_try_init(|| self.build_client(&instance))
            .await?;

        client.call_action(path, inputs).await
    }

    /// Build the client for a registered tool: resolve secrets, find the
    /// initializer (or MCP endpoint), and wrap in the reliability layer.
    async fn build_client(&self, instance: &SdkInstance) -> Result<Arc<dyn ToolClient>> {
        let sdk = self.resolve_alias(&instance.config.sdk);
        debug!(tool = %instance.name, sdk = %sdk, "building tool client");

        let auth = self.secrets.resolve_auth(&instance.config.auth).await?;
        tracing::debug!(
            tool = %instance.name,
            auth = ?self.secrets.sanitize_auth_for_logging(&auth),
            "auth resolved"
        );

        let resolved = ResolvedToolConfig::new(&instance.config, sdk.clone(), auth);

        let inner: Arc<dyn ToolClient> =
            if let Some(initializer) = self.initializers.get(&sdk).map(|e| Arc::clone(e.value())) {
                initializer.initialize(&resolved).await?
            } else if let Some(mcp_url) = resolved.option_str("mcp_url") {
                Arc::new(crate::mcp::McpClient::connect(&instance.name, mcp_url, &resolved.auth).await?)
            } else {
                return Err(EngineError::provider_not_found(format!(
                    "no initializer registered for sdk `{sdk}` and tool `{}` has no mcp_url",
                    instance.name
                )));
            };

        Ok(Arc::new(ReliableClient::new(
            inner,
            instance.name.clone(),
            self.reliability.clone(),
            self.circuits.clone(),
            self.limiter.clone(),
            self.schemas.clone(),
        )))
    }

    /// Whether a tool is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    /// Snapshot of registration and load counts.
    pub fn stats(&self) -> RegistryStats {
        let loaded = self
            .instances
            .iter()
            .filter(|e| e.value().client.initialized())
            .count();
        RegistryStats {
            registered: self.instances.len(),
            loaded,
        }
    }

    /// Close every built client and drop all non-built-in registrations.
    pub async fn clear(&self) {
        let mut to_close = Vec::new();
        let mut to_remove = Vec::new();

        for entry in self.instances.iter() {
            let name = entry.key().clone();
            if crate::builtin::RESERVED_PREFIXES.contains(&name.as_str()) {
                continue;
            }
            if let Some(client) = entry.value().client.get() {
                to_close.push(Arc::clone(client));
            }
            to_remove.push(name);
        }

        for client in to_close {
            client.close().await;
        }
        for name in to_remove {
            self.instances.remove(&name);
        }

        info!("registry cleared");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
