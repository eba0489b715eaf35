//! Per-action input validation.
//!
//! Actions may register a JSON Schema for their inputs; the reliability
//! wrapper validates the input map against it before any tokens are spent
//! or network calls made.  Validation failures are `INVALID_CONFIG` and
//! never retried.

use std::sync::Arc;

use dashmap::DashMap;
use flowdeck_core::{EngineError, Result};
use jsonschema::Validator;
use serde_json::Value;

/// Registry of compiled input schemas keyed by full action path
/// (e.g. `slack.chat.postMessage`).
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: Arc<DashMap<String, Arc<Validator>>>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a schema for an action path.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_CONFIG` when the schema itself does not compile.
    pub fn register(&self, action: impl Into<String>, schema: &Value) -> Result<()> {
        let action = action.into();
        let validator = jsonschema::validator_for(schema).map_err(|e| {
            EngineError::invalid_config(format!("invalid schema for `{action}`: {e}"))
        })?;
        self.schemas.insert(action, Arc::new(validator));
        Ok(())
    }

    /// Validate inputs against the schema registered for `action`.
    ///
    /// Actions without a registered schema pass unconditionally.
    pub fn validate(&self, action: &str, inputs: &Value) -> Result<()> {
        let Some(validator) = self.schemas.get(action).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };

        let mut errors = validator.iter_errors(inputs);
        if let Some(first) = errors.next() {
            return Err(EngineError::invalid_config(format!(
                "input validation failed for `{action}`: {first}"
            ))
            .with_action(action));
        }
        Ok(())
    }

    /// Whether a schema is registered for the action.
    pub fn has_schema(&self, action: &str) -> bool {
        self.schemas.contains_key(action)
    }

    /// Drop every registered schema.
    pub fn clear(&self) {
        self.schemas.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
