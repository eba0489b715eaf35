//! The `script` built-in SDK.
//!
//! `script.execute` evaluates an expression-language script against a
//! context map.  The engine injects the current variable scope as
//! `context` automatically, so scripts see the same variables the
//! surrounding steps do.  Statements are separated by `;`; the value of
//! the last statement is the result, and `name = expr` statements bind
//! intermediate variables.

use async_trait::async_trait;
use flowdeck_core::{EngineError, Result, ToolClient, VariableScope};
use serde_json::Value;

/// The `script` SDK client.
#[derive(Debug, Default)]
pub struct ScriptClient;

impl ScriptClient {
    /// Create the client.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolClient for ScriptClient {
    async fn call_action(&self, path: &str, inputs: Value) -> Result<Value> {
        if path != "execute" {
            return Err(EngineError::invalid_config(format!(
                "script has no action `{path}`"
            )));
        }

        let script = inputs
            .get("script")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::invalid_config("script.execute requires input `script`"))?;

        let context = inputs
            .get("context")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        run_script(script, context)
    }
}

/// Evaluate a `;`-separated script.  Assignment statements extend the
/// scope; the final statement's value is returned.
///
/// Context entries are visible both bare (`n`) and under the `context`
/// binding (`context.n`).
fn run_script(script: &str, context: serde_json::Map<String, Value>) -> Result<Value> {
    let mut scope = VariableScope::from_root(context.clone());
    scope.set("context", Value::Object(context));
    let mut last = Value::Null;

    for statement in script.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }

        if let Some((name, expr)) = split_assignment(statement) {
            let value = flowdeck_expr::evaluate(expr, &scope)?;
            scope.set(name, value.clone());
            last = value;
        } else {
            last = flowdeck_expr::evaluate(statement, &scope)?;
        }
    }

    Ok(last)
}

/// Split `name = expr` assignments, leaving `==`, `<=`, `>=`, `!=`, and
/// `=~` untouched.
fn split_assignment(statement: &str) -> Option<(&str, &str)> {
    let bytes = statement.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'=' {
            continue;
        }
        let prev = i.checked_sub(1).map(|p| bytes[p]);
        let next = bytes.get(i + 1);
        if matches!(prev, Some(b'=') | Some(b'!') | Some(b'<') | Some(b'>'))
            || matches!(next, Some(b'=') | Some(b'~'))
        {
            return None;
        }

        let name = statement[..i].trim();
        let expr = statement[i + 1..].trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_')
            || name.chars().next().is_some_and(|c| c.is_ascii_digit())
        {
            return None;
        }
        return Some((name, expr));
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
