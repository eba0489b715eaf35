//! The `core` built-in SDK.
//!
//! Data shaping and utility actions that need no external service:
//!
//! - `core.set` — pass a value into the step's output variable.
//! - `core.transform` — map/filter/pluck over arrays with a bare
//!   expression evaluated per item.
//! - `core.format` — template rendering, base64, JSON conversions.
//! - `core.crypto` — digests, HMACs, UUIDs, random bytes.
//! - `core.array` / `core.object` — structural helpers.
//! - `core.log` — emit a tracing event from the workflow.
//! - `core.wait` — cancellation-aware sleep.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flowdeck_core::{EngineError, Result, ToolClient, VariableScope};
use ring::{digest, hmac, rand::SecureRandom};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

/// The `core` SDK client.
#[derive(Debug, Default)]
pub struct CoreClient;

impl CoreClient {
    /// Create the client.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolClient for CoreClient {
    async fn call_action(&self, path: &str, inputs: Value) -> Result<Value> {
        match path {
            "set" => set(inputs),
            "transform" => transform(inputs),
            "format" => format_action(inputs),
            "crypto" => crypto(inputs),
            "array" => array(inputs),
            "object" => object(inputs),
            "log" => log(inputs),
            "wait" => wait(inputs).await,
            other => Err(EngineError::invalid_config(format!(
                "core has no action `{other}`"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn as_object(inputs: &Value, action: &str) -> Result<Map<String, Value>> {
    inputs
        .as_object()
        .cloned()
        .ok_or_else(|| EngineError::invalid_config(format!("{action} expects an input map")))
}

fn require<'a>(map: &'a Map<String, Value>, field: &str, action: &str) -> Result<&'a Value> {
    map.get(field).ok_or_else(|| {
        EngineError::invalid_config(format!("{action} requires input `{field}`"))
    })
}

fn require_str<'a>(map: &'a Map<String, Value>, field: &str, action: &str) -> Result<&'a str> {
    require(map, field, action)?.as_str().ok_or_else(|| {
        EngineError::invalid_config(format!("{action} input `{field}` must be a string"))
    })
}

fn require_array<'a>(
    map: &'a Map<String, Value>,
    field: &str,
    action: &str,
) -> Result<&'a Vec<Value>> {
    require(map, field, action)?.as_array().ok_or_else(|| {
        EngineError::invalid_config(format!("{action} input `{field}` must be an array"))
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A single-entry map passes its value through; a multi-entry map passes
/// whole.  This is what lets `core.set { x: 10 } → x` bind `x = 10`.
fn set(inputs: Value) -> Result<Value> {
    let map = as_object(&inputs, "core.set")?;
    if map.len() == 1 {
        Ok(map.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null))
    } else {
        Ok(Value::Object(map))
    }
}

fn transform(inputs: Value) -> Result<Value> {
    let map = as_object(&inputs, "core.transform")?;
    let items = require_array(&map, "items", "core.transform")?;
    let operation = require_str(&map, "operation", "core.transform")?;

    match operation {
        "map" | "filter" => {
            let expression = require_str(&map, "expression", "core.transform")?;
            let mut out = Vec::new();
            for (index, item) in items.iter().enumerate() {
                let mut scope = VariableScope::new();
                scope.set("item", item.clone());
                // Both index spellings are live, like the document fields.
                scope.set("itemIndex", json!(index));
                scope.set("item_index", json!(index));
                let value = flowdeck_expr::evaluate(expression, &scope)?;
                if operation == "map" {
                    out.push(value);
                } else if flowdeck_expr::is_truthy(&value) {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }
        "pluck" => {
            let key = require_str(&map, "key", "core.transform")?;
            Ok(Value::Array(
                items
                    .iter()
                    .map(|item| item.get(key).cloned().unwrap_or(Value::Null))
                    .collect(),
            ))
        }
        other => Err(EngineError::invalid_config(format!(
            "core.transform has no operation `{other}`"
        ))),
    }
}

fn format_action(inputs: Value) -> Result<Value> {
    let map = as_object(&inputs, "core.format")?;
    let mode = map
        .get("mode")
        .and_then(Value::as_str)
        .unwrap_or("template");

    match mode {
        "template" => {
            let template = require_str(&map, "template", "core.format")?;
            let values = map
                .get("values")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let scope = VariableScope::from_root(values);
            flowdeck_expr::resolve_template(template, &scope)
        }
        "base64_encode" => {
            let value = require_str(&map, "value", "core.format")?;
            Ok(Value::String(BASE64.encode(value.as_bytes())))
        }
        "base64_decode" => {
            let value = require_str(&map, "value", "core.format")?;
            let bytes = BASE64.decode(value).map_err(|e| {
                EngineError::invalid_config(format!("invalid base64: {e}"))
            })?;
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|e| EngineError::invalid_config(format!("decoded bytes are not UTF-8: {e}")))
        }
        "json_parse" => {
            let value = require_str(&map, "value", "core.format")?;
            serde_json::from_str(value)
                .map_err(|e| EngineError::invalid_config(format!("invalid JSON: {e}")))
        }
        "json_stringify" => {
            let value = require(&map, "value", "core.format")?;
            Ok(Value::String(value.to_string()))
        }
        other => Err(EngineError::invalid_config(format!(
            "core.format has no mode `{other}`"
        ))),
    }
}

fn crypto(inputs: Value) -> Result<Value> {
    let map = as_object(&inputs, "core.crypto")?;
    let op = require_str(&map, "op", "core.crypto")?;

    match op {
        "sha256" => {
            let value = require_str(&map, "value", "core.crypto")?;
            let hash = digest::digest(&digest::SHA256, value.as_bytes());
            Ok(Value::String(hex(hash.as_ref())))
        }
        "hmac_sha256" => {
            let key = require_str(&map, "key", "core.crypto")?;
            let value = require_str(&map, "value", "core.crypto")?;
            let key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
            let tag = hmac::sign(&key, value.as_bytes());
            Ok(Value::String(hex(tag.as_ref())))
        }
        "uuid" => Ok(Value::String(uuid::Uuid::now_v7().to_string())),
        "random" => {
            let len = map
                .get("bytes")
                .and_then(Value::as_u64)
                .unwrap_or(16)
                .min(1_024) as usize;
            let mut buf = vec![0u8; len];
            ring::rand::SystemRandom::new()
                .fill(&mut buf)
                .map_err(|_| EngineError::internal("system rng failed"))?;
            Ok(Value::String(hex(&buf)))
        }
        other => Err(EngineError::invalid_config(format!(
            "core.crypto has no op `{other}`"
        ))),
    }
}

fn array(inputs: Value) -> Result<Value> {
    let map = as_object(&inputs, "core.array")?;
    let op = require_str(&map, "op", "core.array")?;
    let items = require_array(&map, "items", "core.array")?;

    match op {
        "concat" => {
            let mut out = Vec::new();
            for part in items {
                match part {
                    Value::Array(inner) => out.extend(inner.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::Array(out))
        }
        "flatten" => Ok(Value::Array(
            items
                .iter()
                .flat_map(|v| match v {
                    Value::Array(inner) => inner.clone(),
                    other => vec![other.clone()],
                })
                .collect(),
        )),
        "unique" => {
            let mut out: Vec<Value> = Vec::new();
            for item in items {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }
        "reverse" => {
            let mut out = items.clone();
            out.reverse();
            Ok(Value::Array(out))
        }
        "sort" => {
            let key = map.get("key").and_then(Value::as_str);
            let mut out = items.clone();
            out.sort_by(|a, b| {
                let (a, b) = match key {
                    Some(key) => (
                        a.get(key).cloned().unwrap_or(Value::Null),
                        b.get(key).cloned().unwrap_or(Value::Null),
                    ),
                    None => (a.clone(), b.clone()),
                };
                compare_for_sort(&a, &b)
            });
            Ok(Value::Array(out))
        }
        "slice" => {
            let start = map.get("start").and_then(Value::as_u64).unwrap_or(0) as usize;
            let end = map
                .get("end")
                .and_then(Value::as_u64)
                .map(|e| e as usize)
                .unwrap_or(items.len())
                .min(items.len());
            if start >= end {
                return Ok(Value::Array(Vec::new()));
            }
            Ok(Value::Array(items[start..end].to_vec()))
        }
        other => Err(EngineError::invalid_config(format!(
            "core.array has no op `{other}`"
        ))),
    }
}

fn compare_for_sort(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

fn object(inputs: Value) -> Result<Value> {
    let map = as_object(&inputs, "core.object")?;
    let op = require_str(&map, "op", "core.object")?;

    match op {
        "keys" | "values" => {
            let value = require(&map, "value", "core.object")?;
            let obj = value.as_object().ok_or_else(|| {
                EngineError::invalid_config("core.object input `value` must be an object")
            })?;
            if op == "keys" {
                Ok(Value::Array(
                    obj.keys().map(|k| Value::String(k.clone())).collect(),
                ))
            } else {
                Ok(Value::Array(obj.values().cloned().collect()))
            }
        }
        "merge" => {
            let objects = require_array(&map, "objects", "core.object")?;
            let mut merged = Map::new();
            for item in objects {
                let obj = item.as_object().ok_or_else(|| {
                    EngineError::invalid_config("core.object merge expects objects")
                })?;
                for (k, v) in obj {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Ok(Value::Object(merged))
        }
        "pick" | "omit" => {
            let value = require(&map, "value", "core.object")?;
            let obj = value.as_object().ok_or_else(|| {
                EngineError::invalid_config("core.object input `value` must be an object")
            })?;
            let keys: Vec<&str> = require_array(&map, "keys", "core.object")?
                .iter()
                .filter_map(Value::as_str)
                .collect();

            let out: Map<String, Value> = obj
                .iter()
                .filter(|(k, _)| {
                    let listed = keys.contains(&k.as_str());
                    if op == "pick" { listed } else { !listed }
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(Value::Object(out))
        }
        other => Err(EngineError::invalid_config(format!(
            "core.object has no op `{other}`"
        ))),
    }
}

fn log(inputs: Value) -> Result<Value> {
    let map = as_object(&inputs, "core.log")?;
    let message = require_str(&map, "message", "core.log")?;
    let level = map.get("level").and_then(Value::as_str).unwrap_or("info");

    match level {
        "debug" => debug!(target: "workflow", "{message}"),
        "warn" => warn!(target: "workflow", "{message}"),
        "error" => error!(target: "workflow", "{message}"),
        _ => info!(target: "workflow", "{message}"),
    }
    Ok(Value::Null)
}

async fn wait(inputs: Value) -> Result<Value> {
    let map = as_object(&inputs, "core.wait")?;
    let ms = require(&map, "ms", "core.wait")?.as_u64().ok_or_else(|| {
        EngineError::invalid_config("core.wait input `ms` must be a non-negative integer")
    })?;

    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    Ok(json!({ "waited_ms": ms }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn call(path: &str, inputs: Value) -> Result<Value> {
        CoreClient::new().call_action(path, inputs).await
    }

    #[tokio::test]
    async fn set_unwraps_single_entry() {
        assert_eq!(call("set", json!({ "x": 10 })).await.unwrap(), json!(10));
        assert_eq!(
            call("set", json!({ "a": 1, "b": 2 })).await.unwrap(),
            json!({ "a": 1, "b": 2 })
        );
    }

    #[tokio::test]
    async fn transform_map_and_filter() {
        let mapped = call(
            "transform",
            json!({ "items": [1, 2, 3], "operation": "map", "expression": "item * item" }),
        )
        .await
        .unwrap();
        assert_eq!(mapped, json!([1, 4, 9]));

        let filtered = call(
            "transform",
            json!({ "items": [1, 2, 3, 4], "operation": "filter", "expression": "item % 2 == 0" }),
        )
        .await
        .unwrap();
        assert_eq!(filtered, json!([2, 4]));
    }

    #[tokio::test]
    async fn transform_binds_index_under_both_spellings() {
        let via_camel = call(
            "transform",
            json!({ "items": [10, 20], "operation": "map", "expression": "itemIndex" }),
        )
        .await
        .unwrap();
        assert_eq!(via_camel, json!([0, 1]));

        let via_snake = call(
            "transform",
            json!({ "items": [10, 20], "operation": "map", "expression": "item_index" }),
        )
        .await
        .unwrap();
        assert_eq!(via_snake, json!([0, 1]));
    }

    #[tokio::test]
    async fn transform_pluck() {
        let plucked = call(
            "transform",
            json!({
                "items": [{ "id": 1, "name": "a" }, { "id": 2, "name": "b" }],
                "operation": "pluck",
                "key": "name"
            }),
        )
        .await
        .unwrap();
        assert_eq!(plucked, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn format_template_uses_values() {
        let out = call(
            "format",
            json!({ "template": "hi {{ name }}", "values": { "name": "ada" } }),
        )
        .await
        .unwrap();
        assert_eq!(out, json!("hi ada"));
    }

    #[tokio::test]
    async fn format_base64_roundtrip() {
        let encoded = call(
            "format",
            json!({ "mode": "base64_encode", "value": "flowdeck" }),
        )
        .await
        .unwrap();
        let decoded = call(
            "format",
            json!({ "mode": "base64_decode", "value": encoded }),
        )
        .await
        .unwrap();
        assert_eq!(decoded, json!("flowdeck"));
    }

    #[tokio::test]
    async fn crypto_sha256_known_vector() {
        let out = call("crypto", json!({ "op": "sha256", "value": "abc" }))
            .await
            .unwrap();
        assert_eq!(
            out,
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[tokio::test]
    async fn crypto_uuid_and_random() {
        let id = call("crypto", json!({ "op": "uuid" })).await.unwrap();
        assert_eq!(id.as_str().unwrap().len(), 36);

        let bytes = call("crypto", json!({ "op": "random", "bytes": 8 }))
            .await
            .unwrap();
        assert_eq!(bytes.as_str().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn array_operations() {
        assert_eq!(
            call("array", json!({ "op": "concat", "items": [[1, 2], [3]] }))
                .await
                .unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            call("array", json!({ "op": "unique", "items": [1, 2, 2, 3, 1] }))
                .await
                .unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            call("array", json!({ "op": "sort", "items": [3, 1, 2] }))
                .await
                .unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            call(
                "array",
                json!({ "op": "sort", "items": [{ "n": 2 }, { "n": 1 }], "key": "n" })
            )
            .await
            .unwrap(),
            json!([{ "n": 1 }, { "n": 2 }])
        );
        assert_eq!(
            call("array", json!({ "op": "slice", "items": [1, 2, 3, 4], "start": 1, "end": 3 }))
                .await
                .unwrap(),
            json!([2, 3])
        );
    }

    #[tokio::test]
    async fn object_operations() {
        assert_eq!(
            call(
                "object",
                json!({ "op": "merge", "objects": [{ "a": 1 }, { "b": 2, "a": 3 }] })
            )
            .await
            .unwrap(),
            json!({ "a": 3, "b": 2 })
        );
        assert_eq!(
            call(
                "object",
                json!({ "op": "pick", "value": { "a": 1, "b": 2 }, "keys": ["a"] })
            )
            .await
            .unwrap(),
            json!({ "a": 1 })
        );
        assert_eq!(
            call(
                "object",
                json!({ "op": "omit", "value": { "a": 1, "b": 2 }, "keys": ["a"] })
            )
            .await
            .unwrap(),
            json!({ "b": 2 })
        );
    }

    #[tokio::test]
    async fn unknown_action_fails() {
        let err = call("nonexistent", json!({})).await.unwrap_err();
        assert_eq!(err.kind, flowdeck_core::ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn wait_sleeps_roughly_the_requested_time() {
        let start = std::time::Instant::now();
        call("wait", json!({ "ms": 30 })).await.unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(25));
    }
}
