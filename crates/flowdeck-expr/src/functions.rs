//! Built-in expression functions.
//!
//! Every function receives its arguments already evaluated.  `isset` and
//! `default` are special forms handled by the evaluator and never reach
//! this table.

use chrono::Utc;
use flowdeck_core::{EngineError, Result};
use serde_json::Value;

use crate::eval::{make_number, stringify, type_name};

/// Dispatch a built-in function call.
pub fn call(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "length" | "size" => length(args),
        "upper" => map_string(name, args, |s| s.to_uppercase()),
        "lower" => map_string(name, args, |s| s.to_lowercase()),
        "trim" => map_string(name, args, |s| s.trim().to_string()),
        "starts_with" => string_pair(name, args, |s, p| Value::Bool(s.starts_with(p))),
        "ends_with" => string_pair(name, args, |s, p| Value::Bool(s.ends_with(p))),
        "contains" => contains(args),
        "split" => string_pair(name, args, |s, sep| {
            Value::Array(s.split(sep).map(|p| Value::String(p.to_string())).collect())
        }),
        "join" => join(args),
        "replace" => replace(args),
        "round" => map_number(name, args, f64::round),
        "floor" => map_number(name, args, f64::floor),
        "ceil" => map_number(name, args, f64::ceil),
        "abs" => map_number(name, args, f64::abs),
        "min" => fold_numbers(name, args, f64::min),
        "max" => fold_numbers(name, args, f64::max),
        "now" => Ok(Value::String(Utc::now().to_rfc3339())),
        "timestamp" => Ok(make_number(Utc::now().timestamp_millis() as f64)),
        "keys" => keys(args),
        "values" => values(args),
        "first" => first_last(name, args, true),
        "last" => first_last(name, args, false),
        "json" => {
            let [value] = expect_args::<1>(name, args)?;
            Ok(Value::String(value.to_string()))
        }
        "string" => {
            let [value] = expect_args::<1>(name, args)?;
            Ok(Value::String(stringify(value)))
        }
        "number" => number(args),
        other => Err(EngineError::expression(format!(
            "unknown function `{other}`"
        ))),
    }
}

fn expect_args<'a, const N: usize>(name: &str, args: &'a [Value]) -> Result<[&'a Value; N]> {
    if args.len() != N {
        return Err(EngineError::expression(format!(
            "{name} expects {N} argument(s), got {}",
            args.len()
        )));
    }
    let mut out = [&Value::Null; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg;
    }
    Ok(out)
}

fn length(args: &[Value]) -> Result<Value> {
    let [value] = expect_args::<1>("length", args)?;
    let n = match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(EngineError::expression(format!(
                "length expects a string, array, or object, got {}",
                type_name(other)
            )));
        }
    };
    Ok(make_number(n as f64))
}

fn map_string(name: &str, args: &[Value], f: impl Fn(&str) -> String) -> Result<Value> {
    let [value] = expect_args::<1>(name, args)?;
    match value {
        Value::String(s) => Ok(Value::String(f(s))),
        other => Err(EngineError::expression(format!(
            "{name} expects a string, got {}",
            type_name(other)
        ))),
    }
}

fn string_pair(name: &str, args: &[Value], f: impl Fn(&str, &str) -> Value) -> Result<Value> {
    let [a, b] = expect_args::<2>(name, args)?;
    match (a, b) {
        (Value::String(a), Value::String(b)) => Ok(f(a, b)),
        _ => Err(EngineError::expression(format!(
            "{name} expects two strings, got {} and {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

fn contains(args: &[Value]) -> Result<Value> {
    let [haystack, needle] = expect_args::<2>("contains", args)?;
    let found = match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            other => {
                return Err(EngineError::expression(format!(
                    "contains on a string expects a string needle, got {}",
                    type_name(other)
                )));
            }
        },
        Value::Array(items) => items.contains(needle),
        other => {
            return Err(EngineError::expression(format!(
                "contains expects a string or array, got {}",
                type_name(other)
            )));
        }
    };
    Ok(Value::Bool(found))
}

fn join(args: &[Value]) -> Result<Value> {
    let [items, sep] = expect_args::<2>("join", args)?;
    match (items, sep) {
        (Value::Array(items), Value::String(sep)) => {
            let parts: Vec<String> = items.iter().map(stringify).collect();
            Ok(Value::String(parts.join(sep)))
        }
        _ => Err(EngineError::expression(
            "join expects an array and a separator string",
        )),
    }
}

fn replace(args: &[Value]) -> Result<Value> {
    let [s, from, to] = expect_args::<3>("replace", args)?;
    match (s, from, to) {
        (Value::String(s), Value::String(from), Value::String(to)) => {
            Ok(Value::String(s.replace(from.as_str(), to)))
        }
        _ => Err(EngineError::expression("replace expects three strings")),
    }
}

fn map_number(name: &str, args: &[Value], f: impl Fn(f64) -> f64) -> Result<Value> {
    let [value] = expect_args::<1>(name, args)?;
    match value {
        Value::Number(n) => {
            let n = n
                .as_f64()
                .ok_or_else(|| EngineError::expression(format!("non-finite number in {name}")))?;
            Ok(make_number(f(n)))
        }
        other => Err(EngineError::expression(format!(
            "{name} expects a number, got {}",
            type_name(other)
        ))),
    }
}

/// `min`/`max` accept either a single array argument or variadic numbers.
fn fold_numbers(name: &str, args: &[Value], f: impl Fn(f64, f64) -> f64) -> Result<Value> {
    let numbers: Vec<f64> = match args {
        [Value::Array(items)] => items
            .iter()
            .map(|v| {
                v.as_f64().ok_or_else(|| {
                    EngineError::expression(format!("{name} expects numbers, got {}", type_name(v)))
                })
            })
            .collect::<Result<_>>()?,
        _ => args
            .iter()
            .map(|v| {
                v.as_f64().ok_or_else(|| {
                    EngineError::expression(format!("{name} expects numbers, got {}", type_name(v)))
                })
            })
            .collect::<Result<_>>()?,
    };

    let mut iter = numbers.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| EngineError::expression(format!("{name} expects at least one number")))?;
    Ok(make_number(iter.fold(first, &f)))
}

fn keys(args: &[Value]) -> Result<Value> {
    let [value] = expect_args::<1>("keys", args)?;
    match value {
        Value::Object(map) => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        other => Err(EngineError::expression(format!(
            "keys expects an object, got {}",
            type_name(other)
        ))),
    }
}

fn values(args: &[Value]) -> Result<Value> {
    let [value] = expect_args::<1>("values", args)?;
    match value {
        Value::Object(map) => Ok(Value::Array(map.values().cloned().collect())),
        other => Err(EngineError::expression(format!(
            "values expects an object, got {}",
            type_name(other)
        ))),
    }
}

fn first_last(name: &str, args: &[Value], first: bool) -> Result<Value> {
    let [value] = expect_args::<1>(name, args)?;
    match value {
        Value::Array(items) => Ok(if first {
            items.first().cloned().unwrap_or(Value::Null)
        } else {
            items.last().cloned().unwrap_or(Value::Null)
        }),
        other => Err(EngineError::expression(format!(
            "{name} expects an array, got {}",
            type_name(other)
        ))),
    }
}

fn number(args: &[Value]) -> Result<Value> {
    let [value] = expect_args::<1>("number", args)?;
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(make_number)
            .map_err(|_| EngineError::expression(format!("cannot parse `{s}` as a number"))),
        Value::Bool(b) => Ok(make_number(if *b { 1.0 } else { 0.0 })),
        other => Err(EngineError::expression(format!(
            "number cannot convert {}",
            type_name(other)
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
