//! Template interpolation and structural resolution.
//!
//! A template is any string containing `{{ … }}` spans.  A string that is
//! exactly one span preserves the evaluated value's type; anything else
//! stringifies each span into the surrounding text.  Non-string values are
//! walked structurally so every leaf string gets resolved.

use flowdeck_core::{EngineError, Result, VariableScope};
use serde_json::Value;

use crate::eval::{evaluate_expr, is_truthy, stringify};
use crate::parser::parse_expression;

/// Evaluate a bare expression string against a scope.
pub fn evaluate(src: &str, scope: &VariableScope) -> Result<Value> {
    evaluate_expr(&parse_expression(src)?, scope)
}

/// Evaluate a predicate: either a bare expression (`n > 3`) or a template
/// form (`{{ n > 3 }}`).  The result is reduced to truthiness.
pub fn evaluate_predicate(src: &str, scope: &VariableScope) -> Result<bool> {
    let value = if src.contains("{{") {
        resolve_template(src, scope)?
    } else {
        evaluate(src, scope)?
    };
    Ok(is_truthy(&value))
}

/// Resolve a string template against a scope.
///
/// A template that is exactly one `{{ expr }}` (ignoring surrounding
/// whitespace) returns the evaluated value unchanged; mixed templates
/// return a string with each span stringified (null renders empty).
pub fn resolve_template(template: &str, scope: &VariableScope) -> Result<Value> {
    let spans = find_spans(template)?;

    if spans.is_empty() {
        return Ok(Value::String(template.to_string()));
    }

    // Type-preserving single-expression form.
    if spans.len() == 1 {
        let (start, end) = spans[0];
        if template[..start].trim().is_empty() && template[end..].trim().is_empty() {
            let expr = &template[start + 2..end - 2];
            return evaluate(expr, scope);
        }
    }

    let mut out = String::new();
    let mut cursor = 0;
    for (start, end) in spans {
        out.push_str(&template[cursor..start]);
        let value = evaluate(&template[start + 2..end - 2], scope)?;
        out.push_str(&stringify(&value));
        cursor = end;
    }
    out.push_str(&template[cursor..]);
    Ok(Value::String(out))
}

/// Resolve a value of any shape: strings are template-resolved, arrays and
/// objects are walked, everything else passes through.
pub fn resolve(value: &Value, scope: &VariableScope) -> Result<Value> {
    match value {
        Value::String(s) => resolve_template(s, scope),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Locate `{{ … }}` spans as byte ranges `(start_of_open, end_after_close)`.
///
/// Tracks single-brace depth and string literals inside the span so object
/// literals like `{{ {a: {b: 1}} }}` close at the right place.
fn find_spans(template: &str) -> Result<Vec<(usize, usize)>> {
    let bytes = template.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] != b'{' || bytes[i + 1] != b'{' {
            i += 1;
            continue;
        }

        let start = i;
        let mut j = i + 2;
        let mut depth = 0usize;
        let mut quote: Option<u8> = None;
        let mut closed = false;

        while j < bytes.len() {
            let b = bytes[j];
            if let Some(q) = quote {
                if b == b'\\' {
                    j += 2;
                    continue;
                }
                if b == q {
                    quote = None;
                }
                j += 1;
                continue;
            }
            match b {
                b'\'' | b'"' => quote = Some(b),
                b'{' => depth += 1,
                b'}' => {
                    if depth > 0 {
                        depth -= 1;
                    } else if j + 1 < bytes.len() && bytes[j + 1] == b'}' {
                        spans.push((start, j + 2));
                        i = j + 2;
                        closed = true;
                        break;
                    }
                }
                _ => {}
            }
            j += 1;
        }

        if !closed {
            return Err(EngineError::expression(format!(
                "unterminated template span in `{template}`"
            )));
        }
    }

    Ok(spans)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
