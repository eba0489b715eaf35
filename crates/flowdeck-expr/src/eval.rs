//! Expression evaluator.
//!
//! Operates directly on `serde_json::Value`; every operator is defined in
//! terms of the value's tag so there are no host-language coercion
//! surprises.  Missing paths evaluate to null.  `&&` and `||` short-circuit.

use flowdeck_core::{EngineError, Result, VariableScope};
use serde_json::Value;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::functions;

/// Evaluate a parsed expression against a scope.
pub fn evaluate_expr(expr: &Expr, scope: &VariableScope) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),

        Expr::Ident(name) => Ok(scope.get(name).cloned().unwrap_or(Value::Null)),

        Expr::Member { base, name } => {
            let base = evaluate_expr(base, scope)?;
            Ok(base.get(name.as_str()).cloned().unwrap_or(Value::Null))
        }

        Expr::Index { base, index } => {
            let base = evaluate_expr(base, scope)?;
            let index = evaluate_expr(index, scope)?;
            Ok(index_value(&base, &index))
        }

        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate_expr(item, scope)?);
            }
            Ok(Value::Array(out))
        }

        Expr::Object(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (key, value) in entries {
                map.insert(key.clone(), evaluate_expr(value, scope)?);
            }
            Ok(Value::Object(map))
        }

        Expr::Unary { op, expr } => {
            let value = evaluate_expr(expr, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                UnaryOp::Neg => {
                    let n = as_number(&value, "unary `-`")?;
                    Ok(make_number(-n))
                }
            }
        }

        Expr::Binary { op, left, right } => evaluate_binary(*op, left, right, scope),

        Expr::Match {
            expr,
            pattern,
            flags,
        } => {
            let value = evaluate_expr(expr, scope)?;
            let text = match &value {
                Value::String(s) => s.clone(),
                other => stringify(other),
            };
            regex_match(&text, pattern, flags)
        }

        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if is_truthy(&evaluate_expr(cond, scope)?) {
                evaluate_expr(then, scope)
            } else {
                evaluate_expr(otherwise, scope)
            }
        }

        Expr::Call { name, args } => match name.as_str() {
            // `isset` is a special form: it inspects path presence without
            // treating a missing path as an error or a null value.
            "isset" => {
                let [arg] = args.as_slice() else {
                    return Err(EngineError::expression("isset expects exactly one argument"));
                };
                if !arg.is_path() {
                    return Err(EngineError::expression("isset expects a variable path"));
                }
                Ok(Value::Bool(path_is_set(arg, scope)?))
            }
            "default" => {
                let [value, fallback] = args.as_slice() else {
                    return Err(EngineError::expression(
                        "default expects exactly two arguments",
                    ));
                };
                let value = evaluate_expr(value, scope)?;
                if value.is_null() {
                    evaluate_expr(fallback, scope)
                } else {
                    Ok(value)
                }
            }
            _ => {
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(evaluate_expr(arg, scope)?);
                }
                functions::call(name, &evaluated)
            }
        },
    }
}

fn evaluate_binary(op: BinaryOp, left: &Expr, right: &Expr, scope: &VariableScope) -> Result<Value> {
    // Short-circuit operators evaluate the right side lazily.
    match op {
        BinaryOp::Or => {
            let l = evaluate_expr(left, scope)?;
            if is_truthy(&l) {
                return Ok(l);
            }
            return evaluate_expr(right, scope);
        }
        BinaryOp::And => {
            let l = evaluate_expr(left, scope)?;
            if !is_truthy(&l) {
                return Ok(l);
            }
            return evaluate_expr(right, scope);
        }
        _ => {}
    }

    let l = evaluate_expr(left, scope)?;
    let r = evaluate_expr(right, scope)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&l, &r))),

        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare_values(&l, &r)?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }

        BinaryOp::Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Number(_), Value::Number(_)) => {
                arithmetic(&l, &r, |a, b| Ok(a + b), "`+`")
            }
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::Array(out))
            }
            _ => Err(type_mismatch("`+`", &l, &r)),
        },

        BinaryOp::Sub => arithmetic(&l, &r, |a, b| Ok(a - b), "`-`"),
        BinaryOp::Mul => arithmetic(&l, &r, |a, b| Ok(a * b), "`*`"),
        BinaryOp::Div => arithmetic(
            &l,
            &r,
            |a, b| {
                if b == 0.0 {
                    Err(EngineError::expression("division by zero"))
                } else {
                    Ok(a / b)
                }
            },
            "`/`",
        ),
        BinaryOp::Rem => arithmetic(
            &l,
            &r,
            |a, b| {
                if b == 0.0 {
                    Err(EngineError::expression("modulo by zero"))
                } else {
                    Ok(a % b)
                }
            },
            "`%`",
        ),

        BinaryOp::Or | BinaryOp::And => unreachable!("handled above"),
    }
}

// ---------------------------------------------------------------------------
// Value semantics
// ---------------------------------------------------------------------------

/// Truthiness: null is false, booleans are themselves, numbers are true
/// unless zero, strings are true unless empty, arrays and objects are
/// always true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Stringification for template interpolation: null renders as the empty
/// string, strings render without quotes, everything else renders as
/// compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        // Numbers compare numerically so `1 == 1.0` holds.
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn compare_values(l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| EngineError::expression("cannot compare NaN"))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(type_mismatch("comparison", l, r)),
    }
}

fn arithmetic(
    l: &Value,
    r: &Value,
    f: impl Fn(f64, f64) -> Result<f64>,
    op: &str,
) -> Result<Value> {
    let a = as_number(l, op)?;
    let b = as_number(r, op)?;
    Ok(make_number(f(a, b)?))
}

fn as_number(value: &Value, op: &str) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EngineError::expression(format!("non-finite number in {op}"))),
        other => Err(EngineError::expression(format!(
            "{op} expects a number, got {}",
            type_name(other)
        ))),
    }
}

/// Build a JSON number, preserving integer representation when the value
/// is integral and in safe range.
pub(crate) fn make_number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::Number((f as i64).into())
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_mismatch(op: &str, l: &Value, r: &Value) -> EngineError {
    EngineError::expression(format!(
        "type mismatch in {op}: {} vs {}",
        type_name(l),
        type_name(r)
    ))
}

// ---------------------------------------------------------------------------
// Paths and regex
// ---------------------------------------------------------------------------

fn index_value(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Object(map), Value::String(key)) => {
            map.get(key).cloned().unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

/// Walk a path expression checking presence without conflating a stored
/// null with a missing binding at the root.
fn path_is_set(expr: &Expr, scope: &VariableScope) -> Result<bool> {
    match expr {
        Expr::Ident(name) => Ok(scope.contains(name)),
        Expr::Member { base, name } => {
            if !path_is_set(base, scope)? {
                return Ok(false);
            }
            let base = evaluate_expr(base, scope)?;
            Ok(base.get(name.as_str()).is_some())
        }
        Expr::Index { base, index } => {
            if !path_is_set(base, scope)? {
                return Ok(false);
            }
            let base = evaluate_expr(base, scope)?;
            let index = evaluate_expr(index, scope)?;
            Ok(!index_value(&base, &index).is_null())
        }
        _ => Err(EngineError::expression("isset expects a variable path")),
    }
}

/// `=~` returns the first capture group if the pattern has one, otherwise
/// the whole match, otherwise the empty string on no match.
fn regex_match(text: &str, pattern: &str, flags: &str) -> Result<Value> {
    let mut builder = String::new();
    if !flags.is_empty() {
        let mut inline = String::new();
        for flag in flags.chars() {
            match flag {
                'i' => inline.push('i'),
                'm' => inline.push('m'),
                's' => inline.push('s'),
                other => {
                    return Err(EngineError::expression(format!(
                        "unsupported regex flag `{other}`"
                    )));
                }
            }
        }
        builder.push_str(&format!("(?{inline})"));
    }
    builder.push_str(pattern);

    let re = regex::Regex::new(&builder)
        .map_err(|e| EngineError::expression(format!("invalid regex: {e}")))?;

    match re.captures(text) {
        Some(caps) => {
            let capture = caps
                .get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Ok(Value::String(capture))
        }
        None => Ok(Value::String(String::new())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;
    use serde_json::json;

    fn eval(src: &str, scope: &VariableScope) -> Result<Value> {
        evaluate_expr(&parse_expression(src)?, scope)
    }

    fn scope_with(entries: &[(&str, Value)]) -> VariableScope {
        let mut scope = VariableScope::new();
        for (k, v) in entries {
            scope.set(*k, v.clone());
        }
        scope
    }

    #[test]
    fn arithmetic_preserves_integers() {
        let scope = scope_with(&[("x", json!(10))]);
        assert_eq!(eval("x * 2", &scope).unwrap(), json!(20));
        assert_eq!(eval("10 / 4", &scope).unwrap(), json!(2.5));
        assert_eq!(eval("7 % 3", &scope).unwrap(), json!(1));
    }

    #[test]
    fn division_by_zero_fails() {
        let scope = VariableScope::new();
        let err = eval("1 / 0", &scope).unwrap_err();
        assert_eq!(err.kind, flowdeck_core::ErrorKind::ExpressionError);
    }

    #[test]
    fn string_concat_and_type_mismatch() {
        let scope = VariableScope::new();
        assert_eq!(eval("'a' + 'b'", &scope).unwrap(), json!("ab"));
        assert!(eval("'a' + 1", &scope).is_err());
    }

    #[test]
    fn missing_path_is_null() {
        let scope = VariableScope::new();
        assert_eq!(eval("nothing.here", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn nested_path_access() {
        let scope = scope_with(&[(
            "user",
            json!({ "name": "ada", "tags": ["admin", "ops"] }),
        )]);
        assert_eq!(eval("user.name", &scope).unwrap(), json!("ada"));
        assert_eq!(eval("user.tags[1]", &scope).unwrap(), json!("ops"));
        assert_eq!(eval("user.tags[9]", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn short_circuit_avoids_rhs_error() {
        let scope = scope_with(&[("ok", json!(true))]);
        // The right side would divide by zero; `||` must not evaluate it.
        assert_eq!(eval("ok || (1 / 0)", &scope).unwrap(), json!(true));
        assert_eq!(eval("!ok && (1 / 0)", &scope).unwrap(), json!(false));
    }

    #[test]
    fn or_returns_operand_value() {
        let scope = scope_with(&[("name", json!(""))]);
        assert_eq!(eval("name || 'anonymous'", &scope).unwrap(), json!("anonymous"));
    }

    #[test]
    fn comparisons() {
        let scope = scope_with(&[("n", json!(5))]);
        assert_eq!(eval("n > 3", &scope).unwrap(), json!(true));
        assert_eq!(eval("n <= 4", &scope).unwrap(), json!(false));
        assert_eq!(eval("'abc' < 'abd'", &scope).unwrap(), json!(true));
        assert!(eval("'a' < 1", &scope).is_err());
    }

    #[test]
    fn equality_is_strict_by_tag() {
        let scope = VariableScope::new();
        assert_eq!(eval("1 == 1.0", &scope).unwrap(), json!(true));
        assert_eq!(eval("'5' == 5", &scope).unwrap(), json!(false));
        assert_eq!(eval("null == null", &scope).unwrap(), json!(true));
    }

    #[test]
    fn ternary() {
        let scope = scope_with(&[("n", json!(5))]);
        assert_eq!(
            eval("n > 3 ? 'big' : 'small'", &scope).unwrap(),
            json!("big")
        );
    }

    #[test]
    fn regex_first_capture_group() {
        let scope = scope_with(&[("email", json!("ada@example.com"))]);
        assert_eq!(
            eval(r"email =~ /@(.+)$/", &scope).unwrap(),
            json!("example.com")
        );
    }

    #[test]
    fn regex_whole_match_without_group() {
        let scope = scope_with(&[("s", json!("order-1234"))]);
        assert_eq!(eval(r"s =~ /\d+/", &scope).unwrap(), json!("1234"));
    }

    #[test]
    fn regex_no_match_is_empty_string() {
        let scope = scope_with(&[("s", json!("nope"))]);
        assert_eq!(eval(r"s =~ /\d+/", &scope).unwrap(), json!(""));
    }

    #[test]
    fn regex_case_insensitive_flag() {
        let scope = scope_with(&[("s", json!("Hello World"))]);
        assert_eq!(eval("s =~ /hello/i", &scope).unwrap(), json!("Hello"));
    }

    #[test]
    fn bad_regex_fails() {
        let scope = scope_with(&[("s", json!("x"))]);
        assert!(eval(r"s =~ /(/", &scope).is_err());
    }

    #[test]
    fn isset_and_default() {
        let mut scope = VariableScope::new();
        scope.set("present", json!(0));
        scope.set("nil", Value::Null);

        assert_eq!(eval("isset(present)", &scope).unwrap(), json!(true));
        assert_eq!(eval("isset(absent)", &scope).unwrap(), json!(false));
        // A stored null counts as set at the root.
        assert_eq!(eval("isset(nil)", &scope).unwrap(), json!(true));

        assert_eq!(eval("default(absent, 7)", &scope).unwrap(), json!(7));
        assert_eq!(eval("default(present, 7)", &scope).unwrap(), json!(0));
    }

    #[test]
    fn literal_arrays_and_objects_evaluate_members() {
        let scope = scope_with(&[("x", json!(2))]);
        assert_eq!(eval("[1, x, 3]", &scope).unwrap(), json!([1, 2, 3]));
        assert_eq!(eval("{a: x * 2}", &scope).unwrap(), json!({ "a": 4 }));
    }

    #[test]
    fn truthiness_rules() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!(0.5)));
    }
}
