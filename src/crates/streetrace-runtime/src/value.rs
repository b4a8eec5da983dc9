//! Helpers over the JSON-shaped runtime value.
//!
//! DSL values are `serde_json::Value`: a closed sum of null, bool, int,
//! float, string, list and map. Operators pattern-match on the variant and
//! return typed errors on misuse.

use serde_json::Value;

use crate::error::{Result, RuntimeError};

/// Truthiness: everything except `null`, `false`, `0`, `""` and empty
/// composites.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i != 0
            } else {
                n.as_f64().map(|f| f != 0.0).unwrap_or(false)
            }
        }
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Render a value as user-facing text: strings bare, everything else as
/// canonical JSON. This is the rendering `match` compares against and the
/// one agent inputs are built from.
pub fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Structural equality with numeric cross-type comparison (`1 == 1.0`).
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        (a, b) => a == b,
    }
}

/// Ordering comparison; numbers compare numerically, strings
/// lexicographically.
pub fn compare_values(left: &Value, right: &Value) -> Result<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (
                a.as_f64().unwrap_or(f64::NAN),
                b.as_f64().unwrap_or(f64::NAN),
            );
            a.partial_cmp(&b).ok_or_else(|| {
                RuntimeError::TypeMismatch("cannot order NaN values".to_string())
            })
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (a, b) => Err(RuntimeError::TypeMismatch(format!(
            "cannot compare {} with {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

/// Arithmetic with standard numeric promotion; `+` also concatenates
/// strings.
pub fn arithmetic(op: char, left: &Value, right: &Value) -> Result<Value> {
    if op == '+' {
        if let (Value::String(a), Value::String(b)) = (left, right) {
            return Ok(Value::String(format!("{a}{b}")));
        }
    }
    let (Value::Number(a), Value::Number(b)) = (left, right) else {
        return Err(RuntimeError::TypeMismatch(format!(
            "cannot apply `{op}` to {} and {}",
            type_name(left),
            type_name(right)
        )));
    };
    // Integer arithmetic stays integral; any float promotes both sides.
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            '+' => a.checked_add(b),
            '-' => a.checked_sub(b),
            '*' => a.checked_mul(b),
            '/' => {
                if b == 0 {
                    return Err(RuntimeError::TypeMismatch("division by zero".to_string()));
                }
                a.checked_div(b)
            }
            _ => None,
        };
        return result
            .map(Value::from)
            .ok_or_else(|| RuntimeError::TypeMismatch("integer overflow".to_string()));
    }
    let (a, b) = (
        a.as_f64().unwrap_or(f64::NAN),
        b.as_f64().unwrap_or(f64::NAN),
    );
    let result = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' => {
            if b == 0.0 {
                return Err(RuntimeError::TypeMismatch("division by zero".to_string()));
            }
            a / b
        }
        _ => return Err(RuntimeError::TypeMismatch(format!("unknown operator `{op}`"))),
    };
    Ok(Value::from(result))
}

/// Walk a dotted path into a value. Each hop requires a map; a missing key
/// yields `null`.
pub fn walk_path<'v>(value: &'v Value, path: &[String]) -> Result<&'v Value> {
    let mut current = value;
    for segment in path {
        match current {
            Value::Object(map) => {
                current = map.get(segment).unwrap_or(&Value::Null);
            }
            Value::Null => return Ok(&Value::Null),
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "cannot access `.{segment}` on {}",
                    type_name(other)
                )));
            }
        }
    }
    Ok(current)
}

/// Mutate the terminal field of a dotted path; every intermediate hop must
/// already be a map.
pub fn set_path(value: &mut Value, path: &[String], new_value: Value) -> Result<()> {
    let (last, intermediate) = path
        .split_last()
        .ok_or_else(|| RuntimeError::TypeMismatch("empty property path".to_string()))?;
    let mut current = value;
    for segment in intermediate {
        let Value::Object(map) = current else {
            return Err(RuntimeError::TypeMismatch(format!(
                "cannot access `.{segment}` on {}",
                type_name(current)
            )));
        };
        current = map
            .get_mut(segment)
            .ok_or_else(|| RuntimeError::Unresolved {
                what: "property",
                name: segment.clone(),
            })?;
    }
    let Value::Object(map) = current else {
        return Err(RuntimeError::TypeMismatch(format!(
            "cannot assign `.{last}` on {}",
            type_name(current)
        )));
    };
    map.insert(last.clone(), new_value);
    Ok(())
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "int"
            } else {
                "float"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(0.0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(!truthy(&json!({})));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([0])));
    }

    #[test]
    fn test_render_text() {
        assert_eq!(render_text(&json!("plain")), "plain");
        assert_eq!(render_text(&json!(3)), "3");
        assert_eq!(render_text(&json!(["a", 1])), "[\"a\",1]");
    }

    #[test]
    fn test_numeric_promotion() {
        assert_eq!(arithmetic('+', &json!(1), &json!(2)).unwrap(), json!(3));
        assert_eq!(
            arithmetic('+', &json!(1), &json!(2.5)).unwrap(),
            json!(3.5)
        );
        assert_eq!(arithmetic('*', &json!(4), &json!(2.0)).unwrap(), json!(8.0));
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(
            arithmetic('+', &json!("a"), &json!("b")).unwrap(),
            json!("ab")
        );
    }

    #[test]
    fn test_division_by_zero() {
        assert!(arithmetic('/', &json!(1), &json!(0)).is_err());
        assert!(arithmetic('/', &json!(1.0), &json!(0.0)).is_err());
    }

    #[test]
    fn test_structural_equality() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({"a": [1, 2]}), &json!({"a": [1, 2]})));
        assert!(!values_equal(&json!({"a": 1}), &json!({"a": 2})));
    }

    #[test]
    fn test_walk_path() {
        let value = json!({"a": {"b": {"c": 7}}});
        assert_eq!(
            walk_path(&value, &["a".into(), "b".into(), "c".into()]).unwrap(),
            &json!(7)
        );
        assert_eq!(
            walk_path(&value, &["a".into(), "missing".into()]).unwrap(),
            &Value::Null
        );
        assert!(walk_path(&json!([1]), &["a".into()]).is_err());
    }

    #[test]
    fn test_set_path() {
        let mut value = json!({"report": {"status": "open"}});
        set_path(
            &mut value,
            &["report".into(), "status".into()],
            json!("done"),
        )
        .unwrap();
        assert_eq!(value, json!({"report": {"status": "done"}}));

        let mut not_object = json!({"report": 3});
        let err = set_path(
            &mut not_object,
            &["report".into(), "status".into()],
            json!(1),
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch(_)));
    }
}
