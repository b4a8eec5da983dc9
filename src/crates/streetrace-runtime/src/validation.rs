//! Structured-output validation.
//!
//! Agent responses expected to match a schema go through: fence stripping,
//! JSON parsing, deep re-parsing of JSON-in-string fields (agents frequently
//! wrap nested objects as strings), then a structural walk against the
//! declared shape. Callers retry once with error feedback before falling
//! back to an empty result.

use serde_json::Value;
use streetrace_compiler::workflow::{FieldShape, SchemaShape};
use streetrace_syntax::ast::BaseType;

use crate::error::{Result, RuntimeError};

/// Error feedback appended to the agent input before the single retry.
pub fn retry_feedback(first_error: &str) -> String {
    format!(
        "Error: Your response could not be parsed. {first_error}\n\n\
         Please respond with valid JSON matching the expected schema."
    )
}

/// Strip a leading/trailing triple-backtick fence if the whole text is
/// wrapped in one.
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        let lines: Vec<&str> = trimmed.lines().collect();
        if lines.len() >= 3 && lines.last().map(|l| l.trim()) == Some("```") {
            return lines[1..lines.len() - 1].join("\n").trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Parse a raw agent response as JSON.
pub fn parse_json_response(text: &str) -> Result<Value> {
    let cleaned = strip_fences(text);
    serde_json::from_str(&cleaned).map_err(|e| RuntimeError::JsonParse(e.to_string()))
}

/// Best-effort parse used when no schema is declared: JSON text becomes a
/// structured value, anything else stays a string.
pub fn try_parse_json(text: &str) -> Value {
    match parse_json_response(text) {
        Ok(value) => deep_parse_strings(value),
        Err(_) => Value::String(text.to_string()),
    }
}

/// Recursively replace string values that themselves parse as JSON objects
/// or arrays with the parsed value.
pub fn deep_parse_strings(value: Value) -> Value {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(parsed) => deep_parse_strings(parsed),
                    Err(_) => Value::String(text),
                }
            } else {
                Value::String(text)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(deep_parse_strings).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, deep_parse_strings(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Validate a raw response against a schema shape.
///
/// For array schemas the root must be a list and every element validates
/// individually.
pub fn validate_response(
    raw: &str,
    schema_name: &str,
    shape: &SchemaShape,
    is_array: bool,
) -> Result<Value> {
    let parsed = deep_parse_strings(parse_json_response(raw)?);
    if is_array {
        let Value::Array(items) = &parsed else {
            return Err(RuntimeError::JsonParse(format!(
                "expected JSON array, got {}",
                crate::value::type_name(&parsed)
            )));
        };
        for (index, item) in items.iter().enumerate() {
            validate_object(item, schema_name, shape)
                .map_err(|e| prefix_detail(e, &format!("element {index}: ")))?;
        }
        Ok(parsed)
    } else {
        validate_object(&parsed, schema_name, shape)?;
        Ok(parsed)
    }
}

/// The fallback stored after two validation failures.
pub fn empty_fallback(is_array: bool) -> Value {
    if is_array {
        Value::Array(Vec::new())
    } else {
        Value::Object(serde_json::Map::new())
    }
}

fn prefix_detail(error: RuntimeError, prefix: &str) -> RuntimeError {
    match error {
        RuntimeError::SchemaValidation { schema, detail } => RuntimeError::SchemaValidation {
            schema,
            detail: format!("{prefix}{detail}"),
        },
        other => other,
    }
}

fn validate_object(value: &Value, schema_name: &str, shape: &SchemaShape) -> Result<()> {
    let Value::Object(map) = value else {
        return Err(RuntimeError::SchemaValidation {
            schema: schema_name.to_string(),
            detail: format!("expected object, got {}", crate::value::type_name(value)),
        });
    };
    for field in &shape.fields {
        match map.get(&field.name) {
            None | Some(Value::Null) => {
                if !field.is_optional {
                    return Err(RuntimeError::SchemaValidation {
                        schema: schema_name.to_string(),
                        detail: format!("missing required field `{}`", field.name),
                    });
                }
            }
            Some(found) => validate_field(found, schema_name, field)?,
        }
    }
    Ok(())
}

fn validate_field(value: &Value, schema_name: &str, field: &FieldShape) -> Result<()> {
    if field.is_list {
        let Value::Array(items) = value else {
            return Err(RuntimeError::SchemaValidation {
                schema: schema_name.to_string(),
                detail: format!(
                    "field `{}` must be a list, got {}",
                    field.name,
                    crate::value::type_name(value)
                ),
            });
        };
        for item in items {
            check_base_type(item, schema_name, &field.name, field.base)?;
        }
        Ok(())
    } else {
        check_base_type(value, schema_name, &field.name, field.base)
    }
}

fn check_base_type(
    value: &Value,
    schema_name: &str,
    field_name: &str,
    base: BaseType,
) -> Result<()> {
    let ok = match base {
        BaseType::Bool => value.is_boolean(),
        BaseType::Int => value.is_i64() || value.is_u64(),
        // Integers are acceptable wherever a float is expected.
        BaseType::Float => value.is_number(),
        BaseType::String => value.is_string(),
        BaseType::Object => value.is_object(),
    };
    if ok {
        Ok(())
    } else {
        Err(RuntimeError::SchemaValidation {
            schema: schema_name.to_string(),
            detail: format!(
                "field `{field_name}` expected {base:?}, got {}",
                crate::value::type_name(value)
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use streetrace_compiler::workflow::FieldShape;

    fn finding_shape() -> SchemaShape {
        SchemaShape {
            fields: vec![
                FieldShape {
                    name: "title".into(),
                    base: BaseType::String,
                    is_list: false,
                    is_optional: false,
                },
                FieldShape {
                    name: "severity".into(),
                    base: BaseType::String,
                    is_list: false,
                    is_optional: false,
                },
                FieldShape {
                    name: "tags".into(),
                    base: BaseType::String,
                    is_list: true,
                    is_optional: true,
                },
            ],
        }
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_fences("  {\"a\": 1}  "), "{\"a\": 1}");
        assert_eq!(strip_fences("no fences"), "no fences");
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_json_response("not json").unwrap_err();
        assert!(matches!(err, RuntimeError::JsonParse(_)));
    }

    #[test]
    fn test_deep_parse_unwraps_nested_json_strings() {
        let value = json!({"inner": "{\"x\": 1}", "plain": "hello"});
        let parsed = deep_parse_strings(value);
        assert_eq!(parsed, json!({"inner": {"x": 1}, "plain": "hello"}));
    }

    #[test]
    fn test_validate_object_success() {
        let raw = r#"{"title": "Leak", "severity": "high", "tags": ["mem"]}"#;
        let value = validate_response(raw, "Finding", &finding_shape(), false).expect("valid");
        assert_eq!(value["title"], json!("Leak"));
    }

    #[test]
    fn test_validate_array_success() {
        let raw = r#"[{"title": "A", "severity": "low"}, {"title": "B", "severity": "high"}]"#;
        let value = validate_response(raw, "Finding", &finding_shape(), true).expect("valid");
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_validate_array_rejects_object_root() {
        let raw = r#"{"title": "A", "severity": "low"}"#;
        let err = validate_response(raw, "Finding", &finding_shape(), true).unwrap_err();
        assert!(matches!(err, RuntimeError::JsonParse(_)));
    }

    #[test]
    fn test_validate_reports_missing_required_field() {
        let raw = r#"{"title": "A"}"#;
        let err = validate_response(raw, "Finding", &finding_shape(), false).unwrap_err();
        match err {
            RuntimeError::SchemaValidation { detail, .. } => {
                assert!(detail.contains("severity"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_optional_field_may_be_null_or_absent() {
        let raw = r#"{"title": "A", "severity": "low", "tags": null}"#;
        assert!(validate_response(raw, "Finding", &finding_shape(), false).is_ok());
    }

    #[test]
    fn test_list_field_type_checked() {
        let raw = r#"{"title": "A", "severity": "low", "tags": "oops"}"#;
        let err = validate_response(raw, "Finding", &finding_shape(), false).unwrap_err();
        match err {
            RuntimeError::SchemaValidation { detail, .. } => assert!(detail.contains("tags")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_int_accepted_for_float_field() {
        let shape = SchemaShape {
            fields: vec![FieldShape {
                name: "score".into(),
                base: BaseType::Float,
                is_list: false,
                is_optional: false,
            }],
        };
        assert!(validate_response(r#"{"score": 3}"#, "S", &shape, false).is_ok());
        assert!(validate_response(r#"{"score": 3.5}"#, "S", &shape, false).is_ok());
        assert!(validate_response(r#"{"score": "hi"}"#, "S", &shape, false).is_err());
    }

    #[test]
    fn test_fallbacks() {
        assert_eq!(empty_fallback(true), json!([]));
        assert_eq!(empty_fallback(false), json!({}));
    }

    #[test]
    fn test_try_parse_json_keeps_plain_text() {
        assert_eq!(try_parse_json("hello"), json!("hello"));
        assert_eq!(try_parse_json("[1, 2]"), json!([1, 2]));
        assert_eq!(
            try_parse_json("```json\n{\"a\": 1}\n```"),
            json!({"a": 1})
        );
    }
}
