//! Parameter validation — the pure gate in front of every tool handler.
//!
//! Tool parameter specs are JSON-schema-style documents. This module
//! implements the subset the mesh actually uses: `type`, `properties` +
//! `required`, `enum`, numeric `minimum`/`maximum`, string
//! `minLength`/`maxLength`, array `items`, and `additionalProperties:
//! false`. Validation is separated from execution on purpose: handlers only
//! ever see parameters that already passed.
//!
//! `validate` is a pure function of `(schema, params)` — no registry
//! access, no clock, no I/O.

use serde_json::Value;

/// A single schema violation, with a JSON-pointer-ish path to the offender.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaViolation {
    /// Path into the params document, e.g. `"/location"` or `"/items/3"`.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", if self.path.is_empty() { "/" } else { &self.path }, self.message)
    }
}

/// Validates `params` against a JSON-schema-style `schema`.
///
/// Returns every violation found, not just the first — a caller fixing a
/// request wants the full list.
pub fn validate(schema: &Value, params: &Value) -> Result<(), Vec<SchemaViolation>> {
    let mut violations = Vec::new();
    check(schema, params, "", &mut violations);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn check(schema: &Value, value: &Value, path: &str, out: &mut Vec<SchemaViolation>) {
    let Some(schema_obj) = schema.as_object() else {
        // A non-object schema (true / {}) accepts everything.
        return;
    };
    if schema_obj.is_empty() {
        return;
    }

    if let Some(expected) = schema_obj.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            out.push(SchemaViolation {
                path: path.to_string(),
                message: format!("expected {expected}, got {}", type_name(value)),
            });
            // Structural checks below would only cascade noise.
            return;
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            out.push(SchemaViolation {
                path: path.to_string(),
                message: format!("value not in enum ({} options)", allowed.len()),
            });
        }
    }

    match value {
        Value::Object(fields) => {
            let properties = schema_obj.get("properties").and_then(Value::as_object);

            if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
                for name in required.iter().filter_map(Value::as_str) {
                    if !fields.contains_key(name) {
                        out.push(SchemaViolation {
                            path: format!("{path}/{name}"),
                            message: "required field missing".to_string(),
                        });
                    }
                }
            }

            if let Some(properties) = properties {
                for (name, field_value) in fields {
                    if let Some(field_schema) = properties.get(name) {
                        check(field_schema, field_value, &format!("{path}/{name}"), out);
                    } else if schema_obj.get("additionalProperties") == Some(&Value::Bool(false)) {
                        out.push(SchemaViolation {
                            path: format!("{path}/{name}"),
                            message: "unexpected field".to_string(),
                        });
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema_obj.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}/{i}"), out);
                }
            }
        }
        Value::Number(n) => {
            if let (Some(min), Some(v)) =
                (schema_obj.get("minimum").and_then(Value::as_f64), n.as_f64())
            {
                if v < min {
                    out.push(SchemaViolation {
                        path: path.to_string(),
                        message: format!("{v} below minimum {min}"),
                    });
                }
            }
            if let (Some(max), Some(v)) =
                (schema_obj.get("maximum").and_then(Value::as_f64), n.as_f64())
            {
                if v > max {
                    out.push(SchemaViolation {
                        path: path.to_string(),
                        message: format!("{v} above maximum {max}"),
                    });
                }
            }
        }
        Value::String(s) => {
            if let Some(min) = schema_obj.get("minLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) < min {
                    out.push(SchemaViolation {
                        path: path.to_string(),
                        message: format!("shorter than minLength {min}"),
                    });
                }
            }
            if let Some(max) = schema_obj.get("maxLength").and_then(Value::as_u64) {
                if (s.chars().count() as u64) > max {
                    out.push(SchemaViolation {
                        path: path.to_string(),
                        message: format!("longer than maxLength {max}"),
                    });
                }
            }
        }
        _ => {}
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        // Unknown type names accept everything rather than rejecting
        // params a newer schema dialect would allow.
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_schema() -> Value {
        json!({
            "type": "object",
            "required": ["prompt"],
            "additionalProperties": false,
            "properties": {
                "prompt": { "type": "string", "minLength": 1 },
                "max_tokens": { "type": "integer", "minimum": 1, "maximum": 4096 },
                "format": { "type": "string", "enum": ["text", "json"] }
            }
        })
    }

    #[test]
    fn valid_params_pass() {
        let params = json!({"prompt": "hello", "max_tokens": 128, "format": "json"});
        assert!(validate(&tool_schema(), &params).is_ok());
    }

    #[test]
    fn missing_required_field_is_reported_with_path() {
        let err = validate(&tool_schema(), &json!({})).unwrap_err();
        assert_eq!(err.len(), 1);
        assert_eq!(err[0].path, "/prompt");
    }

    #[test]
    fn wrong_type_is_reported_once() {
        let err = validate(&tool_schema(), &json!({"prompt": 42})).unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].message.contains("expected string"));
    }

    #[test]
    fn numeric_bounds_are_enforced() {
        let err =
            validate(&tool_schema(), &json!({"prompt": "x", "max_tokens": 100_000})).unwrap_err();
        assert!(err[0].message.contains("above maximum"));
    }

    #[test]
    fn enum_mismatch_is_a_violation() {
        let err =
            validate(&tool_schema(), &json!({"prompt": "x", "format": "xml"})).unwrap_err();
        assert_eq!(err[0].path, "/format");
    }

    #[test]
    fn additional_properties_false_rejects_extras() {
        let err = validate(&tool_schema(), &json!({"prompt": "x", "bogus": 1})).unwrap_err();
        assert_eq!(err[0].path, "/bogus");
    }

    #[test]
    fn multiple_violations_all_reported() {
        let err = validate(
            &tool_schema(),
            &json!({"prompt": "", "max_tokens": 0, "format": "xml"}),
        )
        .unwrap_err();
        assert_eq!(err.len(), 3);
    }

    #[test]
    fn array_items_validated_per_element() {
        let schema = json!({"type": "array", "items": {"type": "number"}});
        let err = validate(&schema, &json!([1, "two", 3])).unwrap_err();
        assert_eq!(err[0].path, "/1");
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate(&json!({}), &json!({"whatever": [1, 2, 3]})).is_ok());
        assert!(validate(&json!(true), &json!(null)).is_ok());
    }

    #[test]
    fn integer_type_rejects_floats() {
        let schema = json!({"type": "integer"});
        assert!(validate(&schema, &json!(3)).is_ok());
        assert!(validate(&schema, &json!(3.5)).is_err());
    }
}
