//! JSON schema validation for ward `output_schema`
//!
//! A pragmatic subset: type, required/properties, items, enum,
//! minimum/maximum. Error messages are written to be rendered into
//! retry prompts, so they name the path and the expectation.

use serde_json::Value;

/// Validate a value against a schema; empty vec means valid
pub fn validate_schema(schema: &Value, value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    check(schema, value, "$", &mut errors);
    errors
}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema_obj) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema_obj.get("type").and_then(|t| t.as_str()) {
        let actual = type_name(value);
        let matches = match expected {
            "number" => matches!(value, Value::Number(_)),
            "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
            other => actual == other,
        };
        if !matches {
            errors.push(format!("{}: expected {}, got {}", path, expected, actual));
            return;
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(value) {
            errors.push(format!("{}: value {} not in enum", path, value));
        }
    }

    if let Some(minimum) = schema_obj.get("minimum").and_then(|m| m.as_f64()) {
        if let Some(n) = value.as_f64() {
            if n < minimum {
                errors.push(format!("{}: {} below minimum {}", path, n, minimum));
            }
        }
    }
    if let Some(maximum) = schema_obj.get("maximum").and_then(|m| m.as_f64()) {
        if let Some(n) = value.as_f64() {
            if n > maximum {
                errors.push(format!("{}: {} above maximum {}", path, n, maximum));
            }
        }
    }

    if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
        if let Some(obj) = value.as_object() {
            for field in required.iter().filter_map(|f| f.as_str()) {
                if !obj.contains_key(field) {
                    errors.push(format!("{}: missing required field '{}'", path, field));
                }
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(|p| p.as_object()) {
        if let Some(obj) = value.as_object() {
            for (field, sub_schema) in properties {
                if let Some(sub_value) = obj.get(field) {
                    check(sub_schema, sub_value, &format!("{}.{}", path, field), errors);
                }
            }
        }
    }

    if let Some(items) = schema_obj.get("items") {
        if let Some(array) = value.as_array() {
            for (idx, item) in array.iter().enumerate() {
                check(items, item, &format!("{}[{}]", path, idx), errors);
            }
        }
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
