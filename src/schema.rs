//! Argument checks against a tool's declared parameter schema.
//!
//! Only the subset of JSON Schema that tool declarations actually use is
//! understood: `type` (string or list), `required`, `properties` and `enum`,
//! applied one level deep. Unknown keywords are ignored and extra properties
//! are allowed.

use serde_json::{Map, Value};

/// Collect every violation of `schema` by `args`. An empty list means valid.
pub fn violations(schema: &Value, args: &Value) -> Vec<String> {
    let mut found = Vec::new();

    if let Some(expected) = schema.get("type") {
        if !matches_type(expected, args) {
            found.push(format!(
                "expected {}, got {}",
                describe_type(expected),
                type_name(args)
            ));
            return found;
        }
    }

    let Some(object) = args.as_object() else {
        return found;
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if object.get(field).map_or(true, Value::is_null) {
                found.push(format!("missing required field `{field}`"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        check_properties(properties, object, &mut found);
    }

    found
}

fn check_properties(properties: &Map<String, Value>, object: &Map<String, Value>, found: &mut Vec<String>) {
    for (field, value) in object {
        let Some(property) = properties.get(field) else {
            continue;
        };
        // Optional fields sent as null are treated as absent.
        if value.is_null() {
            continue;
        }
        if let Some(expected) = property.get("type") {
            if !matches_type(expected, value) {
                found.push(format!(
                    "field `{field}` should be {}, got {}",
                    describe_type(expected),
                    type_name(value)
                ));
                continue;
            }
        }
        if let Some(allowed) = property.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                let choices: Vec<String> = allowed.iter().map(Value::to_string).collect();
                found.push(format!(
                    "field `{field}` must be one of {}, got {value}",
                    choices.join(", ")
                ));
            }
        }
    }
}

fn matches_type(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => matches_named_type(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| matches_named_type(name, value)),
        _ => true,
    }
}

fn matches_named_type(name: &str, value: &Value) -> bool {
    match name.to_ascii_lowercase().as_str() {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn describe_type(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.to_ascii_lowercase(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_ascii_lowercase)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
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
