//! JSON Schema helpers for tool inputs.

use serde_json::{json, Map, Value};

/// Builder for flat object schemas.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    properties: Map<String, Value>,
    required: Vec<String>,
}

impl SchemaBuilder {
    pub fn object() -> Self {
        Self::default()
    }

    pub fn string(self, name: &str, description: &str, required: bool) -> Self {
        self.property(name, json!({"type": "string", "description": description}), required)
    }

    pub fn string_enum(self, name: &str, description: &str, values: &[&str], required: bool) -> Self {
        self.property(
            name,
            json!({"type": "string", "description": description, "enum": values}),
            required,
        )
    }

    pub fn object_property(self, name: &str, description: &str, required: bool) -> Self {
        self.property(name, json!({"type": "object", "description": description}), required)
    }

    pub fn property(mut self, name: &str, schema: Value, required: bool) -> Self {
        self.properties.insert(name.to_string(), schema);
        if required {
            self.required.push(name.to_string());
        }
        self
    }

    pub fn build(self) -> Value {
        json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required,
        })
    }
}

/// Check `input` against the top level of an object schema.
///
/// Covers the object type, required keys and declared property types.
pub fn validate_input(input: &Value, schema: &Value) -> Result<(), String> {
    let expects_object = schema.get("type").and_then(Value::as_str) == Some("object");
    let Some(obj) = input.as_object() else {
        return if expects_object {
            Err(format!("expected object input, got {}", type_name(input)))
        } else {
            Ok(())
        };
    };

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for name in required {
        if !obj.contains_key(name) {
            return Err(format!("missing required field '{name}'"));
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in obj {
        let expected = properties
            .get(key)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);
        if let Some(expected) = expected {
            if !matches_type(value, expected) {
                return Err(format!(
                    "field '{key}' expected type '{expected}', got {}",
                    type_name(value)
                ));
            }
        }
    }
    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
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

    fn search_schema() -> Value {
        SchemaBuilder::object()
            .string("q", "query", true)
            .property("limit", json!({"type": "integer"}), false)
            .build()
    }

    #[test]
    fn accepts_valid_input() {
        assert!(validate_input(&json!({"q": "rust", "limit": 3}), &search_schema()).is_ok());
    }

    #[test]
    fn reports_missing_required_field() {
        let err = validate_input(&json!({"limit": 3}), &search_schema()).unwrap_err();
        assert_eq!(err, "missing required field 'q'");
    }

    #[test]
    fn reports_type_mismatch() {
        let err = validate_input(&json!({"q": 7}), &search_schema()).unwrap_err();
        assert!(err.contains("expected type 'string'"));
    }

    #[test]
    fn rejects_non_object_input() {
        assert!(validate_input(&json!("q"), &search_schema()).is_err());
    }
}
