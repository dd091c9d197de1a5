use async_trait::async_trait;
use serde_json::{Map, Value, json};

/// A capability the model can invoke. Tools return their outcome as a
/// string, including failures (`"Error: …"`); the agent loop depends on
/// errors being values rather than panics.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema (object-typed) for the arguments.
    fn parameters(&self) -> Value;

    async fn execute(&self, params: &Map<String, Value>) -> anyhow::Result<String>;

    /// Walk the declared schema and collect violations. Empty = valid.
    fn validate_params(&self, params: &Map<String, Value>) -> Vec<String> {
        let schema = self.parameters();
        if schema.get("type").and_then(Value::as_str).unwrap_or("object") != "object" {
            return vec![format!("schema for {} must be object type", self.name())];
        }
        validate_value(&Value::Object(params.clone()), &schema, "")
    }

    /// Wire form for the provider's tool-calling interface.
    fn to_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": self.parameters(),
            }
        })
    }
}

fn label(path: &str) -> &str {
    if path.is_empty() { "parameter" } else { path }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn validate_value(value: &Value, schema: &Value, path: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let schema_type = schema
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("object");

    match schema_type {
        "string" => match value.as_str() {
            Some(s) => {
                if let Some(min) = schema.get("minLength").and_then(Value::as_u64)
                    && (s.len() as u64) < min
                {
                    errors.push(format!("{} must be at least {min} chars", label(path)));
                }
                if let Some(max) = schema.get("maxLength").and_then(Value::as_u64)
                    && (s.len() as u64) > max
                {
                    errors.push(format!("{} must be at most {max} chars", label(path)));
                }
            }
            None => return vec![format!("{} should be string", label(path))],
        },
        "integer" => match value.as_i64() {
            Some(num) => {
                if let Some(min) = schema.get("minimum").and_then(Value::as_i64)
                    && num < min
                {
                    errors.push(format!("{} must be >= {min}", label(path)));
                }
                if let Some(max) = schema.get("maximum").and_then(Value::as_i64)
                    && num > max
                {
                    errors.push(format!("{} must be <= {max}", label(path)));
                }
            }
            None => return vec![format!("{} should be integer", label(path))],
        },
        "number" => match value.as_f64() {
            Some(num) => {
                if let Some(min) = schema.get("minimum").and_then(Value::as_f64)
                    && num < min
                {
                    errors.push(format!("{} must be >= {min}", label(path)));
                }
                if let Some(max) = schema.get("maximum").and_then(Value::as_f64)
                    && num > max
                {
                    errors.push(format!("{} must be <= {max}", label(path)));
                }
            }
            None => return vec![format!("{} should be number", label(path))],
        },
        "boolean" => {
            if !value.is_boolean() {
                return vec![format!("{} should be boolean", label(path))];
            }
        }
        "array" => match value.as_array() {
            Some(items) => {
                if let Some(item_schema) = schema.get("items") {
                    for (idx, item) in items.iter().enumerate() {
                        let item_path = format!("{}[{idx}]", path);
                        errors.extend(validate_value(item, item_schema, &item_path));
                    }
                }
            }
            None => return vec![format!("{} should be array", label(path))],
        },
        "object" => match value.as_object() {
            Some(obj) => {
                if let Some(required) = schema.get("required").and_then(Value::as_array) {
                    for key in required.iter().filter_map(Value::as_str) {
                        if !obj.contains_key(key) {
                            errors.push(format!("missing required {}", child_path(path, key)));
                        }
                    }
                }
                let props = schema.get("properties").and_then(Value::as_object);
                for (key, item) in obj {
                    if let Some(prop_schema) = props.and_then(|p| p.get(key)) {
                        errors.extend(validate_value(item, prop_schema, &child_path(path, key)));
                    }
                }
            }
            None => return vec![format!("{} should be object", label(path))],
        },
        _ => {}
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array)
        && !allowed.iter().any(|candidate| candidate == value)
    {
        errors.push(format!(
            "{} must be one of {}",
            label(path),
            Value::Array(allowed.clone())
        ));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::ToolRegistry;

    struct SampleTool;

    #[async_trait]
    impl Tool for SampleTool {
        fn name(&self) -> &str {
            "sample"
        }

        fn description(&self) -> &str {
            "sample tool"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "minLength": 2 },
                    "count": { "type": "integer", "minimum": 1, "maximum": 10 },
                    "mode": { "type": "string", "enum": ["fast", "full"] },
                    "meta": {
                        "type": "object",
                        "properties": {
                            "tag": { "type": "string" },
                            "flags": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["tag"]
                    }
                },
                "required": ["query", "count"]
            })
        }

        async fn execute(&self, _params: &Map<String, Value>) -> anyhow::Result<String> {
            Ok("ok".to_string())
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn validate_flags_missing_required() {
        let errors = SampleTool.validate_params(&params(json!({ "query": "hi" })));
        assert!(errors.iter().any(|e| e.contains("missing required count")));
    }

    #[test]
    fn validate_checks_type_and_range() {
        let errors = SampleTool.validate_params(&params(json!({ "query": "hi", "count": 0 })));
        assert!(errors.iter().any(|e| e.contains("count must be >= 1")));

        let errors = SampleTool.validate_params(&params(json!({ "query": "hi", "count": "2" })));
        assert!(errors.iter().any(|e| e.contains("count should be integer")));
    }

    #[test]
    fn validate_checks_enum_and_min_length() {
        let errors =
            SampleTool.validate_params(&params(json!({ "query": "h", "count": 2, "mode": "slow" })));
        assert!(
            errors
                .iter()
                .any(|e| e.contains("query must be at least 2 chars"))
        );
        assert!(errors.iter().any(|e| e.contains("mode must be one of")));
    }

    #[test]
    fn validate_descends_into_nested_objects_and_arrays() {
        let errors = SampleTool.validate_params(&params(json!({
            "query": "hi",
            "count": 2,
            "meta": { "flags": [1, "ok"] }
        })));
        assert!(
            errors
                .iter()
                .any(|e| e.contains("missing required meta.tag"))
        );
        assert!(
            errors
                .iter()
                .any(|e| e.contains("meta.flags[0] should be string"))
        );
    }

    #[test]
    fn validate_ignores_unknown_fields() {
        let errors =
            SampleTool.validate_params(&params(json!({ "query": "hi", "count": 2, "extra": "x" })));
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn registry_surfaces_validation_errors_as_strings() {
        let mut registry = ToolRegistry::new();
        registry.register(std::sync::Arc::new(SampleTool));
        let result = registry
            .execute("sample", &params(json!({ "query": "hi" })))
            .await;
        assert!(result.contains("Invalid parameters"));
        assert!(result.contains("count"));
    }
}
