use crate::transport::parser::{META_ISSUE_INVALID, META_ISSUE_MISSING, MetaBlock, ParseIssue};
use serde_json::Value;

/// A plugin-declared META channel. The model emits one META block per
/// plugin; `required` plugins missing from a response fail the turn.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaPlugin {
    pub name: String,
    pub schema: Value,
    pub required: bool,
}

impl MetaPlugin {
    pub fn new(name: impl Into<String>, schema: Value, required: bool) -> Self {
        Self {
            name: name.into(),
            schema,
            required,
        }
    }
}

/// Check extracted META blocks against the configured plugins. Returns the
/// issues to fold into turn-failure classification: missing required blocks
/// and blocks whose payload violates the plugin schema.
pub fn evaluate_meta_blocks(plugins: &[MetaPlugin], blocks: &[MetaBlock]) -> Vec<ParseIssue> {
    let mut issues = Vec::new();
    for plugin in plugins {
        let declared: Vec<&MetaBlock> = blocks
            .iter()
            .filter(|block| block.plugin == plugin.name)
            .collect();
        if declared.is_empty() {
            if plugin.required {
                issues.push(ParseIssue::new(
                    META_ISSUE_MISSING,
                    format!("required META block '{}' was not produced", plugin.name),
                ));
            }
            continue;
        }
        for block in declared {
            if let Err(reason) = validate_against_schema(&block.payload, &plugin.schema) {
                issues.push(ParseIssue::new(
                    META_ISSUE_INVALID,
                    format!("META block '{}' failed validation: {reason}", plugin.name),
                ));
            }
        }
    }
    issues
}

/// Minimal structural validation: `type`, `required`, and nested
/// `properties` are honored; anything else in the schema is ignored.
pub fn validate_against_schema(value: &Value, schema: &Value) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let matches = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            return Err(format!("expected {expected}, got {}", type_name(value)));
        }
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if value.get(field).is_none() {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }
    if let (Some(properties), Some(object)) = (
        schema.get("properties").and_then(Value::as_object),
        value.as_object(),
    ) {
        for (field, field_schema) in properties {
            if let Some(field_value) = object.get(field) {
                validate_against_schema(field_value, field_schema)
                    .map_err(|reason| format!("field '{field}': {reason}"))?;
            }
        }
    }
    Ok(())
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

    fn audit_plugin(required: bool) -> MetaPlugin {
        MetaPlugin::new(
            "audit",
            json!({
                "type": "object",
                "required": ["score"],
                "properties": {"score": {"type": "integer"}}
            }),
            required,
        )
    }

    #[test]
    fn missing_required_plugin_reports_meta_missing() {
        let issues = evaluate_meta_blocks(&[audit_plugin(true)], &[]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].slug, META_ISSUE_MISSING);
    }

    #[test]
    fn missing_optional_plugin_reports_nothing() {
        assert!(evaluate_meta_blocks(&[audit_plugin(false)], &[]).is_empty());
    }

    #[test]
    fn schema_violation_reports_meta_invalid() {
        let blocks = vec![MetaBlock {
            plugin: "audit".to_string(),
            payload: json!({"score": "high"}),
        }];
        let issues = evaluate_meta_blocks(&[audit_plugin(true)], &blocks);
        assert_eq!(issues[0].slug, META_ISSUE_INVALID);
    }

    #[test]
    fn conforming_block_passes() {
        let blocks = vec![MetaBlock {
            plugin: "audit".to_string(),
            payload: json!({"score": 4}),
        }];
        assert!(evaluate_meta_blocks(&[audit_plugin(true)], &blocks).is_empty());
    }
}
