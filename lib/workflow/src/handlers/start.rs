//! The `start` node: declares the run input and emits it.

use crate::error::{NodeError, ValidationError};
use crate::handler::{NodeContext, NodeHandler, NodeOutcome, NodeOutput, parse_config};
use crate::interpolate::INPUT_VAR;
use crate::node::NodeKind;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

/// Declared JSON type of an input variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    #[serde(other)]
    Any,
}

impl VariableType {
    fn accepts(self, value: &JsonValue) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// One declared input field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputVariable {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: VariableType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_value: Option<JsonValue>,
}

/// Configuration of a `start` node.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConfig {
    #[serde(default)]
    pub input_variables: Vec<InputVariable>,
}

impl StartConfig {
    /// Checks `input` against the declared variables and fills defaults.
    ///
    /// Fields that are not declared pass through untouched. A `null` input
    /// is treated as an empty object.
    ///
    /// # Errors
    ///
    /// Returns every missing or mistyped field.
    pub fn apply(&self, input: JsonValue) -> Result<JsonValue, Vec<ValidationError>> {
        let mut fields = match input {
            JsonValue::Null => Map::new(),
            JsonValue::Object(map) => map,
            other => {
                return Err(vec![ValidationError::InvalidInput {
                    name: INPUT_VAR.to_string(),
                    expected: "object".to_string(),
                    found: json_type_name(&other).to_string(),
                }]);
            }
        };

        let mut errors = Vec::new();
        for var in &self.input_variables {
            match fields.get(&var.name) {
                Some(value) if !value.is_null() => {
                    if !var.kind.accepts(value) {
                        errors.push(ValidationError::InvalidInput {
                            name: var.name.clone(),
                            expected: var.kind.name().to_string(),
                            found: json_type_name(value).to_string(),
                        });
                    }
                }
                _ => match &var.default_value {
                    Some(default) => {
                        fields.insert(var.name.clone(), default.clone());
                    }
                    None if var.required => errors.push(ValidationError::MissingInput {
                        name: var.name.clone(),
                    }),
                    None => {}
                },
            }
        }

        if errors.is_empty() {
            Ok(JsonValue::Object(fields))
        } else {
            Err(errors)
        }
    }
}

/// Emits the run input.
#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Start
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), String> {
        parse_config::<StartConfig>(config).map(|_| ())
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let input = ctx
            .variables
            .get(INPUT_VAR)
            .cloned()
            .unwrap_or(JsonValue::Null);
        Ok(NodeOutcome::Completed(NodeOutput::pure(input)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> StartConfig {
        parse_config(&json!({
            "inputVariables": [
                {"name": "question", "type": "string", "required": true},
                {"name": "limit", "type": "number", "defaultValue": 5},
                {"name": "extra", "type": "whatever"}
            ]
        }))
        .expect("config")
    }

    #[test]
    fn fills_defaults_and_keeps_extra_fields() {
        let input = config()
            .apply(json!({"question": "Hi", "other": true}))
            .expect("valid");
        assert_eq!(input, json!({"question": "Hi", "limit": 5, "other": true}));
    }

    #[test]
    fn unknown_types_accept_anything() {
        assert_eq!(config().input_variables[2].kind, VariableType::Any);
    }

    #[test]
    fn reports_every_problem() {
        let errors = config()
            .apply(json!({"limit": "ten"}))
            .unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::MissingInput {
                    name: "question".to_string()
                },
                ValidationError::InvalidInput {
                    name: "limit".to_string(),
                    expected: "number".to_string(),
                    found: "string".to_string(),
                },
            ]
        );
    }

    #[test]
    fn non_object_input_is_rejected() {
        let errors = StartConfig::default().apply(json!([1, 2])).unwrap_err();
        assert!(matches!(errors[0], ValidationError::InvalidInput { .. }));
        assert_eq!(StartConfig::default().apply(JsonValue::Null), Ok(json!({})));
    }
}
