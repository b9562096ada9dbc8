//! Input schemas
//!
//! A small JSON-Schema subset: an object with typed properties and a
//! required list. Serializes to what clients expect under `inputSchema`,
//! and validates arguments before a tool runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Result, ToolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl PropertyType {
    fn matches(self, value: &Value) -> bool {
        match self {
            PropertyType::String => value.is_string(),
            PropertyType::Number => value.is_number(),
            PropertyType::Integer => value.is_i64() || value.is_u64(),
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::Object => value.is_object(),
            PropertyType::Array => value.is_array(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Integer => "integer",
            PropertyType::Boolean => "boolean",
            PropertyType::Object => "object",
            PropertyType::Array => "array",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: PropertyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
}

impl PropertySchema {
    pub fn new(kind: PropertyType, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: Some(description.into()),
            default: None,
            choices: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::new(PropertyType::String, description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::new(PropertyType::Integer, description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::new(PropertyType::Boolean, description)
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn one_of<I, V>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    fn check(&self, name: &str, value: &Value) -> Result<()> {
        if !self.kind.matches(value) {
            return Err(ToolError::invalid(format!(
                "argument '{}' must be of type {}",
                name,
                self.kind.as_str()
            )));
        }
        if let Some(choices) = &self.choices {
            if !choices.contains(value) {
                return Err(ToolError::invalid(format!(
                    "argument '{}' must be one of {}",
                    name,
                    Value::Array(choices.clone())
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Default for ToolSchema {
    fn default() -> Self {
        Self::object()
    }
}

impl ToolSchema {
    /// An object schema with no properties
    pub fn object() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn required_property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.properties.insert(name, schema);
        self
    }

    /// Check required arguments are present and declared ones are well
    /// typed. Undeclared arguments pass through; null counts as absent.
    pub fn validate(&self, arguments: &Map<String, Value>) -> Result<()> {
        for name in &self.required {
            match arguments.get(name) {
                None | Some(Value::Null) => {
                    return Err(ToolError::invalid(format!(
                        "missing required argument '{}'",
                        name
                    )))
                }
                Some(_) => {}
            }
        }

        for (name, value) in arguments {
            if value.is_null() {
                continue;
            }
            if let Some(property) = self.properties.get(name) {
                property.check(name, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ToolSchema {
        ToolSchema::object()
            .required_property("url", PropertySchema::string("Where to go"))
            .property("timeout_ms", PropertySchema::integer("Bound in milliseconds"))
            .property(
                "format",
                PropertySchema::string("Image format").one_of(["png", "jpeg"]),
            )
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_serializes_as_json_schema() {
        let value = serde_json::to_value(
            ToolSchema::object()
                .required_property("message", PropertySchema::string("Text to echo")),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Text to echo"}
                },
                "required": ["message"]
            })
        );
    }

    #[test]
    fn test_empty_schema_has_no_required_list() {
        let value = serde_json::to_value(ToolSchema::object()).unwrap();
        assert_eq!(value, json!({"type": "object", "properties": {}}));
    }

    #[test]
    fn test_valid_arguments_pass() {
        let schema = schema();
        assert!(schema
            .validate(&args(json!({"url": "https://example.com", "timeout_ms": 500})))
            .is_ok());
        // Undeclared arguments are tolerated
        assert!(schema
            .validate(&args(json!({"url": "about:blank", "extra": true})))
            .is_ok());
    }

    #[test]
    fn test_missing_required_argument() {
        let err = schema().validate(&args(json!({"url": null}))).unwrap_err();
        assert!(err.is_invalid_arguments());
        assert!(err.to_string().contains("missing required argument 'url'"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = schema()
            .validate(&args(json!({"url": "about:blank", "timeout_ms": 1.5})))
            .unwrap_err();
        assert!(err.to_string().contains("'timeout_ms' must be of type integer"));
    }

    #[test]
    fn test_enum_rejected() {
        let err = schema()
            .validate(&args(json!({"url": "about:blank", "format": "gif"})))
            .unwrap_err();
        assert!(err.to_string().contains("must be one of"));
    }
}
