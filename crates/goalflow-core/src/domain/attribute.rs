use crate::domain::step::ScriptConfig;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a step relates to an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeRole {
    /// Must be present in flow state before the step can run
    Required,
    /// Used when present, otherwise defaulted
    Optional,
    /// Always taken from the step's own default literal
    Const,
    /// Produced by the step
    Output,
}

impl AttributeRole {
    /// Required and optional roles pull values from flow state
    pub fn is_input(&self) -> bool {
        matches!(self, AttributeRole::Required | AttributeRole::Optional)
    }

    /// Rank used when merging roles from several consumers
    fn strictness(&self) -> u8 {
        match self {
            AttributeRole::Required => 3,
            AttributeRole::Optional => 2,
            AttributeRole::Const => 1,
            AttributeRole::Output => 0,
        }
    }

    /// The more restrictive of two roles
    pub fn merge(self, other: AttributeRole) -> AttributeRole {
        if other.strictness() > self.strictness() {
            other
        } else {
            self
        }
    }
}

/// JSON type of an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
    #[default]
    Any,
}

impl AttributeType {
    /// Whether a value conforms to this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            AttributeType::String => value.is_string(),
            AttributeType::Number => value.is_number(),
            AttributeType::Boolean => value.is_boolean(),
            AttributeType::Object => value.is_object(),
            AttributeType::Array => value.is_array(),
            AttributeType::Null => value.is_null(),
            AttributeType::Any => true,
        }
    }

    /// Value used for an optional input that has neither state nor default
    pub fn zero_value(&self) -> Value {
        match self {
            AttributeType::String => Value::String(String::new()),
            AttributeType::Number => Value::from(0),
            AttributeType::Boolean => Value::Bool(false),
            AttributeType::Object => Value::Object(serde_json::Map::new()),
            AttributeType::Array => Value::Array(Vec::new()),
            AttributeType::Null | AttributeType::Any => Value::Null,
        }
    }

    /// Mismatched types widen to `Any`
    pub fn widen(self, other: AttributeType) -> AttributeType {
        if self == other {
            self
        } else {
            AttributeType::Any
        }
    }
}

/// Rename or transform applied at a step boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AttributeMapping {
    /// Parameter name on the step side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Transform applied to the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptConfig>,
}

/// Declaration of one attribute on a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    /// Role of the attribute
    pub role: AttributeRole,

    /// Declared JSON type
    #[serde(rename = "type", default)]
    pub kind: AttributeType,

    /// Declared default literal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Each array element becomes an independent work item
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub for_each: bool,

    /// Boundary rename/transform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<AttributeMapping>,
}

impl AttributeSpec {
    /// Shorthand for an attribute with the given role and type
    pub fn new(role: AttributeRole, kind: AttributeType) -> Self {
        Self {
            role,
            kind,
            default: None,
            for_each: false,
            mapping: None,
        }
    }

    /// Set the default literal
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark the attribute as a for-each input
    pub fn for_each(mut self) -> Self {
        self.for_each = true;
        self
    }

    /// Set the boundary mapping
    pub fn with_mapping(mut self, mapping: AttributeMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn is_input(&self) -> bool {
        self.role.is_input()
    }

    pub fn is_required(&self) -> bool {
        self.role == AttributeRole::Required
    }

    pub fn is_optional(&self) -> bool {
        self.role == AttributeRole::Optional
    }

    pub fn is_const(&self) -> bool {
        self.role == AttributeRole::Const
    }

    pub fn is_output(&self) -> bool {
        self.role == AttributeRole::Output
    }

    /// Default literal, falling back to the type's zero value
    pub fn default_or_zero(&self) -> Value {
        self.default
            .clone()
            .unwrap_or_else(|| self.kind.zero_value())
    }

    /// Validate the declaration of attribute `name`
    pub fn validate(&self, name: &str) -> Result<(), CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::InvalidStepDefinition(
                "attribute name must not be empty".to_string(),
            ));
        }

        if self.is_const() && self.default.is_none() {
            return Err(CoreError::InvalidStepDefinition(format!(
                "const attribute '{}' requires a default",
                name
            )));
        }

        if let Some(default) = &self.default {
            if !matches!(self.role, AttributeRole::Optional | AttributeRole::Const) {
                return Err(CoreError::InvalidStepDefinition(format!(
                    "attribute '{}' may only declare a default when optional or const",
                    name
                )));
            }
            if !self.kind.matches(default) {
                return Err(CoreError::InvalidStepDefinition(format!(
                    "default for attribute '{}' does not match type {:?}",
                    name, self.kind
                )));
            }
        }

        if self.for_each {
            if !self.is_input() {
                return Err(CoreError::InvalidStepDefinition(format!(
                    "for_each attribute '{}' must be an input",
                    name
                )));
            }
            if !matches!(self.kind, AttributeType::Array | AttributeType::Any) {
                return Err(CoreError::InvalidStepDefinition(format!(
                    "for_each attribute '{}' must be of type array or any",
                    name
                )));
            }
        }

        if let Some(mapping) = &self.mapping {
            if self.is_const() {
                return Err(CoreError::InvalidStepDefinition(format!(
                    "const attribute '{}' cannot declare a mapping",
                    name
                )));
            }
            if let Some(script) = &mapping.script {
                script.validate()?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_merge_prefers_required() {
        assert_eq!(
            AttributeRole::Optional.merge(AttributeRole::Required),
            AttributeRole::Required
        );
        assert_eq!(
            AttributeRole::Required.merge(AttributeRole::Optional),
            AttributeRole::Required
        );
        assert_eq!(
            AttributeRole::Optional.merge(AttributeRole::Optional),
            AttributeRole::Optional
        );
    }

    #[test]
    fn test_type_widening() {
        assert_eq!(AttributeType::Number.widen(AttributeType::Number), AttributeType::Number);
        assert_eq!(AttributeType::Number.widen(AttributeType::String), AttributeType::Any);
    }

    #[test]
    fn test_const_requires_default() {
        let spec = AttributeSpec::new(AttributeRole::Const, AttributeType::String);
        assert!(matches!(
            spec.validate("mode"),
            Err(CoreError::InvalidStepDefinition(_))
        ));

        let spec = spec.with_default(json!("fast"));
        assert!(spec.validate("mode").is_ok());
    }

    #[test]
    fn test_required_cannot_have_default() {
        let spec = AttributeSpec::new(AttributeRole::Required, AttributeType::Number)
            .with_default(json!(1));
        assert!(spec.validate("n").is_err());
    }

    #[test]
    fn test_default_must_match_type() {
        let spec = AttributeSpec::new(AttributeRole::Optional, AttributeType::Number)
            .with_default(json!("ten"));
        assert!(spec.validate("n").is_err());
    }

    #[test]
    fn test_for_each_requires_array_input() {
        let ok = AttributeSpec::new(AttributeRole::Required, AttributeType::Array).for_each();
        assert!(ok.validate("items").is_ok());

        let wrong_type = AttributeSpec::new(AttributeRole::Required, AttributeType::String).for_each();
        assert!(wrong_type.validate("items").is_err());

        let output = AttributeSpec::new(AttributeRole::Output, AttributeType::Array).for_each();
        assert!(output.validate("items").is_err());
    }

    #[test]
    fn test_const_rejects_mapping() {
        let spec = AttributeSpec::new(AttributeRole::Const, AttributeType::String)
            .with_default(json!("x"))
            .with_mapping(AttributeMapping {
                name: Some("y".to_string()),
                script: None,
            });
        assert!(spec.validate("c").is_err());
    }

    #[test]
    fn test_deserialize_attribute() {
        let spec: AttributeSpec = serde_json::from_value(json!({
            "role": "optional",
            "type": "number",
            "default": 3
        }))
        .unwrap();
        assert_eq!(spec.role, AttributeRole::Optional);
        assert_eq!(spec.kind, AttributeType::Number);
        assert_eq!(spec.default_or_zero(), json!(3));
        assert!(!spec.for_each);
    }

    #[test]
    fn test_zero_values() {
        let spec = AttributeSpec::new(AttributeRole::Optional, AttributeType::Array);
        assert_eq!(spec.default_or_zero(), json!([]));
        assert_eq!(AttributeType::Any.zero_value(), Value::Null);
    }
}
