//! Identifiers and value containers shared across the engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Attribute values keyed by attribute name.
///
/// `serde_json::Value` is the tagged union over string, number, boolean,
/// null, list and map that attribute values take. A `BTreeMap` keeps
/// iteration (and therefore serialized snapshots) deterministic.
pub type Args = BTreeMap<String, serde_json::Value>;

/// Value object: Step ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

/// Value object: Flow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

/// Value object: dispatch token
///
/// Unique per dispatch attempt. A retry replaces the token, so results
/// carrying the previous one no longer match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token(pub String);

impl Token {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        Token(Uuid::new_v4().to_string())
    }
}

impl FlowId {
    /// ID of the nested flow started for one work item of a sub-flow step
    pub fn child(&self, step_id: &StepId, token: &Token) -> FlowId {
        FlowId(format!("{}:{}:{}", self.0, step_id.0, token.0))
    }
}

macro_rules! id_conversions {
    ($($ty:ident),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $ty {
                fn from(value: &str) -> Self {
                    $ty(value.to_string())
                }
            }

            impl From<String> for $ty {
                fn from(value: String) -> Self {
                    $ty(value)
                }
            }

            impl AsRef<str> for $ty {
                fn as_ref(&self) -> &str {
                    &self.0
                }
            }
        )*
    };
}

id_conversions!(StepId, FlowId, Token);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_differ() {
        assert_ne!(Token::generate(), Token::generate());
    }

    #[test]
    fn test_child_flow_id() {
        let parent = FlowId::from("order-1");
        let child = parent.child(&StepId::from("ship"), &Token::from("t1"));
        assert_eq!(child.to_string(), "order-1:ship:t1");
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let mut map = BTreeMap::new();
        map.insert(StepId::from("a"), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"a":1}"#);

        let back: BTreeMap<StepId, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&StepId::from("a")), Some(&1));
    }
}
