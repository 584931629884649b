//! Static step definitions
//!
//! A step is registered once in the catalog and may be used by any number
//! of flows. It declares the attributes it consumes and produces plus the
//! configuration for exactly one execution modality.

use crate::domain::attribute::AttributeSpec;
use crate::{CoreError, StepId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Execution modality of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// HTTP call answered inline
    Sync,
    /// HTTP call answered later through the webhook
    Async,
    /// Embedded script evaluated in-process
    Script,
    /// Nested flow
    Flow,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Sync => "sync",
            StepType::Async => "async",
            StepType::Script => "script",
            StepType::Flow => "flow",
        }
    }
}

/// Supported script languages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLanguage {
    Jexl,
    Jmespath,
    Lua,
}

impl FromStr for ScriptLanguage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jexl" => Ok(ScriptLanguage::Jexl),
            "jmespath" => Ok(ScriptLanguage::Jmespath),
            "lua" => Ok(ScriptLanguage::Lua),
            other => Err(CoreError::InvalidStepDefinition(format!(
                "unsupported script language: {}",
                other
            ))),
        }
    }
}

/// HTTP configuration for sync and async steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,

    /// Per-call timeout; the engine default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Script body plus language, used for script steps, predicates and mappings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub language: String,
    pub script: String,
}

impl ScriptConfig {
    pub fn new(language: &str, script: &str) -> Self {
        Self {
            language: language.to_string(),
            script: script.to_string(),
        }
    }

    /// Parsed language
    pub fn language(&self) -> Result<ScriptLanguage, CoreError> {
        self.language.parse()
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.language()?;
        if self.script.trim().is_empty() {
            return Err(CoreError::InvalidStepDefinition(
                "script body must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Nested flow configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubflowConfig {
    /// Goals of the nested flow
    pub goals: Vec<StepId>,

    /// Parent input name to child init name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_map: BTreeMap<String, String>,

    /// Child attribute name to parent output name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_map: BTreeMap<String, String>,
}

/// Delay schedule between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Per-step override of the engine's retry policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_type: Option<BackoffType>,

    /// Maximum concurrently active work items of a for-each step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

/// A registered unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique key
    pub id: StepId,

    /// Display name
    pub name: String,

    /// Execution modality
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Version, part of the memoization key
    pub version: String,

    /// Attribute declarations keyed by name
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<SubflowConfig>,

    /// Gate evaluated on the collected inputs before dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<ScriptConfig>,

    /// Cache successful outputs keyed by inputs
    #[serde(default)]
    pub memoizable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_config: Option<WorkConfig>,
}

impl Step {
    /// Create a step of the given type with no attributes or configuration
    pub fn new(id: impl Into<StepId>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.0.clone(),
            id,
            step_type,
            version: "1".to_string(),
            attributes: BTreeMap::new(),
            http: None,
            script: None,
            flow: None,
            predicate: None,
            memoizable: false,
            work_config: None,
        }
    }

    /// Add an attribute declaration
    pub fn with_attribute(mut self, name: &str, spec: AttributeSpec) -> Self {
        self.attributes.insert(name.to_string(), spec);
        self
    }

    pub fn with_http(mut self, endpoint: &str) -> Self {
        self.http = Some(HttpConfig {
            endpoint: endpoint.to_string(),
            health_check: None,
            timeout_ms: None,
        });
        self
    }

    /// Set the health-check URL of an HTTP step
    pub fn with_health_check(mut self, url: &str) -> Self {
        if let Some(http) = self.http.as_mut() {
            http.health_check = Some(url.to_string());
        }
        self
    }

    pub fn with_script(mut self, language: &str, script: &str) -> Self {
        self.script = Some(ScriptConfig::new(language, script));
        self
    }

    pub fn with_subflow(mut self, goals: Vec<StepId>) -> Self {
        self.flow = Some(SubflowConfig {
            goals,
            input_map: BTreeMap::new(),
            output_map: BTreeMap::new(),
        });
        self
    }

    pub fn with_predicate(mut self, language: &str, script: &str) -> Self {
        self.predicate = Some(ScriptConfig::new(language, script));
        self
    }

    pub fn with_work_config(mut self, work_config: WorkConfig) -> Self {
        self.work_config = Some(work_config);
        self
    }

    /// Required and optional inputs
    pub fn inputs(&self) -> impl Iterator<Item = (&String, &AttributeSpec)> {
        self.attributes.iter().filter(|(_, a)| a.is_input())
    }

    /// Required inputs only
    pub fn required_inputs(&self) -> impl Iterator<Item = &String> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.is_required())
            .map(|(name, _)| name)
    }

    /// Optional inputs only
    pub fn optional_inputs(&self) -> impl Iterator<Item = &String> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.is_optional())
            .map(|(name, _)| name)
    }

    /// Declared outputs
    pub fn outputs(&self) -> impl Iterator<Item = &String> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.is_output())
            .map(|(name, _)| name)
    }

    pub fn has_for_each(&self) -> bool {
        self.attributes.values().any(|a| a.for_each)
    }

    /// Check the definition is complete and consistent with its type
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.0.trim().is_empty() {
            return Err(CoreError::InvalidStepDefinition(
                "step id must not be empty".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidStepDefinition(format!(
                "step '{}' must have a name",
                self.id
            )));
        }
        if self.version.trim().is_empty() {
            return Err(CoreError::InvalidStepDefinition(format!(
                "step '{}' must have a version",
                self.id
            )));
        }

        let configured = [self.http.is_some(), self.script.is_some(), self.flow.is_some()]
            .iter()
            .filter(|c| **c)
            .count();
        if configured != 1 {
            return Err(CoreError::InvalidStepDefinition(format!(
                "step '{}' must declare exactly one of http, script or flow configuration",
                self.id
            )));
        }

        match self.step_type {
            StepType::Sync | StepType::Async => match &self.http {
                Some(http) if http.health_check.as_deref().is_some_and(|u| u.trim().is_empty()) => {
                    return Err(CoreError::InvalidStepDefinition(format!(
                        "step '{}' has an empty health check url",
                        self.id
                    )))
                }
                Some(http) if !http.endpoint.trim().is_empty() => {}
                _ => {
                    return Err(CoreError::InvalidStepDefinition(format!(
                        "{} step '{}' requires an http endpoint",
                        self.step_type.as_str(),
                        self.id
                    )))
                }
            },
            StepType::Script => match &self.script {
                Some(script) => script.validate()?,
                None => {
                    return Err(CoreError::InvalidStepDefinition(format!(
                        "script step '{}' requires a script configuration",
                        self.id
                    )))
                }
            },
            StepType::Flow => match &self.flow {
                Some(flow) if !flow.goals.is_empty() => {}
                _ => {
                    return Err(CoreError::InvalidStepDefinition(format!(
                        "flow step '{}' requires at least one sub-flow goal",
                        self.id
                    )))
                }
            },
        }

        if let Some(predicate) = &self.predicate {
            predicate.validate()?;
        }

        for (name, attribute) in &self.attributes {
            attribute.validate(name)?;
        }

        Ok(())
    }
}
