//! Attribute mapping at step boundaries
//!
//! Input mappings rename and transform arguments before they are sent to a
//! step. Output mappings read the step's raw result under the mapped name
//! and transform it back. A mapping script sees the single attribute value:
//! JMESPath queries the value directly, JEXL sees it as `value`.

use crate::application::script;
use crate::domain::attribute::AttributeSpec;
use crate::domain::step::{ScriptConfig, ScriptLanguage, Step, SubflowConfig};
use crate::{Args, CoreError};
use serde_json::{json, Value};

/// Arguments as the step expects them
pub fn map_inputs(step: &Step, inputs: &Args) -> Result<Args, CoreError> {
    let mut mapped = Args::new();
    for (name, value) in inputs {
        match step.attributes.get(name) {
            Some(spec) if !spec.is_output() => {
                let (target, value) = map_input(name, spec, value)?;
                mapped.insert(target, value);
            }
            _ => {
                mapped.insert(name.clone(), value.clone());
            }
        }
    }
    Ok(mapped)
}

fn map_input(name: &str, spec: &AttributeSpec, value: &Value) -> Result<(String, Value), CoreError> {
    let Some(mapping) = &spec.mapping else {
        return Ok((name.to_string(), value.clone()));
    };
    let value = match &mapping.script {
        Some(config) => transform(name, config, value)?,
        None => value.clone(),
    };
    let target = mapping.name.clone().unwrap_or_else(|| name.to_string());
    Ok((target, value))
}

/// Declared outputs extracted from a step's raw result
///
/// Anything the step returns that is not a declared output is dropped.
pub fn map_outputs(step: &Step, raw: &Args) -> Result<Args, CoreError> {
    let mut outputs = Args::new();
    for (name, spec) in step.attributes.iter().filter(|(_, s)| s.is_output()) {
        let source = spec
            .mapping
            .as_ref()
            .and_then(|m| m.name.as_deref())
            .unwrap_or(name);
        let Some(value) = raw.get(source) else {
            continue;
        };
        let value = match spec.mapping.as_ref().and_then(|m| m.script.as_ref()) {
            Some(config) => transform(name, config, value)?,
            None => value.clone(),
        };
        outputs.insert(name.clone(), value);
    }
    Ok(outputs)
}

/// Initial state for a nested flow, renamed through `input_map`
pub fn subflow_init(config: &SubflowConfig, inputs: &Args) -> Args {
    inputs
        .iter()
        .map(|(name, value)| {
            let target = config.input_map.get(name).unwrap_or(name);
            (target.clone(), value.clone())
        })
        .collect()
}

/// Raw parent outputs from a nested flow's final state
///
/// Child attributes named in `output_map` are renamed; everything else is
/// passed through under its own name. [`map_outputs`] then keeps the
/// parent step's declared outputs.
pub fn subflow_outputs(config: &SubflowConfig, child_state: &Args) -> Args {
    let mut raw = child_state.clone();
    for (child_name, parent_name) in &config.output_map {
        if let Some(value) = child_state.get(child_name) {
            raw.insert(parent_name.clone(), value.clone());
        }
    }
    raw
}

fn transform(name: &str, config: &ScriptConfig, value: &Value) -> Result<Value, CoreError> {
    let input = match config.language()? {
        ScriptLanguage::Jmespath => value.clone(),
        ScriptLanguage::Jexl | ScriptLanguage::Lua => json!({ "value": value }),
    };
    script::evaluate(config, &input)
        .map_err(|e| CoreError::Mapping(format!("attribute '{}': {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::attribute::{AttributeMapping, AttributeRole, AttributeType};
    use crate::domain::step::StepType;
    use std::collections::BTreeMap;

    fn args(value: Value) -> Args {
        serde_json::from_value(value).unwrap()
    }

    fn mapped(role: AttributeRole, name: Option<&str>, script: Option<ScriptConfig>) -> AttributeSpec {
        AttributeSpec::new(role, AttributeType::Any).with_mapping(AttributeMapping {
            name: name.map(str::to_string),
            script,
        })
    }

    #[test]
    fn test_input_rename_and_transform() {
        let step = Step::new("s", StepType::Sync)
            .with_http("http://localhost/s")
            .with_attribute("customer", mapped(AttributeRole::Required, Some("customerId"), None))
            .with_attribute(
                "order",
                mapped(
                    AttributeRole::Required,
                    None,
                    Some(ScriptConfig::new("jmespath", "id")),
                ),
            )
            .with_attribute("plain", AttributeSpec::new(AttributeRole::Optional, AttributeType::Any));

        let inputs = args(json!({"customer": "c1", "order": {"id": 7}, "plain": true}));
        let mapped = map_inputs(&step, &inputs).unwrap();
        assert_eq!(mapped, args(json!({"customerId": "c1", "order": 7, "plain": true})));
    }

    #[test]
    fn test_output_mapping_keeps_declared_outputs() {
        let step = Step::new("s", StepType::Sync)
            .with_http("http://localhost/s")
            .with_attribute("total", mapped(AttributeRole::Output, Some("sum"), None))
            .with_attribute(
                "label",
                mapped(
                    AttributeRole::Output,
                    None,
                    Some(ScriptConfig::new("jexl", "value + '!'")),
                ),
            );

        let raw = args(json!({"sum": 10, "label": "done", "noise": 1}));
        let outputs = map_outputs(&step, &raw).unwrap();
        assert_eq!(outputs, args(json!({"total": 10, "label": "done!"})));
    }

    #[test]
    fn test_mapping_script_error() {
        let step = Step::new("s", StepType::Sync)
            .with_http("http://localhost/s")
            .with_attribute(
                "x",
                mapped(AttributeRole::Required, None, Some(ScriptConfig::new("jmespath", "[[["))),
            );
        let err = map_inputs(&step, &args(json!({"x": 1}))).unwrap_err();
        assert!(matches!(err, CoreError::Mapping(_)));
    }

    #[test]
    fn test_subflow_maps() {
        let config = SubflowConfig {
            goals: vec![],
            input_map: BTreeMap::from([("order".to_string(), "order_id".to_string())]),
            output_map: BTreeMap::from([("receipt_id".to_string(), "receipt".to_string())]),
        };
        let init = subflow_init(&config, &args(json!({"order": 1, "user": "u"})));
        assert_eq!(init, args(json!({"order_id": 1, "user": "u"})));

        let step = Step::new("parent", StepType::Flow)
            .with_attribute("receipt", AttributeSpec::new(AttributeRole::Output, AttributeType::Any))
            .with_attribute("status", AttributeSpec::new(AttributeRole::Output, AttributeType::Any));
        let raw = subflow_outputs(
            &config,
            &args(json!({"receipt_id": "r1", "status": "ok", "internal": 3})),
        );
        let outputs = map_outputs(&step, &raw).unwrap();
        assert_eq!(outputs, args(json!({"receipt": "r1", "status": "ok"})));
    }
}
