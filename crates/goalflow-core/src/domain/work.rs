//! Fan-out of for-each inputs into work items and aggregation of their outputs

use crate::domain::step::Step;
use crate::{Args, CoreError};
use serde_json::Value;
use std::collections::BTreeSet;

/// Upper bound on work items a single step may expand into
pub const MAX_WORK_ITEMS: usize = 10_000;

/// Expand `inputs` into one argument set per work item.
///
/// Each for-each input holding an array contributes one dimension; the
/// items are the cartesian product of all dimensions. A step without
/// for-each inputs yields exactly one item. An empty array yields none.
/// A for-each input that is missing or not an array is a mapping error, so
/// the aggregated outputs always line up with the items.
pub fn expand_work_items(step: &Step, inputs: &Args, max: usize) -> Result<Vec<Args>, CoreError> {
    let dimensions = step
        .attributes
        .iter()
        .filter(|(_, spec)| spec.for_each)
        .map(|(name, _)| match inputs.get(name) {
            Some(Value::Array(values)) => Ok((name, values)),
            Some(other) => Err(CoreError::Mapping(format!(
                "for-each input '{}' of step '{}' must be an array, got {}",
                name,
                step.id,
                json_kind(other)
            ))),
            None => Err(CoreError::Mapping(format!(
                "for-each input '{}' of step '{}' has no value",
                name, step.id
            ))),
        })
        .collect::<Result<Vec<(&String, &Vec<Value>)>, CoreError>>()?;

    let total = dimensions
        .iter()
        .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()));
    match total {
        Some(n) if n <= max => {}
        _ => {
            return Err(CoreError::Other(format!(
                "step '{}' expands to more than {} work items",
                step.id, max
            )))
        }
    }

    let mut items = vec![inputs.clone()];
    for (name, values) in dimensions {
        let mut next = Vec::with_capacity(items.len() * values.len());
        for item in &items {
            for value in values {
                let mut combined = item.clone();
                combined.insert(name.clone(), value.clone());
                next.push(combined);
            }
        }
        items = next;
    }

    Ok(items)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Combine item outputs into the step's outputs.
///
/// A step without for-each inputs passes its single item's outputs through.
/// Otherwise every output becomes an array ordered by item index, with
/// `null` where an item did not produce it.
pub fn aggregate_outputs(step: &Step, ordered_outputs: &[Option<&Args>]) -> Args {
    if !step.has_for_each() {
        return ordered_outputs
            .first()
            .and_then(|o| o.cloned())
            .unwrap_or_default();
    }

    let mut names: BTreeSet<String> = step.outputs().cloned().collect();
    if names.is_empty() {
        names = ordered_outputs
            .iter()
            .flatten()
            .flat_map(|o| o.keys().cloned())
            .collect();
    }

    names
        .into_iter()
        .map(|name| {
            let values: Vec<Value> = ordered_outputs
                .iter()
                .map(|o| o.and_then(|o| o.get(&name)).cloned().unwrap_or(Value::Null))
                .collect();
            (name, Value::Array(values))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::attribute::{AttributeRole, AttributeSpec, AttributeType};
    use crate::domain::step::StepType;
    use serde_json::json;

    fn fan_out_step() -> Step {
        Step::new("c", StepType::Script)
            .with_script("jexl", "{}")
            .with_attribute(
                "items",
                AttributeSpec::new(AttributeRole::Required, AttributeType::Array).for_each(),
            )
            .with_attribute("factor", AttributeSpec::new(AttributeRole::Required, AttributeType::Number))
            .with_attribute("result", AttributeSpec::new(AttributeRole::Output, AttributeType::Number))
    }

    fn args(value: Value) -> Args {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_single_item_without_for_each() {
        let step = Step::new("s", StepType::Script).with_script("jexl", "{}");
        let inputs = args(json!({"a": 1}));
        assert_eq!(expand_work_items(&step, &inputs, MAX_WORK_ITEMS).unwrap(), vec![inputs]);
    }

    #[test]
    fn test_array_expands_per_element() {
        let inputs = args(json!({"items": [1, 2, 3], "factor": 10}));
        let items = expand_work_items(&fan_out_step(), &inputs, MAX_WORK_ITEMS).unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["items"], json!(1));
        assert_eq!(items[2]["items"], json!(3));
        assert!(items.iter().all(|i| i["factor"] == json!(10)));
    }

    #[test]
    fn test_cartesian_product() {
        let step = fan_out_step().with_attribute(
            "colors",
            AttributeSpec::new(AttributeRole::Required, AttributeType::Array).for_each(),
        );
        let inputs = args(json!({"items": [1, 2], "colors": ["red", "blue", "green"], "factor": 1}));
        let items = expand_work_items(&step, &inputs, MAX_WORK_ITEMS).unwrap();
        assert_eq!(items.len(), 6);
    }

    #[test]
    fn test_empty_array_yields_no_items() {
        let inputs = args(json!({"items": [], "factor": 1}));
        assert!(expand_work_items(&fan_out_step(), &inputs, MAX_WORK_ITEMS)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_non_array_for_each_rejected() {
        let inputs = args(json!({"items": 7, "factor": 1}));
        let err = expand_work_items(&fan_out_step(), &inputs, MAX_WORK_ITEMS).unwrap_err();
        assert!(matches!(err, CoreError::Mapping(ref msg) if msg.contains("must be an array, got number")));

        let inputs = args(json!({"items": null, "factor": 1}));
        assert!(matches!(
            expand_work_items(&fan_out_step(), &inputs, MAX_WORK_ITEMS),
            Err(CoreError::Mapping(_))
        ));
    }

    #[test]
    fn test_limit_enforced() {
        let inputs = args(json!({"items": [1, 2, 3], "factor": 1}));
        assert!(expand_work_items(&fan_out_step(), &inputs, 2).is_err());
    }

    #[test]
    fn test_aggregate_by_index() {
        let first = args(json!({"result": 10}));
        let third = args(json!({"result": 30}));
        let aggregated = aggregate_outputs(&fan_out_step(), &[Some(&first), None, Some(&third)]);
        assert_eq!(aggregated["result"], json!([10, null, 30]));
    }

    #[test]
    fn test_aggregate_passthrough() {
        let step = Step::new("s", StepType::Script).with_script("jexl", "{}");
        let outputs = args(json!({"y": 2}));
        assert_eq!(aggregate_outputs(&step, &[Some(&outputs)]), outputs);
    }
}
