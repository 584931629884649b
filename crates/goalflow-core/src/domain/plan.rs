//! Execution planning
//!
//! The planner walks backward from the goal steps over attribute edges and
//! collects the steps needed to produce every input the goals depend on.
//!
//! Two passes, both over an immutable [`CatalogSnapshot`]:
//!
//! 1. Satisfiability: starting from the initial-state keys, repeatedly mark
//!    steps whose required inputs are all available and add their outputs.
//! 2. Collection: depth-first from each goal. A required input that is not
//!    in the initial state pulls in its satisfiable providers, or every
//!    provider when none is satisfiable. An input with no provider at all
//!    becomes an externally supplied requirement. Optional inputs only pull
//!    in satisfiable providers and never create requirements. Const inputs
//!    are resolved from the step's own literal and pull nothing.
//!
//! A required input whose every candidate provider is already open on the
//! current path is a cycle and fails planning.

use crate::domain::attribute::{AttributeRole, AttributeType};
use crate::domain::catalog::CatalogSnapshot;
use crate::domain::step::Step;
use crate::{Args, CoreError, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Resolution metadata for one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeEdge {
    /// Plan steps that produce the attribute
    pub providers: Vec<StepId>,

    /// Plan steps that consume the attribute
    pub consumers: Vec<StepId>,

    /// Most restrictive consuming role, `output` when nothing consumes it
    pub role: AttributeRole,

    /// Merged type, `any` when declarations disagree
    #[serde(rename = "type")]
    pub kind: AttributeType,

    /// Default agreed on by every consumer that declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Steps visited but left out of the plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExcludedSteps {
    /// Goals whose outputs are all present in the initial state
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub satisfied: BTreeMap<StepId, Vec<String>>,

    /// Unsatisfiable providers passed over in favour of satisfiable ones
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub missing: BTreeMap<StepId, Vec<String>>,
}

impl ExcludedSteps {
    pub fn is_empty(&self) -> bool {
        self.satisfied.is_empty() && self.missing.is_empty()
    }
}

/// Immutable result of planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Goal steps after subsumption pruning
    pub goals: Vec<StepId>,

    /// Attributes that must be supplied at flow start
    pub required: Vec<String>,

    /// Transitive closure of steps needed for the goals
    pub steps: BTreeMap<StepId, Step>,

    /// Producer/consumer edges per attribute
    pub attributes: BTreeMap<String, AttributeEdge>,

    /// Direct upstream providers of each plan step
    #[serde(default)]
    pub dependencies: BTreeMap<StepId, BTreeSet<StepId>>,

    #[serde(default, skip_serializing_if = "ExcludedSteps::is_empty")]
    pub excluded: ExcludedSteps,
}

impl ExecutionPlan {
    pub fn is_goal(&self, id: &StepId) -> bool {
        self.goals.contains(id)
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Plan steps producing `name`
    pub fn providers_of(&self, name: &str) -> &[StepId] {
        self.attributes
            .get(name)
            .map(|edge| edge.providers.as_slice())
            .unwrap_or(&[])
    }

    /// Plan steps consuming `name`
    pub fn consumers_of(&self, name: &str) -> &[StepId] {
        self.attributes
            .get(name)
            .map(|edge| edge.consumers.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `step` transitively consumes output of `ancestor`
    pub fn depends_on(&self, step: &StepId, ancestor: &StepId) -> bool {
        let mut stack = vec![step];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(parents) = self.dependencies.get(current) {
                for parent in parents {
                    if parent == ancestor {
                        return true;
                    }
                    stack.push(parent);
                }
            }
        }
        false
    }

    /// Merged defaults for attributes no plan step produces
    pub fn external_defaults(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.attributes.iter().filter_map(|(name, edge)| {
            if edge.providers.is_empty() {
                edge.default.as_ref().map(|d| (name, d))
            } else {
                None
            }
        })
    }

    /// Check that every externally supplied requirement is present
    pub fn validate_inputs(&self, args: &Args) -> Result<(), CoreError> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|name| !args.contains_key(*name))
            .map(|name| name.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::MissingRequiredInputs(missing.join(", ")))
        }
    }
}

/// Build an execution plan for `goals`, treating `init` keys as available
pub fn create_plan(
    catalog: &CatalogSnapshot,
    goals: &[StepId],
    init: &BTreeSet<String>,
) -> Result<ExecutionPlan, CoreError> {
    if goals.is_empty() {
        return Err(CoreError::NoGoals);
    }

    let mut unique_goals: Vec<StepId> = Vec::with_capacity(goals.len());
    for goal in goals {
        if !catalog.contains(goal) {
            return Err(CoreError::UnknownStep(goal.0.clone()));
        }
        if !unique_goals.contains(goal) {
            unique_goals.push(goal.clone());
        }
    }

    let mut builder = PlanBuilder::new(catalog, init);
    builder.compute_satisfiable();
    for goal in &unique_goals {
        builder.collect_goal(goal)?;
    }

    let plan = builder.build(unique_goals);
    debug!(
        goals = ?plan.goals,
        steps = plan.steps.len(),
        required = ?plan.required,
        "Execution plan created"
    );
    Ok(plan)
}

struct PlanBuilder<'a> {
    catalog: &'a CatalogSnapshot,
    initial: &'a BTreeSet<String>,
    available: BTreeSet<String>,
    satisfiable: BTreeSet<StepId>,
    closed: BTreeSet<StepId>,
    path: Vec<StepId>,
    missing: BTreeSet<String>,
    passed_over: BTreeSet<StepId>,
    excluded: ExcludedSteps,
}

impl<'a> PlanBuilder<'a> {
    fn new(catalog: &'a CatalogSnapshot, initial: &'a BTreeSet<String>) -> Self {
        Self {
            catalog,
            initial,
            available: initial.clone(),
            satisfiable: BTreeSet::new(),
            closed: BTreeSet::new(),
            path: Vec::new(),
            missing: BTreeSet::new(),
            passed_over: BTreeSet::new(),
            excluded: ExcludedSteps::default(),
        }
    }

    fn compute_satisfiable(&mut self) {
        let mut progress = true;
        while progress {
            progress = false;
            for step in self.catalog.steps() {
                if self.satisfiable.contains(&step.id) {
                    continue;
                }
                if !step.required_inputs().all(|name| self.available.contains(name)) {
                    continue;
                }
                self.satisfiable.insert(step.id.clone());
                self.available.extend(step.outputs().cloned());
                progress = true;
            }
        }
    }

    fn collect_goal(&mut self, goal: &StepId) -> Result<(), CoreError> {
        let step = self.lookup(goal)?;
        let outputs: Vec<String> = step.outputs().cloned().collect();
        if !outputs.is_empty() && outputs.iter().all(|name| self.initial.contains(name)) {
            self.excluded.satisfied.insert(goal.clone(), outputs);
            return Ok(());
        }
        self.collect(goal)
    }

    fn lookup(&self, id: &StepId) -> Result<&'a Step, CoreError> {
        self.catalog
            .get(id)
            .ok_or_else(|| CoreError::UnknownStep(id.0.clone()))
    }

    fn collect(&mut self, id: &StepId) -> Result<(), CoreError> {
        if self.closed.contains(id) {
            return Ok(());
        }
        let step = self.lookup(id)?;
        self.path.push(id.clone());

        for (name, spec) in step.inputs() {
            if self.initial.contains(name) {
                continue;
            }

            let candidates: Vec<StepId> = self.catalog.providers_of(name).cloned().collect();
            let viable: Vec<StepId> = candidates
                .iter()
                .filter(|p| self.satisfiable.contains(*p))
                .cloned()
                .collect();

            if spec.is_required() {
                let pool = if viable.is_empty() { candidates.clone() } else { viable };
                if pool.is_empty() {
                    self.missing.insert(name.clone());
                    continue;
                }

                let open: Vec<StepId> = pool
                    .iter()
                    .filter(|p| !self.path.contains(*p))
                    .cloned()
                    .collect();
                if open.is_empty() {
                    return Err(CoreError::CyclicDependency(self.describe_cycle(&pool[0])));
                }

                for skipped in candidates.iter().filter(|c| !pool.contains(*c)) {
                    self.passed_over.insert(skipped.clone());
                }
                for provider in open {
                    self.collect(&provider)?;
                }
            } else {
                for provider in viable {
                    if !self.path.contains(&provider) {
                        self.collect(&provider)?;
                    }
                }
            }
        }

        self.path.pop();
        self.closed.insert(id.clone());
        Ok(())
    }

    fn describe_cycle(&self, reentered: &StepId) -> String {
        let start = self
            .path
            .iter()
            .position(|p| p == reentered)
            .unwrap_or(0);
        let mut names: Vec<&str> = self.path[start..].iter().map(|p| p.0.as_str()).collect();
        names.push(reentered.0.as_str());
        names.join(" -> ")
    }

    fn build(mut self, requested_goals: Vec<StepId>) -> ExecutionPlan {
        let mut steps = BTreeMap::new();
        for id in &self.closed {
            if let Some(step) = self.catalog.get(id) {
                steps.insert(id.clone(), step.clone());
            }
        }

        for id in &self.passed_over {
            if steps.contains_key(id) {
                continue;
            }
            if let Some(step) = self.catalog.get(id) {
                let missing: Vec<String> = step
                    .required_inputs()
                    .filter(|name| !self.available.contains(*name))
                    .cloned()
                    .collect();
                self.excluded.missing.insert(id.clone(), missing);
            }
        }

        let attributes = build_attribute_edges(&steps);
        let dependencies = build_dependencies(&steps, &attributes);
        let goals = prune_subsumed_goals(requested_goals, &dependencies);

        ExecutionPlan {
            goals,
            required: self.missing.into_iter().collect(),
            steps,
            attributes,
            dependencies,
            excluded: self.excluded,
        }
    }
}

fn build_attribute_edges(steps: &BTreeMap<StepId, Step>) -> BTreeMap<String, AttributeEdge> {
    struct Accumulator {
        edge: AttributeEdge,
        kind: Option<AttributeType>,
        role: Option<AttributeRole>,
        defaults: Vec<Value>,
    }

    let mut acc: BTreeMap<String, Accumulator> = BTreeMap::new();
    for step in steps.values() {
        for (name, spec) in &step.attributes {
            if spec.is_const() {
                continue;
            }
            let entry = acc.entry(name.clone()).or_insert_with(|| Accumulator {
                edge: AttributeEdge {
                    providers: Vec::new(),
                    consumers: Vec::new(),
                    role: AttributeRole::Output,
                    kind: AttributeType::Any,
                    default: None,
                },
                kind: None,
                role: None,
                defaults: Vec::new(),
            });

            entry.kind = Some(match entry.kind {
                Some(kind) => kind.widen(spec.kind),
                None => spec.kind,
            });

            if spec.is_output() {
                entry.edge.providers.push(step.id.clone());
            } else {
                entry.edge.consumers.push(step.id.clone());
                entry.role = Some(match entry.role {
                    Some(role) => role.merge(spec.role),
                    None => spec.role,
                });
                if let Some(default) = &spec.default {
                    entry.defaults.push(default.clone());
                }
            }
        }
    }

    acc.into_iter()
        .map(|(name, a)| {
            let mut edge = a.edge;
            edge.kind = a.kind.unwrap_or_default();
            edge.role = a.role.unwrap_or(AttributeRole::Output);
            edge.default = match a.defaults.split_first() {
                Some((first, rest)) if rest.iter().all(|d| d == first) => Some(first.clone()),
                _ => None,
            };
            (name, edge)
        })
        .collect()
}

fn build_dependencies(
    steps: &BTreeMap<StepId, Step>,
    attributes: &BTreeMap<String, AttributeEdge>,
) -> BTreeMap<StepId, BTreeSet<StepId>> {
    steps
        .values()
        .map(|step| {
            let parents: BTreeSet<StepId> = step
                .inputs()
                .filter_map(|(name, _)| attributes.get(name))
                .flat_map(|edge| edge.providers.iter())
                .filter(|p| **p != step.id)
                .cloned()
                .collect();
            (step.id.clone(), parents)
        })
        .collect()
}

fn prune_subsumed_goals(
    goals: Vec<StepId>,
    dependencies: &BTreeMap<StepId, BTreeSet<StepId>>,
) -> Vec<StepId> {
    let ancestors: BTreeMap<&StepId, BTreeSet<&StepId>> = goals
        .iter()
        .map(|goal| (goal, ancestors_of(goal, dependencies)))
        .collect();

    let is_ancestor = |candidate: &StepId, of: &StepId| {
        ancestors.get(of).map_or(false, |set| set.contains(candidate))
    };

    goals
        .iter()
        .filter(|goal| {
            !goals.iter().any(|other| {
                other != *goal && is_ancestor(*goal, other) && !is_ancestor(other, *goal)
            })
        })
        .cloned()
        .collect()
}

fn ancestors_of<'a>(
    id: &'a StepId,
    dependencies: &'a BTreeMap<StepId, BTreeSet<StepId>>,
) -> BTreeSet<&'a StepId> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&StepId> = vec![id];
    while let Some(current) = stack.pop() {
        if let Some(parents) = dependencies.get(current) {
            for parent in parents {
                if seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::attribute::AttributeSpec;
    use crate::domain::step::StepType;
    use serde_json::json;

    fn step(id: &str) -> Step {
        Step::new(id, StepType::Script).with_script("jexl", "{}")
    }

    fn req(name: &str) -> (String, AttributeSpec) {
        (name.to_string(), AttributeSpec::new(AttributeRole::Required, AttributeType::Any))
    }

    fn opt(name: &str) -> (String, AttributeSpec) {
        (name.to_string(), AttributeSpec::new(AttributeRole::Optional, AttributeType::Any))
    }

    fn out(name: &str) -> (String, AttributeSpec) {
        (name.to_string(), AttributeSpec::new(AttributeRole::Output, AttributeType::Any))
    }

    fn with(step: Step, attrs: Vec<(String, AttributeSpec)>) -> Step {
        attrs
            .into_iter()
            .fold(step, |s, (name, spec)| s.with_attribute(&name, spec))
    }

    fn catalog(steps: Vec<Step>) -> CatalogSnapshot {
        CatalogSnapshot::from_steps(steps).unwrap()
    }

    fn ids(names: &[&str]) -> Vec<StepId> {
        names.iter().map(|n| StepId::from(*n)).collect()
    }

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn plan_steps(plan: &ExecutionPlan) -> Vec<&str> {
        plan.steps.keys().map(|k| k.0.as_str()).collect()
    }

    #[test]
    fn test_no_goals() {
        let cat = catalog(vec![]);
        assert_eq!(create_plan(&cat, &[], &keys(&[])), Err(CoreError::NoGoals));
    }

    #[test]
    fn test_unknown_goal() {
        let cat = catalog(vec![step("a")]);
        assert_eq!(
            create_plan(&cat, &ids(&["missing"]), &keys(&[])),
            Err(CoreError::UnknownStep("missing".to_string()))
        );
    }

    #[test]
    fn test_linear_chain() {
        let cat = catalog(vec![
            with(step("a"), vec![out("x")]),
            with(step("b"), vec![req("x"), out("y")]),
        ]);

        let plan = create_plan(&cat, &ids(&["b"]), &keys(&[])).unwrap();
        assert_eq!(plan_steps(&plan), vec!["a", "b"]);
        assert!(plan.required.is_empty());
        assert_eq!(plan.goals, ids(&["b"]));
        assert_eq!(plan.providers_of("x"), ids(&["a"]).as_slice());
        assert_eq!(plan.consumers_of("x"), ids(&["b"]).as_slice());
    }

    #[test]
    fn test_missing_provider_becomes_required_input() {
        let cat = catalog(vec![with(step("b"), vec![req("x"), out("y")])]);

        let plan = create_plan(&cat, &ids(&["b"]), &keys(&[])).unwrap();
        assert_eq!(plan_steps(&plan), vec!["b"]);
        assert_eq!(plan.required, vec!["x".to_string()]);
    }

    #[test]
    fn test_initial_state_satisfies_input() {
        let cat = catalog(vec![
            with(step("a"), vec![out("x")]),
            with(step("b"), vec![req("x"), out("y")]),
        ]);

        let plan = create_plan(&cat, &ids(&["b"]), &keys(&["x"])).unwrap();
        assert_eq!(plan_steps(&plan), vec!["b"]);
        assert!(plan.required.is_empty());
    }

    #[test]
    fn test_unsatisfiable_provider_pulls_its_own_requirements() {
        let cat = catalog(vec![
            with(step("a"), vec![req("q"), out("x")]),
            with(step("b"), vec![req("x")]),
        ]);

        let plan = create_plan(&cat, &ids(&["b"]), &keys(&[])).unwrap();
        assert_eq!(plan_steps(&plan), vec!["a", "b"]);
        assert_eq!(plan.required, vec!["q".to_string()]);
    }

    #[test]
    fn test_satisfiable_provider_preferred() {
        let cat = catalog(vec![
            with(step("p1"), vec![req("q"), out("x")]),
            with(step("p2"), vec![out("x")]),
            with(step("b"), vec![req("x")]),
        ]);

        let plan = create_plan(&cat, &ids(&["b"]), &keys(&[])).unwrap();
        assert_eq!(plan_steps(&plan), vec!["b", "p2"]);
        assert!(plan.required.is_empty());
        assert_eq!(
            plan.excluded.missing.get(&StepId::from("p1")),
            Some(&vec!["q".to_string()])
        );
    }

    #[test]
    fn test_cycle_detected() {
        let cat = catalog(vec![
            with(step("a"), vec![req("y"), out("x")]),
            with(step("b"), vec![req("x"), out("y")]),
        ]);

        match create_plan(&cat, &ids(&["a"]), &keys(&[])) {
            Err(CoreError::CyclicDependency(cycle)) => assert_eq!(cycle, "a -> b -> a"),
            other => panic!("expected cyclic dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_avoided_through_alternative_provider() {
        let cat = catalog(vec![
            with(step("a"), vec![req("x"), out("y")]),
            with(step("b"), vec![req("y"), out("x")]),
            with(step("c"), vec![out("y")]),
            with(step("goal"), vec![req("y"), out("done")]),
        ]);

        let plan = create_plan(&cat, &ids(&["goal"]), &keys(&[])).unwrap();
        assert!(plan.steps.contains_key(&StepId::from("c")));
        assert!(plan.required.is_empty());
    }

    #[test]
    fn test_optional_provider_included_when_satisfiable() {
        let cat = catalog(vec![
            with(step("c"), vec![opt("z"), out("r")]),
            with(step("d"), vec![out("z")]),
        ]);

        let plan = create_plan(&cat, &ids(&["c"]), &keys(&[])).unwrap();
        assert_eq!(plan_steps(&plan), vec!["c", "d"]);
    }

    #[test]
    fn test_optional_never_creates_requirements() {
        let cat = catalog(vec![
            with(step("c"), vec![opt("z"), out("r")]),
            with(step("d"), vec![req("q"), out("z")]),
        ]);

        let plan = create_plan(&cat, &ids(&["c"]), &keys(&[])).unwrap();
        assert_eq!(plan_steps(&plan), vec!["c"]);
        assert!(plan.required.is_empty());
    }

    #[test]
    fn test_optional_back_edge_is_not_a_cycle() {
        let cat = catalog(vec![
            with(step("a"), vec![opt("y"), out("x")]),
            with(step("b"), vec![req("x"), out("y")]),
        ]);

        let plan = create_plan(&cat, &ids(&["b"]), &keys(&[])).unwrap();
        assert_eq!(plan_steps(&plan), vec!["a", "b"]);
        assert!(plan.depends_on(&StepId::from("b"), &StepId::from("a")));
    }

    #[test]
    fn test_const_pulls_nothing() {
        let cat = catalog(vec![
            with(
                step("c"),
                vec![(
                    "mode".to_string(),
                    AttributeSpec::new(AttributeRole::Const, AttributeType::String)
                        .with_default(json!("fast")),
                )],
            ),
            with(step("m"), vec![out("mode")]),
        ]);

        let plan = create_plan(&cat, &ids(&["c"]), &keys(&[])).unwrap();
        assert_eq!(plan_steps(&plan), vec!["c"]);
        assert!(!plan.attributes.contains_key("mode"));
    }

    #[test]
    fn test_goal_subsumption() {
        let cat = catalog(vec![
            with(step("a"), vec![out("x")]),
            with(step("b"), vec![req("x"), out("y")]),
        ]);

        let plan = create_plan(&cat, &ids(&["a", "b"]), &keys(&[])).unwrap();
        assert_eq!(plan.goals, ids(&["b"]));
        assert_eq!(plan_steps(&plan), vec!["a", "b"]);
    }

    #[test]
    fn test_independent_goals_kept() {
        let cat = catalog(vec![
            with(step("a"), vec![out("x")]),
            with(step("b"), vec![out("y")]),
        ]);

        let plan = create_plan(&cat, &ids(&["b", "a", "b"]), &keys(&[])).unwrap();
        assert_eq!(plan.goals, ids(&["b", "a"]));
    }

    #[test]
    fn test_goal_satisfied_by_initial_state() {
        let cat = catalog(vec![with(step("a"), vec![out("x")])]);

        let plan = create_plan(&cat, &ids(&["a"]), &keys(&["x"])).unwrap();
        assert!(plan.steps.is_empty());
        assert_eq!(
            plan.excluded.satisfied.get(&StepId::from("a")),
            Some(&vec!["x".to_string()])
        );
    }

    #[test]
    fn test_attribute_merge_rules() {
        let number = |role| AttributeSpec::new(role, AttributeType::Number);
        let cat = catalog(vec![
            with(
                step("a"),
                vec![
                    ("n".to_string(), number(AttributeRole::Optional).with_default(json!(5))),
                    ("m".to_string(), number(AttributeRole::Optional).with_default(json!(1))),
                    ("t".to_string(), number(AttributeRole::Optional)),
                    out("ra"),
                ],
            ),
            with(
                step("b"),
                vec![
                    ("n".to_string(), number(AttributeRole::Optional).with_default(json!(5))),
                    ("m".to_string(), number(AttributeRole::Optional).with_default(json!(2))),
                    (
                        "t".to_string(),
                        AttributeSpec::new(AttributeRole::Required, AttributeType::String),
                    ),
                    out("rb"),
                ],
            ),
        ]);

        let plan = create_plan(&cat, &ids(&["a", "b"]), &keys(&[])).unwrap();

        let n = &plan.attributes["n"];
        assert_eq!(n.role, AttributeRole::Optional);
        assert_eq!(n.default, Some(json!(5)));
        assert_eq!(n.kind, AttributeType::Number);

        let m = &plan.attributes["m"];
        assert_eq!(m.default, None);

        let t = &plan.attributes["t"];
        assert_eq!(t.role, AttributeRole::Required);
        assert_eq!(t.kind, AttributeType::Any);
        assert_eq!(plan.required, vec!["t".to_string()]);

        let defaults: Vec<(&String, &Value)> = plan.external_defaults().collect();
        assert_eq!(defaults, vec![(&"n".to_string(), &json!(5))]);
    }

    #[test]
    fn test_planning_is_deterministic() {
        let cat = catalog(vec![
            with(step("a"), vec![out("x")]),
            with(step("a2"), vec![out("x")]),
            with(step("b"), vec![req("x"), opt("w"), out("y")]),
            with(step("c"), vec![req("y"), req("k")]),
        ]);

        let first = create_plan(&cat, &ids(&["c"]), &keys(&[])).unwrap();
        for _ in 0..5 {
            assert_eq!(create_plan(&cat, &ids(&["c"]), &keys(&[])).unwrap(), first);
        }
        assert_eq!(first.required, vec!["k".to_string()]);
    }

    #[test]
    fn test_validate_inputs() {
        let cat = catalog(vec![with(step("b"), vec![req("x"), req("z")])]);
        let plan = create_plan(&cat, &ids(&["b"]), &keys(&[])).unwrap();

        let mut args = Args::new();
        args.insert("x".to_string(), json!(1));
        assert_eq!(
            plan.validate_inputs(&args),
            Err(CoreError::MissingRequiredInputs("z".to_string()))
        );

        args.insert("z".to_string(), json!(2));
        assert!(plan.validate_inputs(&args).is_ok());
    }

    #[test]
    fn test_plan_serialization_round_trip() {
        let cat = catalog(vec![
            with(step("a"), vec![out("x")]),
            with(step("b"), vec![req("x")]),
        ]);
        let plan = create_plan(&cat, &ids(&["b"]), &keys(&[])).unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let back: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }
}
