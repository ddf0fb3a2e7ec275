// State-machine compiler: workflow definitions → trigger sets

//! # State-Machine Compiler
//!
//! [`StateMachineCompiler`] decomposes a hierarchical workflow definition into
//! a flat set of triggers and returns the id of a synthetic **closing
//! trigger** whose completion event means "this (sub-)workflow finished".
//! Parents depend on that id, which is how nesting turns into join edges.
//!
//! ## Compilation Rules
//!
//! Every state waits on its **input event**: the completion of its
//! predecessor, or the init event for the start state.
//!
//! | State | Emits | Completion id |
//! |---|---|---|
//! | Pass | trigger `name` on its input, action `state_pass` | `name` |
//! | Task, Wait | trigger `name` on its input, action `task` | `name` |
//! | Choice | nothing; targets inherit its input plus a `Condition` | its input |
//! | Parallel | every branch (init = its input), then trigger `name` joining all branch completions | `name` |
//! | Map | trigger `name` on its input, then the iterator (init = `name`) | the iterator's closing id |
//! | Succeed, Fail | compilation fails | – |
//!
//! A Choice condition follows the whole route it selects. A Choice reached
//! through another Choice gives its targets `And[outer, rule]`, and a
//! Parallel target passes the condition to the start states of every branch
//! rather than to its join trigger.
//!
//! Each (sub-)workflow ends with a closing trigger `StateMachine{n}` that
//! depends on the completion of every `End` state. `n` comes from a counter on
//! the compiler, allocated when a workflow is entered, so ids are unique across
//! the whole recursive compilation and across successive calls.
//!
//! Terminal states of one workflow are only ever reached through mutually
//! exclusive Choice routes, so a closing trigger with several terminals is
//! marked `"join": "any"` and fires on the first of them.
//!
//! ## Example
//!
//! ```rust
//! use triggerflow::{StateMachineCompiler, StateMachineDefinition};
//!
//! let definition = StateMachineDefinition::from_json(r#"{
//!     "StartAt": "Hello",
//!     "States": {"Hello": {"Type": "Pass", "End": true}}
//! }"#).unwrap();
//!
//! let mut compiler = StateMachineCompiler::new();
//! let plan = compiler.plan(&definition, "$init").unwrap();
//! assert_eq!(plan.completion_id, "StateMachine0");
//! assert_eq!(plan.triggers.len(), 2);
//! ```

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::client::{StoreMode, TriggerStore};
use crate::engine::registry::{ACTION_END_STATE_MACHINE, ACTION_STATE_PASS, ACTION_TASK, CONDITION_STATE};
use crate::models::{CloudEvent, NewTrigger, StateMachineDefinition, StateSpec, StateType};
use crate::{Result, TriggerflowError};

/// Subject of the event that starts a compiled workflow by default
pub const INIT_EVENT: &str = "$init";

/// Prefix of closing-trigger ids
pub const STATE_MACHINE_PREFIX: &str = "StateMachine";

/// Triggers produced by one compilation, in dependency order
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    /// Id whose completion event marks the whole workflow as finished
    pub completion_id: String,
    pub triggers: Vec<NewTrigger>,
}

/// Recursive compiler holding the closing-trigger sequence
#[derive(Debug, Default)]
pub struct StateMachineCompiler {
    sequence: usize,
}

/// Where a state's input event comes from
#[derive(Debug, Clone, Copy)]
enum Upstream<'d> {
    Init,
    State(&'d str),
}

impl StateMachineCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of closing triggers allocated so far
    pub fn state_machines_compiled(&self) -> usize {
        self.sequence
    }

    /// Compile `definition` and submit every trigger to `store`
    ///
    /// The whole workflow is planned before anything is submitted, so an
    /// invalid definition leaves the store untouched. When a submission fails
    /// (a trigger id already cached, say) the triggers this call added to a
    /// caching store are removed again and the sequence counter is restored.
    /// A remote store keeps whatever it accepted before the failure.
    pub async fn compile(
        &mut self,
        store: &mut TriggerStore,
        definition: &StateMachineDefinition,
        init_event: &str,
    ) -> Result<String> {
        let checkpoint = self.sequence;
        let plan = self.plan(definition, init_event)?;
        let count = plan.triggers.len();

        let mut submitted: Vec<String> = Vec::with_capacity(count);
        for trigger in plan.triggers {
            match store.add_trigger(trigger).await {
                Ok(trigger_id) => submitted.push(trigger_id),
                Err(e) => {
                    self.sequence = checkpoint;
                    if store.mode() == StoreMode::Cached {
                        for trigger_id in &submitted {
                            if let Err(rollback) = store.delete_trigger(trigger_id) {
                                warn!("Failed to roll back trigger {}: {}", trigger_id, rollback);
                            }
                        }
                        debug!("Rolled back {} triggers of {}", submitted.len(), plan.completion_id);
                    } else {
                        warn!(
                            "Compilation of {} failed after {} triggers were stored",
                            plan.completion_id,
                            submitted.len()
                        );
                    }
                    return Err(e);
                }
            }
        }

        info!("🧩 Compiled {} into {} triggers", plan.completion_id, count);
        Ok(plan.completion_id)
    }

    /// Compile `definition` into triggers without submitting them
    ///
    /// On failure the sequence counter is left where it was.
    pub fn plan(&mut self, definition: &StateMachineDefinition, init_event: &str) -> Result<CompiledWorkflow> {
        let checkpoint = self.sequence;
        let mut triggers = Vec::new();

        match self.state_machine(definition, init_event, None, 0, &mut triggers) {
            Ok(completion_id) => Ok(CompiledWorkflow {
                completion_id,
                triggers,
            }),
            Err(e) => {
                self.sequence = checkpoint;
                Err(e)
            }
        }
    }

    fn next_id(&mut self) -> String {
        let id = format!("{}{}", STATE_MACHINE_PREFIX, self.sequence);
        self.sequence += 1;
        id
    }

    /// Compile one workflow level
    ///
    /// `entry_condition` gates the states started directly by `init_event`.
    /// It carries the Choice route a nested Parallel branch was reached by.
    fn state_machine(
        &mut self,
        definition: &StateMachineDefinition,
        init_event: &str,
        entry_condition: Option<&Value>,
        depth: usize,
        out: &mut Vec<NewTrigger>,
    ) -> Result<String> {
        let sm_id = self.next_id();
        debug!("Compiling {} (depth {}) from {}", sm_id, depth, init_event);

        let (upstream, conditions, terminals) = upstream_relatives(definition)?;
        let order = evaluation_order(definition, &upstream)?;

        let mut completions: HashMap<&str, String> = HashMap::new();
        // Choice states emit no trigger; their route condition passes to their targets
        let mut choice_gates: HashMap<&str, Value> = HashMap::new();
        for name in order {
            let spec = definition
                .state(name)
                .ok_or_else(|| TriggerflowError::InvalidDefinition(format!("unknown state {}", name)))?;

            let (input, inherited) = match upstream.get(name) {
                Some(Upstream::Init) => (init_event.to_string(), entry_condition.cloned()),
                Some(Upstream::State(previous)) => (
                    completions.get(previous).cloned().ok_or_else(|| {
                        TriggerflowError::InvalidDefinition(format!("unresolved state {}", previous))
                    })?,
                    choice_gates.get(previous).cloned(),
                ),
                None => return Err(TriggerflowError::InvalidDefinition(format!("unreachable state {}", name))),
            };
            let gate = all_of(inherited, conditions.get(name).cloned());

            let mut context = Map::new();
            context.insert("subject".to_string(), Value::String(name.to_string()));
            context.insert("State".to_string(), spec.to_value());

            let completion = match spec.state_type {
                StateType::Pass => {
                    out.push(state_trigger(name, vec![input], ACTION_STATE_PASS, gated(context, gate)));
                    name.to_string()
                }
                StateType::Task | StateType::Wait => {
                    out.push(state_trigger(name, vec![input], ACTION_TASK, gated(context, gate)));
                    name.to_string()
                }
                StateType::Choice => {
                    if let Some(gate) = gate {
                        choice_gates.insert(name, gate);
                    }
                    input
                }
                StateType::Parallel => {
                    if spec.branches.is_empty() {
                        return Err(TriggerflowError::InvalidDefinition(format!(
                            "Parallel state {} has no branches: {}",
                            name,
                            spec.to_value()
                        )));
                    }
                    // the join sees branch results, so the route gates the branch entries instead
                    let mut branch_ids = Vec::with_capacity(spec.branches.len());
                    for branch in &spec.branches {
                        branch_ids.push(self.state_machine(branch, &input, gate.as_ref(), depth + 1, out)?);
                    }
                    out.push(state_trigger(name, branch_ids, ACTION_STATE_PASS, context));
                    name.to_string()
                }
                StateType::Map => {
                    let iterator = spec.iterator.as_deref().ok_or_else(|| {
                        TriggerflowError::InvalidDefinition(format!(
                            "Map state {} has no Iterator: {}",
                            name,
                            spec.to_value()
                        ))
                    })?;
                    out.push(state_trigger(name, vec![input], ACTION_TASK, gated(context, gate)));
                    self.state_machine(iterator, name, None, depth + 1, out)?
                }
                StateType::Succeed | StateType::Fail => return Err(unimplemented_state(name, spec)),
            };

            completions.insert(name, completion);
        }

        let mut closing_deps = Vec::with_capacity(terminals.len());
        for terminal in &terminals {
            let completion = completions
                .get(terminal)
                .ok_or_else(|| TriggerflowError::InvalidDefinition(format!("unresolved state {}", terminal)))?;
            closing_deps.push(CloudEvent::new(completion.as_str()));
        }

        let mut context = Map::new();
        context.insert("subject".to_string(), Value::String(sm_id.clone()));
        if terminals.len() > 1 {
            context.insert("join".to_string(), json!("any"));
        }
        if depth == 0 {
            context.insert("root".to_string(), Value::Bool(true));
        }

        out.push(
            NewTrigger::on(closing_deps)
                .condition(CONDITION_STATE)
                .action(ACTION_END_STATE_MACHINE)
                .context(Value::Object(context))
                .persistent(sm_id.clone()),
        );

        Ok(sm_id)
    }
}

fn state_trigger(name: &str, depends_on: Vec<String>, action: &str, context: Map<String, Value>) -> NewTrigger {
    let events: Vec<CloudEvent> = depends_on.into_iter().map(CloudEvent::new).collect();
    NewTrigger::on(events)
        .condition(CONDITION_STATE)
        .action(action)
        .context(Value::Object(context))
        .persistent(name)
}

/// Condition holding when both `outer` and `inner` hold
fn all_of(outer: Option<Value>, inner: Option<Value>) -> Option<Value> {
    match (outer, inner) {
        (Some(outer), Some(inner)) => Some(json!({ "And": [outer, inner] })),
        (outer, inner) => outer.or(inner),
    }
}

fn gated(mut context: Map<String, Value>, gate: Option<Value>) -> Map<String, Value> {
    if let Some(gate) = gate {
        context.insert("Condition".to_string(), gate);
    }
    context
}

fn unimplemented_state(name: &str, spec: &StateSpec) -> TriggerflowError {
    TriggerflowError::Unimplemented(format!("{} state {}: {}", spec.state_type, name, spec.to_value()))
}

type UpstreamMap<'d> = HashMap<&'d str, Upstream<'d>>;

/// First pass over one workflow level
///
/// Returns the upstream-relative map, the choice condition attached to each
/// choice target, and the terminal states in declaration order.
fn upstream_relatives(
    definition: &StateMachineDefinition,
) -> Result<(UpstreamMap<'_>, HashMap<&str, Value>, Vec<&str>)> {
    let start = definition.start_at.as_str();
    if definition.state(start).is_none() {
        return Err(TriggerflowError::InvalidDefinition(format!("StartAt names unknown state {}", start)));
    }

    let mut upstream: UpstreamMap = HashMap::new();
    let mut conditions: HashMap<&str, Value> = HashMap::new();
    let mut terminals = Vec::new();
    upstream.insert(start, Upstream::Init);

    for (name, spec) in &definition.states {
        let name = name.as_str();
        if matches!(spec.state_type, StateType::Succeed | StateType::Fail) {
            return Err(unimplemented_state(name, spec));
        }

        if spec.end {
            if spec.next.is_some() {
                return Err(TriggerflowError::InvalidDefinition(format!(
                    "state {} has both End and Next: {}",
                    name,
                    spec.to_value()
                )));
            }
            terminals.push(name);
        }

        if let Some(next) = spec.next.as_deref() {
            link(definition, &mut upstream, next, name)?;
        }

        if spec.state_type == StateType::Choice {
            let rules: Vec<Value> = spec
                .choices
                .iter()
                .map(|choice| Value::Object(choice.predicate.clone()))
                .collect();

            for (i, choice) in spec.choices.iter().enumerate() {
                link(definition, &mut upstream, &choice.next, name)?;
                attach_condition(&mut conditions, &choice.next, first_match(&rules, i));
            }
            if let Some(default) = spec.default.as_deref() {
                link(definition, &mut upstream, default, name)?;
                attach_condition(&mut conditions, default, json!({ "Not": { "Or": rules } }));
            }
        }
    }

    if terminals.is_empty() {
        return Err(TriggerflowError::InvalidDefinition(format!(
            "workflow starting at {} has no End state",
            start
        )));
    }

    Ok((upstream, conditions, terminals))
}

/// Record that `target` runs after `from`
fn link<'d>(
    definition: &'d StateMachineDefinition,
    upstream: &mut UpstreamMap<'d>,
    target: &str,
    from: &'d str,
) -> Result<()> {
    let (target, _) = definition
        .states
        .iter()
        .find(|(name, _)| name == target)
        .ok_or_else(|| {
            TriggerflowError::InvalidDefinition(format!("state {} transitions to unknown state {}", from, target))
        })?;
    let target = target.as_str();

    match upstream.get(target) {
        None => {
            upstream.insert(target, Upstream::State(from));
            Ok(())
        }
        Some(Upstream::State(existing)) if *existing == from => Ok(()),
        Some(Upstream::Init) => Err(TriggerflowError::InvalidDefinition(format!(
            "state {} transitions back to the start state {}",
            from, target
        ))),
        Some(Upstream::State(existing)) => Err(TriggerflowError::InvalidDefinition(format!(
            "state {} has more than one predecessor ({} and {})",
            target, existing, from
        ))),
    }
}

/// Choice rule `i` holds only when no earlier rule does
fn first_match(rules: &[Value], i: usize) -> Value {
    if i == 0 {
        return rules[0].clone();
    }
    let mut all: Vec<Value> = rules[..i].iter().map(|rule| json!({ "Not": rule })).collect();
    all.push(rules[i].clone());
    json!({ "And": all })
}

fn attach_condition<'d>(conditions: &mut HashMap<&'d str, Value>, target: &'d str, condition: Value) {
    match conditions.remove(target) {
        Some(existing) => conditions.insert(target, json!({ "Or": [existing, condition] })),
        None => conditions.insert(target, condition),
    };
}

/// States ordered so every state comes after its predecessor
///
/// Each state has at most one predecessor, so the chain above any state is a
/// simple path; revisiting a state on that path means a cycle.
fn evaluation_order<'d>(
    definition: &'d StateMachineDefinition,
    upstream: &UpstreamMap<'d>,
) -> Result<Vec<&'d str>> {
    let mut order: Vec<&str> = Vec::with_capacity(definition.states.len());
    let mut placed: HashSet<&str> = HashSet::new();

    for (name, _) in &definition.states {
        let mut chain: Vec<&str> = Vec::new();
        let mut current = name.as_str();

        loop {
            if placed.contains(current) {
                break;
            }
            if chain.contains(&current) {
                return Err(TriggerflowError::InvalidDefinition(format!(
                    "cycle through state {}",
                    current
                )));
            }
            chain.push(current);

            match upstream.get(current) {
                Some(Upstream::Init) => break,
                Some(Upstream::State(previous)) => current = *previous,
                None => {
                    return Err(TriggerflowError::InvalidDefinition(format!(
                        "state {} is unreachable",
                        current
                    )))
                }
            }
        }

        for state in chain.into_iter().rev() {
            placed.insert(state);
            order.push(state);
        }
    }

    Ok(order)
}
