// Trigger definitions - persistent "when events arrive, check, then act" rules

//! # Trigger Model
//!
//! A [`Trigger`] fires its action when all of its `depends_on_events` have
//! arrived and its condition holds. Conditions and actions are referenced by
//! **symbolic name** and resolved at execution time by the handler registry.
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "trigger_id": "Reduce",
//!   "condition": "state_condition",
//!   "action": "state_pass",
//!   "context": {"subject": "Reduce"},
//!   "depends_on_events": [{"subject": "StateMachine2", "type": "termination.event.success"}],
//!   "transient": false
//! }
//! ```
//!
//! ## Identity Rules
//!
//! - A **persistent** trigger always has an id (caller-supplied or generated).
//! - A **transient** trigger never has a caller-supplied id; it is disposable
//!   and is removed after it fires.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::event::{CloudEvent, EventDependencies};

/// Built-in condition that always holds
pub const CONDITION_TRUE: &str = "true";

/// Built-in action that does nothing
pub const ACTION_PASS: &str = "pass";

/// A stored trigger definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: String,

    pub condition: String,

    pub action: String,

    /// Trigger-local state; actions may mutate it
    #[serde(default)]
    pub context: Map<String, Value>,

    pub depends_on_events: Vec<CloudEvent>,

    #[serde(default)]
    pub transient: bool,
}

impl Trigger {
    /// Subjects this trigger waits on, in dependency order without repeats
    pub fn subjects(&self) -> Vec<&str> {
        let mut subjects: Vec<&str> = Vec::with_capacity(self.depends_on_events.len());
        for event in &self.depends_on_events {
            if !subjects.contains(&event.subject.as_str()) {
                subjects.push(event.subject.as_str());
            }
        }
        subjects
    }
}

/// Subject → ids of the triggers waiting on an event with that subject
pub type SourceEvents = HashMap<String, Vec<String>>;

/// Derive the source-events index of a trigger set
///
/// Each trigger id appears at most once per subject, in the order the
/// triggers are visited.
pub fn index_source_events<'a>(triggers: impl IntoIterator<Item = &'a Trigger>) -> SourceEvents {
    let mut index = SourceEvents::new();
    for trigger in triggers {
        add_to_index(&mut index, trigger);
    }
    index
}

/// Register one trigger in an existing source-events index
pub fn add_to_index(index: &mut SourceEvents, trigger: &Trigger) {
    for subject in trigger.subjects() {
        let waiting = index.entry(subject.to_string()).or_default();
        if !waiting.contains(&trigger.trigger_id) {
            waiting.push(trigger.trigger_id.clone());
        }
    }
}

/// Remove one trigger from a source-events index, dropping empty subjects
pub fn remove_from_index(index: &mut SourceEvents, trigger: &Trigger) {
    for subject in trigger.subjects() {
        if let Some(waiting) = index.get_mut(subject) {
            waiting.retain(|id| id != &trigger.trigger_id);
            if waiting.is_empty() {
                index.remove(subject);
            }
        }
    }
}

/// A trigger submission, before an id has been resolved
///
/// Built with a small fluent API:
///
/// ```rust
/// use triggerflow::{CloudEvent, NewTrigger};
///
/// let trigger = NewTrigger::on(CloudEvent::new("init__"))
///     .action("state_pass")
///     .persistent("ca1");
/// assert_eq!(trigger.trigger_id.as_deref(), Some("ca1"));
/// ```
///
/// `transient` and `trigger_id` are deliberately independent fields so that
/// the store can reject the invalid combination instead of hiding it.
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub depends_on_events: Vec<CloudEvent>,
    pub condition: String,
    pub action: String,
    pub context: Value,
    pub transient: bool,
    pub trigger_id: Option<String>,
}

impl NewTrigger {
    /// A transient trigger on `events` with the `true` condition and `pass` action
    pub fn on(events: impl Into<EventDependencies>) -> Self {
        Self {
            depends_on_events: events.into().into(),
            condition: CONDITION_TRUE.to_string(),
            action: ACTION_PASS.to_string(),
            context: Value::Object(Map::new()),
            transient: true,
            trigger_id: None,
        }
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Trigger-local context; must be a JSON object when submitted
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn trigger_id(mut self, trigger_id: impl Into<String>) -> Self {
        self.trigger_id = Some(trigger_id.into());
        self
    }

    /// Shorthand for a named, non-transient trigger
    pub fn persistent(self, trigger_id: impl Into<String>) -> Self {
        self.transient(false).trigger_id(trigger_id)
    }

    /// Resolve into a stored trigger under `trigger_id`
    ///
    /// The caller has already validated that `context` is an object.
    pub(crate) fn into_trigger(self, trigger_id: String, context: Map<String, Value>) -> Trigger {
        Trigger {
            trigger_id,
            condition: self.condition,
            action: self.action,
            context,
            depends_on_events: self.depends_on_events,
            transient: self.transient,
        }
    }
}
