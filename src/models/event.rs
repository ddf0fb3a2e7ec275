// CloudEvent identity used as the join key for triggers

//! # CloudEvent Model
//!
//! A [`CloudEvent`] is the minimal identity of an event: a `(subject, type)`
//! pair. Triggers declare the events they depend on with this pair and the
//! execution engine matches incoming records against it.
//!
//! Raw events on the wire carry more fields (`data`, `id`, `source`, ...);
//! only `subject` and `type` take part in matching.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type produced when a workflow state finishes successfully
pub const TERMINATION_SUCCESS: &str = "termination.event.success";

/// Minimal event identity: a subject/type pair compared by value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloudEvent {
    pub subject: String,

    #[serde(rename = "type")]
    pub event_type: String,
}

impl CloudEvent {
    /// Event for `subject` with the default termination type
    pub fn new(subject: impl Into<String>) -> Self {
        Self::with_type(subject, TERMINATION_SUCCESS)
    }

    pub fn with_type(subject: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            event_type: event_type.into(),
        }
    }

    /// Extract the identity of a raw JSON event
    ///
    /// Returns `None` when the payload is not an object or lacks a string
    /// `subject` or `type` field.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let subject = raw.get("subject")?.as_str()?;
        let event_type = raw.get("type")?.as_str()?;
        Some(Self::with_type(subject, event_type))
    }

    /// Whether a raw JSON event carries this subject and type
    pub fn matches(&self, raw: &Value) -> bool {
        raw.get("subject").and_then(Value::as_str) == Some(self.subject.as_str())
            && raw.get("type").and_then(Value::as_str) == Some(self.event_type.as_str())
    }

    /// Build the raw wire form of this event with an attached payload
    pub fn to_raw(&self, data: Value) -> Value {
        serde_json::json!({
            "subject": self.subject,
            "type": self.event_type,
            "data": data,
        })
    }
}

/// The dependency set of a trigger: one event or a list of events
///
/// `add_trigger` accepts either form; both normalise into an ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDependencies(pub Vec<CloudEvent>);

impl From<CloudEvent> for EventDependencies {
    fn from(event: CloudEvent) -> Self {
        Self(vec![event])
    }
}

impl From<Vec<CloudEvent>> for EventDependencies {
    fn from(events: Vec<CloudEvent>) -> Self {
        Self(events)
    }
}

impl From<EventDependencies> for Vec<CloudEvent> {
    fn from(deps: EventDependencies) -> Self {
        deps.0
    }
}
