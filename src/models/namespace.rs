// Namespaces and event-source descriptors

//! # Namespace Model
//!
//! A [`Namespace`] is the isolation boundary for a set of triggers: it owns a
//! read-only `global_context` visible to every trigger and exactly one
//! [`EventSource`] describing where its events come from.
//!
//! ## Event Source Descriptors
//!
//! Descriptors are tagged by `event_source_type` so a worker can resolve them
//! to a concrete broker client:
//!
//! ```json
//! {"name": "run_1", "event_source_type": "nats", "url": "nats://localhost:4222", "subject": "run_1"}
//! {"name": "run_1", "event_source_type": "memory", "topic": "run_1"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved global-context key holding the namespace name
pub const NAMESPACE_KEY: &str = "namespace";

/// Document ids used for namespace metadata in the document store
pub mod documents {
    pub const GLOBAL_CONTEXT: &str = "global_context";
    pub const EVENT_SOURCE: &str = "event_source";
    pub const EVENT_SOURCES: &str = "event_sources";
    pub const SOURCE_EVENTS: &str = "source_events";
    pub const TRIGGERS: &str = "triggers";

    /// Status document written by a worker when it finishes
    pub fn worker_status(worker_id: &uuid::Uuid) -> String {
        format!("worker_{}", worker_id)
    }
}

/// A namespace and its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,

    #[serde(default)]
    pub global_context: Map<String, Value>,

    #[serde(default)]
    pub event_source: Option<EventSource>,
}

/// Named event-source descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    pub name: String,

    #[serde(flatten)]
    pub kind: EventSourceKind,
}

/// The broker technology behind an event source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_source_type", rename_all = "lowercase")]
pub enum EventSourceKind {
    /// NATS JetStream subject, consumed through a durable pull consumer
    Nats {
        url: String,
        subject: String,
    },

    /// In-process topic on a [`MemoryHub`](crate::engine::broker::MemoryHub)
    Memory {
        topic: String,
    },
}

impl EventSource {
    pub fn nats(name: impl Into<String>, url: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EventSourceKind::Nats {
                url: url.into(),
                subject: subject.into(),
            },
        }
    }

    pub fn memory(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EventSourceKind::Memory { topic: topic.into() },
        }
    }

    /// The source-type tag as it appears on the wire
    pub fn source_type(&self) -> &'static str {
        match self.kind {
            EventSourceKind::Nats { .. } => "nats",
            EventSourceKind::Memory { .. } => "memory",
        }
    }

    /// The descriptor as a JSON object, for merging into evaluation contexts
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}
