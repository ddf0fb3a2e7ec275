// Triggerflow - Rust Edition
// Event-driven workflow execution built from persistent triggers

//! # Triggerflow Library
//!
//! Triggerflow compiles hierarchical workflow definitions (states with
//! sequential, branching, parallel and iterative semantics) into a flat set of
//! **triggers**, then executes those triggers against a live event stream.
//!
//! A trigger is a persistent rule: *when this set of events has arrived,
//! evaluate a condition and, if it holds, run an action*.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`CloudEvent`]: the `(subject, type)` pair used as the join key
//! - [`Trigger`]: a stored rule with its dependency events, handlers and context
//! - [`Namespace`] / [`EventSource`]: the isolation boundary and its event log
//! - [`StateMachineDefinition`]: the workflow definition format
//!
//! ### Trigger Store
//! [`TriggerStore`] is the namespace-scoped client for trigger definitions. It
//! either caches triggers locally (and commits them in one request) or writes
//! every trigger straight through a [`PersistenceTransport`].
//!
//! ### State-Machine Compiler
//! [`StateMachineCompiler`] recursively decomposes Pass/Task/Choice/Parallel/Map
//! states into triggers with the right join and fan-out edges.
//!
//! ### Execution Engine
//! [`Worker`] polls a [`Broker`], accumulates events per subject, detects when a
//! trigger's dependencies are complete and dispatches the condition and action
//! handlers resolved from a [`HandlerRegistry`].
//!
//! ## Control Flow
//!
//! ```text
//! StateMachineCompiler ──add_trigger──▶ TriggerStore ──commit──▶ persistence
//!                                                                  │
//! Broker ──poll──▶ Worker ◀──────────── load triggers ─────────────┘
//!                    │
//!                    └──▶ HandlerRegistry (condition, action)
//! ```

pub mod models;

pub mod client;

pub mod engine;

pub mod config;

pub use models::{
    CloudEvent,
    EventDependencies,
    EventSource,
    EventSourceKind,
    Namespace,
    NewTrigger,
    StateMachineDefinition,
    StateSpec,
    StateType,
    Trigger,
};

pub use client::{
    local::LocalTransport,
    transport::{HttpTransport, PersistenceTransport},
    Credentials,
    StoreMode,
    TriggerStore,
};

pub use engine::{
    broker::{Broker, BrokerRecord, BrokerResolver, MemoryBroker, MemoryHub},
    compiler::StateMachineCompiler,
    registry::{Action, Condition, HandlerRegistry, TaskInvoker},
    storage::{DocumentStore, InMemoryDocumentStore},
    worker::{EvaluationContext, Worker, WorkerState, WorkerStatus},
};

pub use config::TriggerflowConfig;

use thiserror::Error;

/// Errors raised by every Triggerflow component
///
/// The variants follow the failure taxonomy of the system:
/// - **validation** errors are raised before any I/O happens
/// - **conflict** errors come back from the persistence layer
/// - **not-found** errors come from local cache lookups
/// - **precondition** errors guard misuse of the client API
/// - **unimplemented** errors mark paths that must fail fast
///
/// Every variant carries the payload that triggered it (response body,
/// trigger id or workflow fragment) so failures can be diagnosed from logs.
#[derive(Error, Debug)]
pub enum TriggerflowError {
    /// Bad credentials, malformed context or other rejected input
    #[error("Validation error: {0}")]
    Validation(String),

    /// The persistence layer reported that the resource already exists
    #[error("Resource already exists: {0}")]
    ResourceAlreadyExists(String),

    /// A trigger or namespace could not be found
    #[error("Not found: {0}")]
    NotFound(String),

    /// No namespace is active on this client
    #[error("No namespace is active; create or target one first")]
    NullNamespace,

    /// A transient trigger was given an explicit identifier
    #[error("Transient triggers cannot be named (got trigger id {0})")]
    NamedTransientTrigger(String),

    /// A trigger with the same id is already cached
    #[error("Trigger {0} already exists")]
    DuplicateTrigger(String),

    /// A cache-only operation was invoked on a write-through store
    #[error("No trigger caching is being used")]
    CachingDisabled,

    /// `commit_cached_triggers` was called with nothing to commit
    #[error("Trigger cache empty")]
    EmptyCache,

    /// An operation or workflow construct with no implementation
    #[error("Not implemented: {0}")]
    Unimplemented(String),

    /// The workflow definition is structurally invalid
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// A condition or action name has no registered handler
    #[error("Unknown {kind} handler: {name}")]
    UnknownHandler { kind: &'static str, name: String },

    /// The persistence transport answered with a non-success status
    #[error("Transport error (status {status:?}): {body}")]
    Transport { status: Option<u16>, body: String },

    /// Polling, committing or publishing on the broker failed
    #[error("Broker error: {0}")]
    Broker(String),

    /// A condition or action returned an error
    #[error("Handler failed for trigger {trigger_id}: {message}")]
    Handler { trigger_id: String, message: String },

    /// Configuration could not be loaded or is incomplete
    #[error("Configuration error: {0}")]
    Config(String),

    /// Document store errors
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for TriggerflowError {
    fn from(err: reqwest::Error) -> Self {
        TriggerflowError::Transport {
            status: err.status().map(|s| s.as_u16()),
            body: err.to_string(),
        }
    }
}

/// Type alias for Results that use the crate error type
pub type Result<T> = std::result::Result<T, TriggerflowError>;
