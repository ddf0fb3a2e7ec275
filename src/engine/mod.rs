// Triggerflow Engine
// Compilation and execution of trigger graphs

//! # Triggerflow Engine Module
//!
//! This module holds everything that turns workflow definitions into running
//! trigger graphs. The engine is the layer between the domain models and the
//! external world (brokers, document stores, task endpoints).
//!
//! ## Engine Components
//!
//! ### Compiler (`compiler` module)
//! - Decomposes Pass/Task/Choice/Parallel/Map/Wait states into triggers
//! - Threads a sequence counter through the recursion for closing-trigger ids
//!
//! ### Handler Registry (`registry` module)
//! - Maps symbolic condition/action names to handler values
//! - Ships the built-in vocabulary (`true`, `pass`, `task`, `end_statemachine`, ...)
//!
//! ### Brokers (`broker` and `nats` modules)
//! - `poll` / `commit` / `publish` over an event log
//! - In-memory hub for tests and single-process runs, JetStream for deployments
//!
//! ### Storage (`storage` and `nats` modules)
//! - Namespace documents keyed by `(namespace, document_id)`
//!
//! ### Worker (`worker` module)
//! - The poll → accumulate → evaluate → publish → commit loop
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects at the Seams
//! Brokers, document stores, handlers and task invokers are all consumed as
//! `Arc<dyn Trait>` so the worker can be assembled from in-memory parts in
//! tests and from NATS-backed parts in production without generics leaking
//! into its public type.

/// State-machine compiler
pub mod compiler;

/// Condition/action registry and built-in handlers
pub mod registry;

/// Broker abstraction and in-memory implementation
pub mod broker;

/// NATS JetStream broker and key-value document store
pub mod nats;

/// Document storage abstraction
pub mod storage;

/// Trigger execution worker
pub mod worker;

pub use broker::{Broker, BrokerRecord, BrokerResolver, MemoryBroker, MemoryHub};
pub use compiler::StateMachineCompiler;
pub use nats::{NatsBroker, NatsDocumentStore};
pub use registry::{Action, Condition, HandlerRegistry, HttpTaskInvoker, LocalTaskInvoker, TaskInvoker, TaskOutcome};
pub use storage::{DocumentStore, InMemoryDocumentStore};
pub use worker::{EvaluationContext, Worker, WorkerState, WorkerStatus};
