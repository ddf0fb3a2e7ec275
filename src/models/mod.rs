// Core domain models for Triggerflow
// Plain data structures shared by the client, compiler and engine

//! # Domain Models Module
//!
//! This module contains the data that flows between the Triggerflow
//! components. Nothing here performs I/O.
//!
//! - `event`: [`CloudEvent`], the `(subject, type)` join key
//! - `trigger`: [`Trigger`] as stored, and [`NewTrigger`] as submitted
//! - `namespace`: [`Namespace`] and its [`EventSource`] descriptor
//! - `state_machine`: the workflow definition format fed to the compiler

pub mod event;

pub mod trigger;

pub mod namespace;

pub mod state_machine;

pub use event::{CloudEvent, EventDependencies, TERMINATION_SUCCESS};

pub use trigger::{
    add_to_index, index_source_events, remove_from_index, NewTrigger, SourceEvents, Trigger, ACTION_PASS,
    CONDITION_TRUE,
};

pub use namespace::{documents, EventSource, EventSourceKind, Namespace, NAMESPACE_KEY};

pub use state_machine::{ChoiceRule, StateMachineDefinition, StateSpec, StateType};
