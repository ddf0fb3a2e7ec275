// Condition/action registry for trigger evaluation

//! # Handler Registry
//!
//! Triggers reference their condition and action by **symbolic name**. The
//! [`HandlerRegistry`] resolves those names to handler values at evaluation
//! time, so new behaviour is added by registering a name, never by changing
//! the worker.
//!
//! ## Built-in Vocabulary
//!
//! | Kind | Name | Behaviour |
//! |---|---|---|
//! | condition | `true` | always holds |
//! | condition | `state_condition` | evaluates the context `Condition` choice rule against the event `data`; holds when there is none |
//! | action | `pass` | does nothing |
//! | action | `state_pass` | applies a Pass state's `Result`/`ResultPath` and emits the state's completion event |
//! | action | `task` | delegates to the [`TaskInvoker`] |
//! | action | `end_statemachine` | emits the workflow's completion event; stops the worker for the root workflow |
//! | action | `terminate` | stops the worker |
//!
//! Names are matched case-insensitively.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects in a HashMap
//! Handlers are stored as `Arc<dyn Condition>` / `Arc<dyn Action>`. The `Arc`
//! lets the worker clone a handler out of the registry and release the borrow
//! before awaiting it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::worker::EvaluationContext;
use crate::models::state_machine::{evaluate_predicate, set_path};
use crate::models::{CloudEvent, ACTION_PASS, CONDITION_TRUE};
use crate::{Result, TriggerflowError};

/// Condition used by every compiled state trigger
pub const CONDITION_STATE: &str = "state_condition";

/// Action of compiled Pass and Parallel states
pub const ACTION_STATE_PASS: &str = "state_pass";

/// Action of compiled Task, Wait and Map states
pub const ACTION_TASK: &str = "task";

/// Action of compiled closing triggers
pub const ACTION_END_STATE_MACHINE: &str = "end_statemachine";

/// Action that stops the worker
pub const ACTION_TERMINATE: &str = "terminate";

/// Decides whether a trigger's action runs
#[async_trait]
pub trait Condition: Send + Sync {
    async fn evaluate(&self, context: &mut EvaluationContext, event: &Value) -> Result<bool>;
}

/// Side effect run when a trigger fires
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, context: &mut EvaluationContext, event: &Value) -> Result<()>;
}

/// Adapts a closure into a [`Condition`]
pub struct FnCondition<F>(pub F);

#[async_trait]
impl<F> Condition for FnCondition<F>
where
    F: Fn(&EvaluationContext, &Value) -> Result<bool> + Send + Sync,
{
    async fn evaluate(&self, context: &mut EvaluationContext, event: &Value) -> Result<bool> {
        (self.0)(&*context, event)
    }
}

/// Adapts a closure into an [`Action`]
pub struct FnAction<F>(pub F);

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(&mut EvaluationContext, &Value) -> Result<()> + Send + Sync,
{
    async fn execute(&self, context: &mut EvaluationContext, event: &Value) -> Result<()> {
        (self.0)(context, event)
    }
}

/// Result of delegating a task state
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The task finished in-line; its output is the state's output
    Completed(Value),
    /// The task was handed off; the executor publishes the completion event
    Dispatched,
}

/// Runs the work behind Task, Wait and Map states
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    async fn invoke(&self, context: &EvaluationContext, state: &Value, input: Value) -> Result<TaskOutcome>;
}

/// Completes every task immediately, passing its input through
#[derive(Debug, Default, Clone)]
pub struct LocalTaskInvoker;

#[async_trait]
impl TaskInvoker for LocalTaskInvoker {
    async fn invoke(&self, _context: &EvaluationContext, _state: &Value, input: Value) -> Result<TaskOutcome> {
        Ok(TaskOutcome::Completed(input))
    }
}

/// Posts each task to the HTTP endpoint named by the state's `Resource`
///
/// The request body is
/// `{"subject", "trigger_id", "namespace", "state", "input"}`; the function
/// behind the endpoint is expected to publish `{subject, type:
/// termination.event.success, data}` to the namespace's event source when it
/// is done.
#[derive(Debug, Clone)]
pub struct HttpTaskInvoker {
    http: HttpClient,
}

impl HttpTaskInvoker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriggerflowError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl TaskInvoker for HttpTaskInvoker {
    async fn invoke(&self, context: &EvaluationContext, state: &Value, input: Value) -> Result<TaskOutcome> {
        let resource = state
            .get("Resource")
            .and_then(Value::as_str)
            .ok_or_else(|| TriggerflowError::Handler {
                trigger_id: context.trigger_id().to_string(),
                message: format!("task state has no Resource: {}", state),
            })?;

        let response = self
            .http
            .post(resource)
            .json(&json!({
                "subject": context.subject(),
                "trigger_id": context.trigger_id(),
                "namespace": context.get("namespace"),
                "state": state,
                "input": input,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TriggerflowError::Transport {
                status: Some(status.as_u16()),
                body: response.text().await.unwrap_or_default(),
            });
        }

        debug!("Dispatched {} to {}", context.trigger_id(), resource);
        Ok(TaskOutcome::Dispatched)
    }
}

struct AlwaysTrue;

#[async_trait]
impl Condition for AlwaysTrue {
    async fn evaluate(&self, _context: &mut EvaluationContext, _event: &Value) -> Result<bool> {
        Ok(true)
    }
}

struct StateCondition;

#[async_trait]
impl Condition for StateCondition {
    async fn evaluate(&self, context: &mut EvaluationContext, event: &Value) -> Result<bool> {
        match context.get("Condition") {
            Some(Value::Object(rule)) => evaluate_predicate(rule, event_data(event)),
            Some(Value::Null) | None => Ok(true),
            Some(other) => Err(TriggerflowError::InvalidDefinition(format!(
                "Condition must be a rule object: {}",
                other
            ))),
        }
    }
}

struct Pass;

#[async_trait]
impl Action for Pass {
    async fn execute(&self, _context: &mut EvaluationContext, _event: &Value) -> Result<()> {
        Ok(())
    }
}

struct StatePass;

#[async_trait]
impl Action for StatePass {
    async fn execute(&self, context: &mut EvaluationContext, event: &Value) -> Result<()> {
        let mut output = state_input(context, event);

        if let Some(state) = context.get("State") {
            if let Some(result) = state.get("Result") {
                let path = state.get("ResultPath").and_then(Value::as_str).unwrap_or("$");
                set_path(&mut output, path, result.clone());
            }
        }

        emit_completion(context, output)
    }
}

struct Task {
    invoker: Arc<dyn TaskInvoker>,
}

#[async_trait]
impl Action for Task {
    async fn execute(&self, context: &mut EvaluationContext, event: &Value) -> Result<()> {
        let state = context.get("State").cloned().unwrap_or(Value::Null);
        let input = state_input(context, event);

        match self.invoker.invoke(context, &state, input).await? {
            TaskOutcome::Completed(output) => emit_completion(context, output),
            TaskOutcome::Dispatched => Ok(()),
        }
    }
}

struct EndStateMachine;

#[async_trait]
impl Action for EndStateMachine {
    async fn execute(&self, context: &mut EvaluationContext, event: &Value) -> Result<()> {
        emit_completion(context, event_data(event).clone())?;
        if context.get("root").and_then(Value::as_bool).unwrap_or(false) {
            context.request_terminate();
        }
        Ok(())
    }
}

struct Terminate;

#[async_trait]
impl Action for Terminate {
    async fn execute(&self, context: &mut EvaluationContext, _event: &Value) -> Result<()> {
        context.request_terminate();
        Ok(())
    }
}

fn event_data(event: &Value) -> &Value {
    event.get("data").unwrap_or(&Value::Null)
}

/// Input document of a state: the event data, or one entry per dependency for joins
fn state_input(context: &EvaluationContext, event: &Value) -> Value {
    let dependencies = context.depends_on_events();
    if dependencies.len() <= 1 {
        return event_data(event).clone();
    }
    Value::Array(
        dependencies
            .iter()
            .map(|dependency| {
                context
                    .latest_event(dependency)
                    .map(|raw| event_data(raw).clone())
                    .unwrap_or(Value::Null)
            })
            .collect(),
    )
}

/// Queue `{subject, type: termination.event.success, data}` for the trigger's subject
fn emit_completion(context: &mut EvaluationContext, output: Value) -> Result<()> {
    let subject = context.subject().map(str::to_string).ok_or_else(|| TriggerflowError::Handler {
        trigger_id: context.trigger_id().to_string(),
        message: "context has no subject".to_string(),
    })?;
    context.emit(CloudEvent::new(subject).to_raw(output));
    Ok(())
}

/// Name → handler lookup for conditions and actions
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    conditions: HashMap<String, Arc<dyn Condition>>,
    actions: HashMap<String, Arc<dyn Action>>,
}

impl HandlerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in vocabulary, running tasks in-line
    pub fn with_builtins() -> Self {
        Self::with_task_invoker(Arc::new(LocalTaskInvoker))
    }

    /// Registry with the built-in vocabulary and a custom task invoker
    pub fn with_task_invoker(invoker: Arc<dyn TaskInvoker>) -> Self {
        let mut registry = Self::new();
        registry.register_condition(CONDITION_TRUE, AlwaysTrue);
        registry.register_condition(CONDITION_STATE, StateCondition);
        registry.register_action(ACTION_PASS, Pass);
        registry.register_action(ACTION_STATE_PASS, StatePass);
        registry.register_action(ACTION_TASK, Task { invoker });
        registry.register_action(ACTION_END_STATE_MACHINE, EndStateMachine);
        registry.register_action(ACTION_TERMINATE, Terminate);
        registry
    }

    /// Register (or replace) a condition under `name`
    pub fn register_condition(&mut self, name: &str, condition: impl Condition + 'static) {
        self.conditions.insert(name.to_lowercase(), Arc::new(condition));
    }

    /// Register (or replace) an action under `name`
    pub fn register_action(&mut self, name: &str, action: impl Action + 'static) {
        self.actions.insert(name.to_lowercase(), Arc::new(action));
    }

    pub fn condition(&self, name: &str) -> Result<Arc<dyn Condition>> {
        self.conditions
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| TriggerflowError::UnknownHandler {
                kind: "condition",
                name: name.to_string(),
            })
    }

    pub fn action(&self, name: &str) -> Result<Arc<dyn Action>> {
        self.actions
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| TriggerflowError::UnknownHandler {
                kind: "action",
                name: name.to_string(),
            })
    }

    /// Registered condition names, sorted
    pub fn condition_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.conditions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered action names, sorted
    pub fn action_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
