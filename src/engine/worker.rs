// Execution engine: consumes a namespace's event log and fires triggers

//! # Worker
//!
//! A [`Worker`] runs one namespace. It loads the namespace's global context,
//! event source and triggers from a [`DocumentStore`], resolves the event
//! source to a [`Broker`] and then loops:
//!
//! 1. poll one record (back off for `idle_backoff_ms` when there is none)
//! 2. decode it and append it to the subject's accumulator
//! 3. for every trigger waiting on the subject whose join is complete,
//!    evaluate its condition and, if it holds, run its action
//! 4. publish the events the actions emitted
//! 5. commit the record
//!
//! Committing last gives at-least-once delivery: a crash before step 5 means
//! the record is seen again, so handlers must tolerate duplicates.
//!
//! ## Join Semantics
//!
//! A trigger is *ready* when every `depends_on_events` entry has a matching
//! (subject and type) event in the accumulator, and it fires at most once per
//! complete set: the number of times it has been evaluated must stay below
//! the smallest per-dependency match count. A trigger whose context has
//! `"join": "any"` is ready on each new matching arrival instead.
//!
//! ## Failure Isolation
//!
//! A failing condition or action, or a name missing from the registry, is
//! logged with the trigger id and counted in the [`WorkerStatus`]; the other
//! triggers still run and the record is still committed. Records that are not
//! JSON events are logged and committed.
//!
//! ## Lifecycle
//!
//! `Initialized → Running → Finished`. The worker finishes when an action
//! requests termination (the `terminate` action, or the root closing trigger),
//! when its [`CancellationToken`] is cancelled, or after `max_idle_polls`
//! consecutive empty polls when that limit is set. On the way out it writes a
//! `worker_{id}` status document; failing to do so is only logged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::engine::broker::{Broker, BrokerRecord, BrokerResolver};
use crate::engine::registry::HandlerRegistry;
use crate::engine::storage::{load, save, DocumentStore};
use crate::models::{
    add_to_index, documents, remove_from_index, CloudEvent, EventSource, SourceEvents, Trigger, NAMESPACE_KEY,
};
use crate::{Result, TriggerflowError};

/// Context key holding the accumulated events of the trigger's dependency subjects
pub const EVENTS_KEY: &str = "events";
/// Context key holding the source-events index
pub const SOURCE_EVENTS_KEY: &str = "source_events";
/// Context key holding the trigger's own record
pub const TRIGGER_KEY: &str = "trigger";
/// Context key holding the trigger's dependency list
pub const DEPENDS_ON_KEY: &str = "depends_on_events";
pub const TRIGGER_ID_KEY: &str = "trigger_id";
/// Context key holding the namespace's event-source descriptor
pub const EVENT_SOURCE_KEY: &str = "event_source";
/// Trigger context key selecting the join mode
pub const JOIN_KEY: &str = "join";

const RESERVED_KEYS: [&str; 6] = [
    EVENTS_KEY,
    SOURCE_EVENTS_KEY,
    TRIGGER_KEY,
    DEPENDS_ON_KEY,
    TRIGGER_ID_KEY,
    EVENT_SOURCE_KEY,
];

/// Merged view handed to conditions and actions
///
/// Holds the trigger's context overlaid with the global context and the
/// worker's runtime state. Keys an action sets (other than the runtime and
/// global keys) are written back to the trigger's context after it fires.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    trigger_id: String,
    data: Map<String, Value>,
    outbox: Vec<Value>,
    terminate: bool,
}

impl EvaluationContext {
    pub fn new(trigger_id: &str, data: Map<String, Value>) -> Self {
        Self {
            trigger_id: trigger_id.to_string(),
            data,
            outbox: Vec::new(),
            terminate: false,
        }
    }

    pub fn trigger_id(&self) -> &str {
        &self.trigger_id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Subject this trigger announces its completion under
    pub fn subject(&self) -> Option<&str> {
        self.get("subject").and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Queue an event for publication once the current record is evaluated
    pub fn emit(&mut self, event: Value) {
        self.outbox.push(event);
    }

    /// Ask the worker to stop after the current record
    pub fn request_terminate(&mut self) {
        self.terminate = true;
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate
    }

    pub fn take_outbox(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.outbox)
    }

    /// The trigger's dependency list
    pub fn depends_on_events(&self) -> Vec<CloudEvent> {
        self.get(DEPENDS_ON_KEY)
            .and_then(|deps| serde_json::from_value(deps.clone()).ok())
            .unwrap_or_default()
    }

    /// Most recent accumulated event matching `dependency`
    pub fn latest_event(&self, dependency: &CloudEvent) -> Option<&Value> {
        self.get(EVENTS_KEY)?
            .get(&dependency.subject)?
            .as_array()?
            .iter()
            .rev()
            .find(|event| dependency.matches(event))
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }
}

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Initialized,
    Running,
    Finished,
}

/// Counters and timings persisted as the `worker_{id}` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: Uuid,
    pub namespace: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    pub events_processed: u64,
    pub triggers_fired: u64,
    pub handler_failures: u64,
    pub unexpected_events: u64,
}

impl WorkerStatus {
    fn new(worker_id: Uuid, namespace: &str) -> Self {
        Self {
            worker_id,
            namespace: namespace.to_string(),
            start_time: None,
            end_time: None,
            elapsed_seconds: 0.0,
            events_processed: 0,
            triggers_fired: 0,
            handler_failures: 0,
            unexpected_events: 0,
        }
    }
}

/// Trigger execution engine for one namespace
pub struct Worker {
    id: Uuid,
    namespace: String,
    store: Arc<dyn DocumentStore>,
    registry: Arc<HandlerRegistry>,
    resolver: BrokerResolver,
    settings: WorkerConfig,
    cancel: CancellationToken,
    state: WorkerState,

    global_context: Map<String, Value>,
    event_source: Option<EventSource>,
    /// Working copy of the namespace's triggers
    triggers: HashMap<String, Trigger>,
    source_events: SourceEvents,
    /// Transient triggers that fired; never reloaded
    retired: HashSet<String>,
    /// Subject → raw events, in arrival order
    events: HashMap<String, Vec<Value>>,
    /// Trigger id → number of complete dependency sets consumed
    activations: HashMap<String, usize>,
    status: WorkerStatus,
}

impl Worker {
    /// Worker over `namespace` with the built-in handlers and default settings
    pub fn new(namespace: impl Into<String>, store: Arc<dyn DocumentStore>) -> Self {
        let namespace = namespace.into();
        let id = Uuid::new_v4();
        Self {
            id,
            status: WorkerStatus::new(id, &namespace),
            namespace,
            store,
            registry: Arc::new(HandlerRegistry::with_builtins()),
            resolver: BrokerResolver::new(),
            settings: WorkerConfig::default(),
            cancel: CancellationToken::new(),
            state: WorkerState::Initialized,
            global_context: Map::new(),
            event_source: None,
            triggers: HashMap::new(),
            source_events: SourceEvents::new(),
            retired: HashSet::new(),
            events: HashMap::new(),
            activations: HashMap::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_resolver(mut self, resolver: BrokerResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_settings(mut self, settings: WorkerConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn status(&self) -> &WorkerStatus {
        &self.status
    }

    /// Token that stops the worker when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A trigger from the working copy
    pub fn trigger(&self, trigger_id: &str) -> Option<&Trigger> {
        self.triggers.get(trigger_id)
    }

    /// Run until terminated, cancelled or idle, then persist the status document
    pub async fn run(&mut self) -> Result<WorkerStatus> {
        if self.state != WorkerState::Initialized {
            return Err(TriggerflowError::Validation(format!(
                "worker {} has already run",
                self.id
            )));
        }

        let clock = Instant::now();
        self.status.start_time = Some(Utc::now());
        self.state = WorkerState::Running;
        info!("🚀 Worker {} starting on namespace {}", self.id, self.namespace);

        let outcome = self.start().await;

        self.state = WorkerState::Finished;
        self.status.end_time = Some(Utc::now());
        self.status.elapsed_seconds = clock.elapsed().as_secs_f64();

        let status_id = documents::worker_status(&self.id);
        if let Err(e) = save(self.store.as_ref(), &self.namespace, &status_id, &self.status).await {
            warn!("Failed to save status of worker {}: {}", self.id, e);
        }

        match outcome {
            Ok(()) => {
                info!(
                    "🏁 Worker {} finished after {:.3}s: {} events, {} triggers fired, {} failures",
                    self.id,
                    self.status.elapsed_seconds,
                    self.status.events_processed,
                    self.status.triggers_fired,
                    self.status.handler_failures
                );
                Ok(self.status.clone())
            }
            Err(e) => {
                error!("Worker {} stopped on error: {}", self.id, e);
                Err(e)
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        let source = self.bootstrap().await?;
        let mut broker = self.resolver.resolve(&source, &self.namespace).await?;
        self.event_loop(broker.as_mut()).await
    }

    async fn bootstrap(&mut self) -> Result<EventSource> {
        let store = self.store.clone();

        let mut global_context: Map<String, Value> = load(store.as_ref(), &self.namespace, documents::GLOBAL_CONTEXT)
            .await?
            .ok_or_else(|| TriggerflowError::NotFound(format!("Namespace {} not found", self.namespace)))?;
        global_context
            .entry(NAMESPACE_KEY.to_string())
            .or_insert_with(|| Value::String(self.namespace.clone()));
        self.global_context = global_context;

        let source: EventSource = load(store.as_ref(), &self.namespace, documents::EVENT_SOURCE)
            .await?
            .ok_or_else(|| {
                TriggerflowError::Config(format!("Namespace {} has no event source", self.namespace))
            })?;
        self.event_source = Some(source.clone());

        let loaded = self.refresh().await?;
        info!("📥 Loaded {} triggers for {}", loaded, self.namespace);
        Ok(source)
    }

    /// Add stored triggers not yet in the working copy; returns how many were added
    async fn refresh(&mut self) -> Result<usize> {
        let stored: HashMap<String, Trigger> = load(self.store.as_ref(), &self.namespace, documents::TRIGGERS)
            .await?
            .unwrap_or_default();

        let mut added = 0;
        for (trigger_id, trigger) in stored {
            if self.retired.contains(&trigger_id) || self.triggers.contains_key(&trigger_id) {
                continue;
            }
            self.triggers.insert(trigger_id, trigger);
            added += 1;
        }

        if added > 0 {
            let index: SourceEvents = load(self.store.as_ref(), &self.namespace, documents::SOURCE_EVENTS)
                .await?
                .unwrap_or_default();
            self.source_events = self.rebuild_index(index);
            debug!("Refreshed {}: {} new triggers", self.namespace, added);
        }
        Ok(added)
    }

    /// The stored index restricted to the working copy, completed for triggers it misses
    fn rebuild_index(&self, stored: SourceEvents) -> SourceEvents {
        let mut index = SourceEvents::new();
        for (subject, ids) in stored {
            let live: Vec<String> = ids.into_iter().filter(|id| self.triggers.contains_key(id)).collect();
            if !live.is_empty() {
                index.insert(subject, live);
            }
        }

        let mut trigger_ids: Vec<&String> = self.triggers.keys().collect();
        trigger_ids.sort();
        for trigger_id in trigger_ids {
            if let Some(trigger) = self.triggers.get(trigger_id) {
                add_to_index(&mut index, trigger);
            }
        }
        index
    }

    async fn event_loop(&mut self, broker: &mut dyn Broker) -> Result<()> {
        let mut cycles: u64 = 0;
        let mut idle_polls: u64 = 0;

        while self.state == WorkerState::Running {
            if self.cancel.is_cancelled() {
                info!("Worker {} cancelled", self.id);
                break;
            }

            cycles += 1;
            if self.settings.refresh_every > 0 && cycles % self.settings.refresh_every == 0 {
                if let Err(e) = self.refresh().await {
                    warn!("Failed to refresh triggers of {}: {}", self.namespace, e);
                }
            }

            match broker.poll().await {
                Ok(Some(record)) => {
                    idle_polls = 0;
                    self.process(broker, record).await?;
                }
                Ok(None) => {
                    idle_polls += 1;
                    if self.settings.max_idle_polls > 0 && idle_polls >= self.settings.max_idle_polls {
                        info!("Worker {} idle after {} empty polls", self.id, idle_polls);
                        break;
                    }
                    self.backoff().await;
                }
                Err(e) => {
                    warn!("Poll failed on {}: {}", self.namespace, e);
                    self.backoff().await;
                }
            }
        }
        Ok(())
    }

    async fn backoff(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.settings.idle_backoff()) => {}
        }
    }

    async fn process(&mut self, broker: &mut dyn Broker, record: BrokerRecord) -> Result<()> {
        self.status.events_processed += 1;
        let mut outbox = Vec::new();

        match record.json().map(|event| (CloudEvent::from_raw(&event), event)) {
            Ok((Some(identity), event)) => self.dispatch(identity, event, &mut outbox).await,
            Ok((None, event)) => warn!("Skipping event without subject/type in {}: {}", self.namespace, event),
            Err(e) => warn!("Skipping undecodable record {} in {}: {}", record.offset, self.namespace, e),
        }

        for event in &outbox {
            broker.publish(event).await?;
        }
        broker.commit(std::slice::from_ref(&record)).await
    }

    async fn dispatch(&mut self, identity: CloudEvent, event: Value, outbox: &mut Vec<Value>) {
        self.events
            .entry(identity.subject.clone())
            .or_default()
            .push(event.clone());

        let Some(waiting) = self.source_events.get(&identity.subject).cloned() else {
            warn!("Unexpected event {} in namespace {}", identity.subject, self.namespace);
            self.status.unexpected_events += 1;
            return;
        };

        for trigger_id in waiting {
            match self.fire(&trigger_id, &event, outbox).await {
                Ok(true) => self.status.triggers_fired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("❌ Trigger {} failed in {}: {}", trigger_id, self.namespace, e);
                    self.status.handler_failures += 1;
                }
            }
        }
    }

    /// Evaluate one waiting trigger; `Ok(true)` when its action ran
    async fn fire(&mut self, trigger_id: &str, event: &Value, outbox: &mut Vec<Value>) -> Result<bool> {
        let Some(trigger) = self.triggers.get(trigger_id).cloned() else {
            return Ok(false);
        };
        if !self.join_complete(&trigger) {
            debug!("{} is waiting on more events", trigger_id);
            return Ok(false);
        }
        *self.activations.entry(trigger_id.to_string()).or_default() += 1;

        let condition = self.registry.condition(&trigger.condition)?;
        let action = self.registry.action(&trigger.action)?;
        let mut context = self.evaluation_context(&trigger)?;

        if !condition.evaluate(&mut context, event).await? {
            debug!("Condition {} of {} does not hold", trigger.condition, trigger_id);
            return Ok(false);
        }
        action.execute(&mut context, event).await?;
        info!("⚡ Fired {} ({}) in {}", trigger_id, trigger.action, self.namespace);

        outbox.extend(context.take_outbox());
        if context.terminate_requested() {
            info!("🛑 {} requested termination of {}", trigger_id, self.namespace);
            self.state = WorkerState::Finished;
        }
        self.write_back(trigger_id, context);

        if trigger.transient {
            self.retire(&trigger).await;
        }
        Ok(true)
    }

    fn join_complete(&self, trigger: &Trigger) -> bool {
        let arrivals: Vec<usize> = trigger
            .depends_on_events
            .iter()
            .map(|dependency| self.arrivals(dependency))
            .collect();
        let consumed = self.activations.get(&trigger.trigger_id).copied().unwrap_or(0);

        let available = if trigger.context.get(JOIN_KEY).and_then(Value::as_str) == Some("any") {
            arrivals.iter().sum()
        } else {
            arrivals.iter().copied().min().unwrap_or(0)
        };
        available > consumed
    }

    fn arrivals(&self, dependency: &CloudEvent) -> usize {
        self.events.get(&dependency.subject).map_or(0, |events| {
            events.iter().filter(|event| dependency.matches(event)).count()
        })
    }

    fn evaluation_context(&self, trigger: &Trigger) -> Result<EvaluationContext> {
        let mut data = trigger.context.clone();
        for (key, value) in &self.global_context {
            data.insert(key.clone(), value.clone());
        }
        if let Some(source) = &self.event_source {
            data.insert(EVENT_SOURCE_KEY.to_string(), Value::Object(source.to_map()));
        }
        data.insert(EVENTS_KEY.to_string(), Value::Object(self.dependency_events(trigger)));
        data.insert(SOURCE_EVENTS_KEY.to_string(), serde_json::to_value(&self.source_events)?);
        data.insert(TRIGGER_KEY.to_string(), serde_json::to_value(trigger)?);
        data.insert(DEPENDS_ON_KEY.to_string(), serde_json::to_value(&trigger.depends_on_events)?);
        data.insert(TRIGGER_ID_KEY.to_string(), Value::String(trigger.trigger_id.clone()));
        Ok(EvaluationContext::new(&trigger.trigger_id, data))
    }

    /// Accumulated events for the subjects `trigger` depends on
    fn dependency_events(&self, trigger: &Trigger) -> Map<String, Value> {
        let mut events = Map::new();
        for dependency in &trigger.depends_on_events {
            if events.contains_key(&dependency.subject) {
                continue;
            }
            if let Some(received) = self.events.get(&dependency.subject) {
                events.insert(dependency.subject.clone(), Value::Array(received.clone()));
            }
        }
        events
    }

    fn write_back(&mut self, trigger_id: &str, context: EvaluationContext) {
        let global = &self.global_context;
        if let Some(trigger) = self.triggers.get_mut(trigger_id) {
            for (key, value) in context.into_data() {
                if RESERVED_KEYS.contains(&key.as_str()) || global.contains_key(&key) {
                    continue;
                }
                trigger.context.insert(key, value);
            }
        }
    }

    async fn retire(&mut self, trigger: &Trigger) {
        self.triggers.remove(&trigger.trigger_id);
        remove_from_index(&mut self.source_events, trigger);
        self.retired.insert(trigger.trigger_id.clone());
        debug!("Removed transient trigger {}", trigger.trigger_id);

        if let Err(e) = self.forget_stored(trigger).await {
            warn!("Failed to delete transient trigger {}: {}", trigger.trigger_id, e);
        }
    }

    async fn forget_stored(&self, trigger: &Trigger) -> Result<()> {
        let store = self.store.as_ref();

        let mut stored: HashMap<String, Trigger> =
            load(store, &self.namespace, documents::TRIGGERS).await?.unwrap_or_default();
        if stored.remove(&trigger.trigger_id).is_some() {
            save(store, &self.namespace, documents::TRIGGERS, &stored).await?;
        }

        if let Some(mut index) = load::<SourceEvents>(store, &self.namespace, documents::SOURCE_EVENTS).await? {
            remove_from_index(&mut index, trigger);
            save(store, &self.namespace, documents::SOURCE_EVENTS, &index).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::local::LocalTransport;
    use crate::client::transport::PersistenceTransport;
    use crate::client::{Credentials, StoreMode, TriggerStore};
    use crate::engine::broker::MemoryHub;
    use crate::engine::compiler::{StateMachineCompiler, INIT_EVENT};
    use crate::engine::registry::{Action, FnAction, ACTION_TERMINATE};
    use crate::engine::storage::InMemoryDocumentStore;
    use crate::models::{NewTrigger, StateMachineDefinition, TERMINATION_SUCCESS};
    use serde_json::json;

    const TOPIC: &str = "run";

    fn settings() -> WorkerConfig {
        WorkerConfig {
            idle_backoff_ms: 1,
            refresh_every: 0,
            max_idle_polls: 3,
        }
    }

    /// Counts firings in the trigger's own context
    fn registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::with_builtins();
        registry.register_action(
            "count",
            FnAction(|ctx: &mut EvaluationContext, _: &Value| -> Result<()> {
                let hits = ctx.get("hits").and_then(Value::as_u64).unwrap_or(0);
                ctx.set("hits", json!(hits + 1));
                Ok(())
            }),
        );
        registry.register_action(
            "record_events",
            FnAction(|ctx: &mut EvaluationContext, _: &Value| -> Result<()> {
                let seen: Vec<Value> = ctx
                    .get(EVENTS_KEY)
                    .and_then(Value::as_object)
                    .map(|events| events.keys().map(|subject| json!(subject)).collect())
                    .unwrap_or_default();
                ctx.set("seen", Value::Array(seen));
                Ok(())
            }),
        );
        registry.register_action(
            "explode",
            FnAction(|ctx: &mut EvaluationContext, _: &Value| -> Result<()> {
                Err(TriggerflowError::Handler {
                    trigger_id: ctx.trigger_id().to_string(),
                    message: "boom".to_string(),
                })
            }),
        );
        Arc::new(registry)
    }

    fn trigger(trigger_id: &str, subjects: &[&str], action: &str) -> Trigger {
        let events: Vec<CloudEvent> = subjects.iter().map(|s| CloudEvent::new(*s)).collect();
        NewTrigger::on(events)
            .action(action)
            .persistent(trigger_id)
            .into_trigger(trigger_id.to_string(), Map::new())
    }

    async fn namespace(triggers: Vec<Trigger>) -> (Arc<InMemoryDocumentStore>, MemoryHub) {
        let backing = Arc::new(InMemoryDocumentStore::new());
        let transport = LocalTransport::new(backing.clone());
        transport
            .put_namespace(TOPIC, &Map::new(), Some(&EventSource::memory(TOPIC, TOPIC)))
            .await
            .unwrap();
        transport.post_triggers(TOPIC, &triggers).await.unwrap();
        (backing, MemoryHub::new())
    }

    fn worker(backing: &Arc<InMemoryDocumentStore>, hub: &MemoryHub) -> Worker {
        Worker::new(TOPIC, backing.clone())
            .with_registry(registry())
            .with_resolver(BrokerResolver::new().with_memory_hub(hub.clone()))
            .with_settings(settings())
    }

    async fn publish(hub: &MemoryHub, subject: &str) {
        hub.publish(TOPIC, &CloudEvent::new(subject).to_raw(Value::Null))
            .await
            .unwrap();
    }

    fn hits(worker: &Worker, trigger_id: &str) -> u64 {
        worker
            .trigger(trigger_id)
            .and_then(|t| t.context.get("hits"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_join_waits_for_every_dependency() {
        let (backing, hub) = namespace(vec![trigger("T", &["A", "B"], "count")]).await;
        publish(&hub, "A").await;
        publish(&hub, "A").await;

        let mut worker = worker(&backing, &hub);
        let status = worker.run().await.unwrap();
        assert_eq!(status.events_processed, 2);
        assert_eq!(status.triggers_fired, 0);
        assert_eq!(hits(&worker, "T"), 0);
    }

    #[tokio::test]
    async fn test_join_fires_once_in_either_order() {
        for order in [["A", "A", "B"], ["B", "A", "A"]] {
            let (backing, hub) = namespace(vec![trigger("T", &["A", "B"], "count")]).await;
            for subject in order {
                publish(&hub, subject).await;
            }

            let mut worker = worker(&backing, &hub);
            let status = worker.run().await.unwrap();
            assert_eq!(status.triggers_fired, 1, "order {:?}", order);
            assert_eq!(hits(&worker, "T"), 1);
        }
    }

    #[tokio::test]
    async fn test_join_any_fires_per_arrival() {
        let mut any = trigger("T", &["A", "B"], "count");
        any.context.insert(JOIN_KEY.to_string(), json!("any"));
        let (backing, hub) = namespace(vec![any]).await;
        publish(&hub, "A").await;
        publish(&hub, "B").await;

        let mut worker = worker(&backing, &hub);
        assert_eq!(worker.run().await.unwrap().triggers_fired, 2);
    }

    #[tokio::test]
    async fn test_event_type_must_match() {
        let (backing, hub) = namespace(vec![trigger("T", &["A"], "count")]).await;
        hub.publish(TOPIC, &CloudEvent::with_type("A", "custom").to_raw(Value::Null))
            .await
            .unwrap();

        let mut worker = worker(&backing, &hub);
        assert_eq!(worker.run().await.unwrap().triggers_fired, 0);
    }

    #[tokio::test]
    async fn test_context_carries_only_dependency_events() {
        let (backing, hub) = namespace(vec![
            trigger("T", &["B"], "record_events"),
            trigger("U", &["A"], "count"),
        ])
        .await;
        publish(&hub, "A").await;
        publish(&hub, "A").await;
        publish(&hub, "B").await;

        let mut worker = worker(&backing, &hub);
        assert_eq!(worker.run().await.unwrap().triggers_fired, 3);
        assert_eq!(worker.trigger("T").unwrap().context["seen"], json!(["B"]));
    }

    #[tokio::test]
    async fn test_unexpected_and_malformed_records_are_committed() {
        let (backing, hub) = namespace(vec![trigger("T", &["A"], "count")]).await;
        publish(&hub, "Z").await;
        hub.publish_raw(TOPIC, b"not json".to_vec()).await.unwrap();
        hub.publish(TOPIC, &json!({"subject": "A"})).await.unwrap();

        let mut worker = worker(&backing, &hub);
        let status = worker.run().await.unwrap();
        assert_eq!(status.events_processed, 3);
        assert_eq!(status.unexpected_events, 1);
        assert_eq!(status.triggers_fired, 0);
        assert_eq!(hub.committed_offset(TOPIC).await, 3);
    }

    #[tokio::test]
    async fn test_handler_failures_are_isolated() {
        let (backing, hub) = namespace(vec![
            trigger("broken", &["A"], "explode"),
            trigger("unknown", &["A"], "missing"),
            trigger("ok", &["A"], "count"),
        ])
        .await;
        publish(&hub, "A").await;

        let mut worker = worker(&backing, &hub);
        let status = worker.run().await.unwrap();
        assert_eq!(status.handler_failures, 2);
        assert_eq!(status.triggers_fired, 1);
        assert_eq!(hits(&worker, "ok"), 1);
        assert_eq!(hub.committed_offset(TOPIC).await, 1);
    }

    #[tokio::test]
    async fn test_transient_trigger_is_removed_after_firing() {
        let transient = NewTrigger::on(CloudEvent::new("A"))
            .action("count")
            .into_trigger("tmp".to_string(), Map::new());
        let (backing, hub) = namespace(vec![transient]).await;
        publish(&hub, "A").await;
        publish(&hub, "A").await;

        let mut worker = worker(&backing, &hub);
        let status = worker.run().await.unwrap();
        assert_eq!(status.triggers_fired, 1);
        assert_eq!(status.unexpected_events, 1);
        assert!(worker.trigger("tmp").is_none());

        let stored: HashMap<String, Trigger> = load(backing.as_ref(), TOPIC, documents::TRIGGERS)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_stops_before_next_record() {
        let (backing, hub) = namespace(vec![trigger("stop", &["A"], ACTION_TERMINATE)]).await;
        publish(&hub, "A").await;
        publish(&hub, "B").await;

        let mut worker = worker(&backing, &hub).with_settings(WorkerConfig {
            max_idle_polls: 0,
            ..settings()
        });
        let status = worker.run().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Finished);
        assert_eq!(status.events_processed, 1);
        assert_eq!(hub.committed_offset(TOPIC).await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_worker_writes_status() {
        let (backing, hub) = namespace(vec![trigger("T", &["A"], "count")]).await;
        publish(&hub, "A").await;

        let mut worker = worker(&backing, &hub).with_settings(WorkerConfig {
            max_idle_polls: 0,
            ..settings()
        });
        worker.cancellation_token().cancel();
        let status = worker.run().await.unwrap();
        assert_eq!(status.events_processed, 0);

        let saved: WorkerStatus = load(backing.as_ref(), TOPIC, &documents::worker_status(&worker.id()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.worker_id, worker.id());
        assert_eq!(saved.events_processed, 0);
        assert!(saved.end_time.is_some());
        assert!(matches!(worker.run().await, Err(TriggerflowError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_namespace_fails() {
        let backing = Arc::new(InMemoryDocumentStore::new());
        let mut worker = Worker::new("ghost", backing);
        assert!(matches!(worker.run().await, Err(TriggerflowError::NotFound(_))));
    }

    /// Installs a trigger on `B` while the worker is running
    struct Install {
        transport: LocalTransport,
    }

    #[async_trait::async_trait]
    impl Action for Install {
        async fn execute(&self, _context: &mut EvaluationContext, _event: &Value) -> Result<()> {
            self.transport
                .post_triggers(TOPIC, &[trigger("late", &["B"], "count")])
                .await
                .map(|_| ())
        }
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_triggers() {
        let (backing, hub) = namespace(vec![trigger("installer", &["A"], "install")]).await;
        publish(&hub, "A").await;
        publish(&hub, "B").await;

        let mut handlers = (*registry()).clone();
        handlers.register_action(
            "install",
            Install {
                transport: LocalTransport::new(backing.clone()),
            },
        );

        let mut worker = worker(&backing, &hub)
            .with_registry(Arc::new(handlers))
            .with_settings(WorkerConfig {
                refresh_every: 1,
                ..settings()
            });
        let status = worker.run().await.unwrap();
        assert_eq!(status.triggers_fired, 2);
        assert_eq!(status.unexpected_events, 0);
        assert_eq!(hits(&worker, "late"), 1);
    }

    /// Compile `definition`, publish the init event with `input` and run until done
    async fn run_compiled(definition: &str, input: Value) -> (Worker, WorkerStatus, MemoryHub) {
        let backing = Arc::new(InMemoryDocumentStore::new());
        let transport = Arc::new(LocalTransport::new(backing.clone()));
        let credentials = Credentials::new("tester", "secret").unwrap();
        let mut store = TriggerStore::with_transport(credentials, transport, StoreMode::Cached);
        store
            .create_namespace(TOPIC, Some(json!({"owner": "tests"})), Some(EventSource::memory(TOPIC, TOPIC)))
            .await
            .unwrap();

        let definition = StateMachineDefinition::from_json(definition).unwrap();
        let mut compiler = StateMachineCompiler::new();
        let completion = compiler.compile(&mut store, &definition, INIT_EVENT).await.unwrap();
        store.commit_cached_triggers().await.unwrap();
        assert_eq!(completion, "StateMachine0");

        let hub = MemoryHub::new();
        hub.publish(TOPIC, &CloudEvent::new(INIT_EVENT).to_raw(input)).await.unwrap();

        let mut worker = Worker::new(TOPIC, backing.clone())
            .with_resolver(BrokerResolver::new().with_memory_hub(hub.clone()))
            .with_settings(WorkerConfig {
                max_idle_polls: 20,
                ..settings()
            });
        let status = worker.run().await.unwrap();
        (worker, status, hub)
    }

    async fn published_subjects(hub: &MemoryHub) -> Vec<String> {
        hub.events(TOPIC)
            .await
            .iter()
            .filter_map(|e| e["subject"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_compiled_workflow_runs_to_completion() {
        let (worker, status, hub) =
            run_compiled(include_str!("../../demos/parallel_map_choice.json"), json!({})).await;

        assert_eq!(worker.state(), WorkerState::Finished);
        assert_eq!(status.handler_failures, 0);
        // every state trigger except the unchosen Result1
        assert_eq!(status.triggers_fired, 15);

        let subjects = published_subjects(&hub).await;
        assert!(subjects.iter().any(|s| s == "Result2"));
        assert!(!subjects.iter().any(|s| s == "Result1"));

        let events = hub.events(TOPIC).await;
        let done = events
            .iter()
            .find(|e| e["subject"] == "StateMachine0")
            .expect("root completion published");
        assert_eq!(done["type"], TERMINATION_SUCCESS);
        assert_eq!(hub.committed_offset(TOPIC).await as usize, events.len() - 1);
    }

    const CHOICE_TO_PARALLEL: &str = r#"{"StartAt": "C", "States": {
        "C": {"Type": "Choice", "Default": "P",
              "Choices": [{"Variable": "$.x", "BooleanEquals": true, "Next": "Yes"}]},
        "Yes": {"Type": "Pass", "End": true},
        "P": {"Type": "Parallel", "End": true, "Branches": [
            {"StartAt": "B1", "States": {"B1": {"Type": "Task", "End": true}}}
        ]}
    }}"#;

    #[tokio::test]
    async fn test_unchosen_parallel_branches_do_not_run() {
        let (worker, status, hub) = run_compiled(CHOICE_TO_PARALLEL, json!({"x": true})).await;

        assert_eq!(worker.state(), WorkerState::Finished);
        assert_eq!(status.handler_failures, 0);
        assert_eq!(published_subjects(&hub).await, vec![INIT_EVENT, "Yes", "StateMachine0"]);
    }

    #[tokio::test]
    async fn test_chosen_parallel_runs_its_branches() {
        let (worker, _, hub) = run_compiled(CHOICE_TO_PARALLEL, json!({"x": false})).await;

        assert_eq!(worker.state(), WorkerState::Finished);
        let subjects = published_subjects(&hub).await;
        for expected in ["B1", "StateMachine1", "P", "StateMachine0"] {
            assert!(subjects.iter().any(|s| s == expected), "{} missing from {:?}", expected, subjects);
        }
        assert!(!subjects.iter().any(|s| s == "Yes"));
    }

    #[tokio::test]
    async fn test_nested_choice_follows_outer_route() {
        let definition = r#"{"StartAt": "C1", "States": {
            "C1": {"Type": "Choice", "Default": "Z",
                   "Choices": [{"Variable": "$.x", "NumericEquals": 1, "Next": "C2"}]},
            "C2": {"Type": "Choice", "Default": "Y",
                   "Choices": [{"Variable": "$.y", "NumericEquals": 1, "Next": "X"}]},
            "X": {"Type": "Pass", "End": true},
            "Y": {"Type": "Pass", "End": true},
            "Z": {"Type": "Pass", "End": true}
        }}"#;

        let (_, _, hub) = run_compiled(definition, json!({"x": 2, "y": 1})).await;
        assert_eq!(published_subjects(&hub).await, vec![INIT_EVENT, "Z", "StateMachine0"]);

        let (_, _, hub) = run_compiled(definition, json!({"x": 1, "y": 2})).await;
        assert_eq!(published_subjects(&hub).await, vec![INIT_EVENT, "Y", "StateMachine0"]);
    }
}
