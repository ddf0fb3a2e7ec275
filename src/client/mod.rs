// Trigger Store - namespace-scoped client for trigger definitions

//! # Trigger Store
//!
//! [`TriggerStore`] is the client API for namespaces, event sources and
//! triggers. It runs in one of two modes, chosen once at construction:
//!
//! - [`StoreMode::Cached`]: triggers are kept in a local cache and sent to the
//!   persistence layer in one request by [`TriggerStore::commit_cached_triggers`].
//!   The compiler uses this mode so a whole workflow lands atomically.
//! - [`StoreMode::Remote`]: every trigger is written straight through the
//!   [`PersistenceTransport`].
//!
//! Namespace and event-source operations always go through the transport.
//!
//! ## Example
//!
//! ```rust,no_run
//! use triggerflow::{CloudEvent, Credentials, NewTrigger, StoreMode, TriggerStore};
//!
//! # async fn run() -> triggerflow::Result<()> {
//! let credentials = Credentials::new("admin", "s3cret")?;
//! let mut store = TriggerStore::connect("http://localhost:8080", credentials, StoreMode::Cached)?;
//! store.create_namespace("run_1", None, None).await?;
//! store.add_trigger(NewTrigger::on(CloudEvent::new("init__")).persistent("first")).await?;
//! store.commit_cached_triggers().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Rust Learning Notes
//!
//! The cache keeps a `HashMap` for lookups plus a `Vec` of ids for insertion
//! order, so committed batches and listings come out in the order triggers
//! were added.

pub mod transport;

pub mod local;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{EventSource, NewTrigger, Trigger, NAMESPACE_KEY};
use crate::{Result, TriggerflowError};
use transport::{HttpTransport, PersistenceTransport};

lazy_static! {
    static ref USERNAME_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_]+$").unwrap();
    static ref PASSWORD_PATTERN: Regex = Regex::new(r"^[A-Za-z\d@$!%*#?&]+$").unwrap();
}

/// Basic-auth principal, validated before any network activity
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    /// Validate and build credentials
    ///
    /// The username must match `[A-Za-z0-9_]+`. The password must contain at
    /// least one letter and only letters, digits and `@$!%*#?&`.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let user = user.into();
        let password = password.into();

        if !USERNAME_PATTERN.is_match(&user) {
            return Err(TriggerflowError::Validation(format!("Invalid username '{}'", user)));
        }
        if !PASSWORD_PATTERN.is_match(&password) || !password.chars().any(|c| c.is_ascii_alphabetic()) {
            return Err(TriggerflowError::Validation("Invalid password".to_string()));
        }

        Ok(Self { user, password })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where `add_trigger` sends new triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Keep triggers locally until `commit_cached_triggers`
    Cached,
    /// Write each trigger through the transport immediately
    Remote,
}

/// Namespace-scoped CRUD over trigger definitions
pub struct TriggerStore {
    transport: Arc<dyn PersistenceTransport>,
    credentials: Credentials,
    mode: StoreMode,
    namespace: Option<String>,
    cache: HashMap<String, Trigger>,
    cache_order: Vec<String>,
}

impl TriggerStore {
    /// Store backed by the HTTP trigger API at `endpoint`
    pub fn connect(endpoint: &str, credentials: Credentials, mode: StoreMode) -> Result<Self> {
        let transport = HttpTransport::new(endpoint, credentials.clone())?;
        Ok(Self::with_transport(credentials, Arc::new(transport), mode))
    }

    /// Store backed by the API section of the configuration
    pub fn from_config(config: &crate::config::ApiConfig, mode: StoreMode) -> Result<Self> {
        let credentials = Credentials::new(&config.user, &config.password)?;
        Self::connect(&config.endpoint, credentials, mode)
    }

    /// Store backed by any persistence transport
    pub fn with_transport(
        credentials: Credentials,
        transport: Arc<dyn PersistenceTransport>,
        mode: StoreMode,
    ) -> Self {
        Self {
            transport,
            credentials,
            mode,
            namespace: None,
            cache: HashMap::new(),
            cache_order: Vec::new(),
        }
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The active namespace, if any
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Make `namespace` the active namespace without contacting the server
    pub fn target_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = Some(namespace.into());
    }

    fn active_namespace(&self) -> Result<&str> {
        self.namespace.as_deref().ok_or(TriggerflowError::NullNamespace)
    }

    /// Create a namespace and make it active
    ///
    /// `global_context` must be a JSON object when given; the namespace name is
    /// stored in it under the `namespace` key. Fails with
    /// [`TriggerflowError::ResourceAlreadyExists`] if the namespace exists.
    pub async fn create_namespace(
        &mut self,
        name: &str,
        global_context: Option<Value>,
        event_source: Option<EventSource>,
    ) -> Result<Value> {
        let mut context = match global_context {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(TriggerflowError::Validation(format!(
                    "Global context must be a JSON object, got {}",
                    other
                )))
            }
        };
        context.insert(NAMESPACE_KEY.to_string(), Value::String(name.to_string()));

        let response = self
            .transport
            .put_namespace(name, &context, event_source.as_ref())
            .await?;

        info!("📁 Created namespace {}", name);
        self.namespace = Some(name.to_string());
        Ok(response)
    }

    /// Delete `namespace`, or the active namespace when `None`
    pub async fn delete_namespace(&mut self, namespace: Option<&str>) -> Result<Value> {
        let target = match namespace {
            Some(name) => name.to_string(),
            None => self.active_namespace()?.to_string(),
        };

        let response = self.transport.delete_namespace(&target).await?;
        info!("🗑️ Deleted namespace {}", target);

        if self.namespace.as_deref() == Some(target.as_str()) {
            self.namespace = None;
        }
        Ok(response)
    }

    /// Register an event source on the active namespace
    pub async fn add_event_source(&self, event_source: &EventSource, overwrite: bool) -> Result<Value> {
        let namespace = self.active_namespace()?;
        debug!(
            "Registering {} event source {} on {}",
            event_source.source_type(),
            event_source.name,
            namespace
        );
        self.transport
            .put_event_source(namespace, event_source, overwrite)
            .await
    }

    /// Add a trigger to the active namespace and return its id
    ///
    /// Checks run before anything is stored: an active namespace is required,
    /// a transient trigger may not carry an id, and the context must be a JSON
    /// object. Triggers without an id get a generated one.
    pub async fn add_trigger(&mut self, trigger: NewTrigger) -> Result<String> {
        let namespace = self.active_namespace()?.to_string();

        if trigger.transient {
            if let Some(id) = &trigger.trigger_id {
                return Err(TriggerflowError::NamedTransientTrigger(id.clone()));
            }
        }

        let context = match &trigger.context {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(TriggerflowError::Validation(format!(
                    "Trigger context must be a JSON object, got {}",
                    other
                )))
            }
        };

        match self.mode {
            StoreMode::Cached => {
                let trigger_id = match &trigger.trigger_id {
                    Some(id) if self.cache.contains_key(id) => {
                        return Err(TriggerflowError::DuplicateTrigger(id.clone()))
                    }
                    Some(id) => id.clone(),
                    None => Uuid::new_v4().to_string(),
                };

                let trigger = trigger.into_trigger(trigger_id.clone(), context);
                self.cache.insert(trigger_id.clone(), trigger);
                self.cache_order.push(trigger_id.clone());
                debug!("Cached trigger {} for namespace {}", trigger_id, namespace);
                Ok(trigger_id)
            }
            StoreMode::Remote => {
                let trigger_id = trigger
                    .trigger_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let trigger = trigger.into_trigger(trigger_id.clone(), context);

                self.transport
                    .post_triggers(&namespace, std::slice::from_ref(&trigger))
                    .await?;
                debug!("Stored trigger {} in namespace {}", trigger_id, namespace);
                Ok(trigger_id)
            }
        }
    }

    /// Remove a cached trigger
    pub fn delete_trigger(&mut self, trigger_id: &str) -> Result<Trigger> {
        self.require_cache("delete_trigger")?;
        let removed = self
            .cache
            .remove(trigger_id)
            .ok_or_else(|| TriggerflowError::NotFound(format!("Trigger {} does not exist", trigger_id)))?;
        self.cache_order.retain(|id| id != trigger_id);
        Ok(removed)
    }

    /// Look up a cached trigger
    pub fn get_trigger(&self, trigger_id: &str) -> Result<Trigger> {
        self.require_cache("get_trigger")?;
        self.cache
            .get(trigger_id)
            .cloned()
            .ok_or_else(|| TriggerflowError::NotFound(format!("Trigger {} does not exist", trigger_id)))
    }

    /// Replace a cached trigger's definition, keeping its id
    pub fn amend_trigger(&mut self, trigger_id: &str, mut trigger: Trigger) -> Result<()> {
        self.require_cache("amend_trigger")?;
        let slot = self
            .cache
            .get_mut(trigger_id)
            .ok_or_else(|| TriggerflowError::NotFound(format!("Trigger {} does not exist", trigger_id)))?;
        trigger.trigger_id = trigger_id.to_string();
        *slot = trigger;
        Ok(())
    }

    /// Send the whole cache to the persistence layer in one request
    ///
    /// The cache is kept after a successful commit; call
    /// [`flush_cached_triggers`](Self::flush_cached_triggers) to discard it.
    pub async fn commit_cached_triggers(&self) -> Result<Value> {
        if self.mode != StoreMode::Cached {
            return Err(TriggerflowError::CachingDisabled);
        }
        if self.cache.is_empty() {
            return Err(TriggerflowError::EmptyCache);
        }
        let namespace = self.active_namespace()?;

        let triggers = self.list_cached_triggers()?;
        let response = self.transport.post_triggers(namespace, &triggers).await?;
        info!("📤 Committed {} triggers to namespace {}", triggers.len(), namespace);
        Ok(response)
    }

    /// Cached triggers in insertion order
    pub fn list_cached_triggers(&self) -> Result<Vec<Trigger>> {
        if self.mode != StoreMode::Cached {
            return Err(TriggerflowError::CachingDisabled);
        }
        Ok(self
            .cache_order
            .iter()
            .filter_map(|id| self.cache.get(id).cloned())
            .collect())
    }

    /// Discard every cached trigger
    pub fn flush_cached_triggers(&mut self) {
        self.cache.clear();
        self.cache_order.clear();
    }

    fn require_cache(&self, operation: &str) -> Result<()> {
        match self.mode {
            StoreMode::Cached => Ok(()),
            StoreMode::Remote => Err(TriggerflowError::Unimplemented(format!("remote {}", operation))),
        }
    }
}

impl fmt::Debug for TriggerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerStore")
            .field("mode", &self.mode)
            .field("namespace", &self.namespace)
            .field("cached", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::{load, InMemoryDocumentStore};
    use crate::models::{documents, CloudEvent};
    use crate::LocalTransport;
    use serde_json::json;

    fn credentials() -> Credentials {
        Credentials::new("tester", "secret1").unwrap()
    }

    fn local_store(mode: StoreMode) -> (TriggerStore, Arc<InMemoryDocumentStore>) {
        let backing = Arc::new(InMemoryDocumentStore::new());
        let transport = Arc::new(LocalTransport::new(backing.clone()));
        (TriggerStore::with_transport(credentials(), transport, mode), backing)
    }

    #[test]
    fn test_credential_validation() {
        assert!(Credentials::new("user_1", "abc123").is_ok());
        assert!(Credentials::new("user_1", "p@ss$word!").is_ok());
        assert!(matches!(Credentials::new("bad user", "abc123"), Err(TriggerflowError::Validation(_))));
        assert!(matches!(Credentials::new("", "abc123"), Err(TriggerflowError::Validation(_))));
        assert!(matches!(Credentials::new("user", "123456"), Err(TriggerflowError::Validation(_))));
        assert!(matches!(Credentials::new("user", "abc def"), Err(TriggerflowError::Validation(_))));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let printed = format!("{:?}", credentials());
        assert!(printed.contains("tester"));
        assert!(!printed.contains("secret1"));
    }

    #[tokio::test]
    async fn test_add_trigger_requires_namespace() {
        let (mut store, _) = local_store(StoreMode::Cached);
        let err = store.add_trigger(NewTrigger::on(CloudEvent::new("A"))).await.unwrap_err();
        assert!(matches!(err, TriggerflowError::NullNamespace));
    }

    #[tokio::test]
    async fn test_named_transient_trigger_is_rejected() {
        let (mut store, _) = local_store(StoreMode::Cached);
        store.target_namespace("ns");

        let err = store
            .add_trigger(NewTrigger::on(CloudEvent::new("A")).trigger_id("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerflowError::NamedTransientTrigger(id) if id == "t1"));
        assert!(store.list_cached_triggers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_context_must_be_object() {
        let (mut store, _) = local_store(StoreMode::Cached);
        store.target_namespace("ns");

        let err = store
            .add_trigger(NewTrigger::on(CloudEvent::new("A")).context(json!([1, 2])))
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_cached_trigger_keeps_first() {
        let (mut store, _) = local_store(StoreMode::Cached);
        store.target_namespace("ns");

        store
            .add_trigger(NewTrigger::on(CloudEvent::new("A")).action("task").persistent("t1"))
            .await
            .unwrap();
        let err = store
            .add_trigger(NewTrigger::on(CloudEvent::new("B")).persistent("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerflowError::DuplicateTrigger(id) if id == "t1"));

        let first = store.get_trigger("t1").unwrap();
        assert_eq!(first.action, "task");
        assert_eq!(first.depends_on_events, vec![CloudEvent::new("A")]);
    }

    #[tokio::test]
    async fn test_generated_ids_are_cached_in_order() {
        let (mut store, _) = local_store(StoreMode::Cached);
        store.target_namespace("ns");

        let first = store.add_trigger(NewTrigger::on(CloudEvent::new("A"))).await.unwrap();
        let second = store
            .add_trigger(NewTrigger::on(vec![CloudEvent::new("A"), CloudEvent::new("B")]))
            .await
            .unwrap();
        assert_ne!(first, second);

        let ids: Vec<String> = store
            .list_cached_triggers()
            .unwrap()
            .into_iter()
            .map(|t| t.trigger_id)
            .collect();
        assert_eq!(ids, vec![first.clone(), second]);

        store.delete_trigger(&first).unwrap();
        assert!(matches!(store.get_trigger(&first), Err(TriggerflowError::NotFound(_))));
        assert_eq!(store.list_cached_triggers().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_amend_cached_trigger() {
        let (mut store, _) = local_store(StoreMode::Cached);
        store.target_namespace("ns");
        store
            .add_trigger(NewTrigger::on(CloudEvent::new("A")).persistent("t1"))
            .await
            .unwrap();

        let mut amended = store.get_trigger("t1").unwrap();
        amended.action = "terminate".to_string();
        amended.trigger_id = "ignored".to_string();
        store.amend_trigger("t1", amended).unwrap();

        assert_eq!(store.get_trigger("t1").unwrap().action, "terminate");
        assert!(store.get_trigger("ignored").is_err());
        assert!(matches!(
            store.amend_trigger("missing", store.get_trigger("t1").unwrap()),
            Err(TriggerflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_mode_paths() {
        let (mut store, backing) = local_store(StoreMode::Remote);
        store.create_namespace("ns", None, None).await.unwrap();

        let id = store
            .add_trigger(NewTrigger::on(CloudEvent::new("A")).persistent("t1"))
            .await
            .unwrap();
        assert_eq!(id, "t1");

        let stored: HashMap<String, Trigger> = load(backing.as_ref(), "ns", documents::TRIGGERS)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.contains_key("t1"));

        assert!(matches!(store.get_trigger("t1"), Err(TriggerflowError::Unimplemented(_))));
        assert!(matches!(store.delete_trigger("t1"), Err(TriggerflowError::Unimplemented(_))));
        assert!(matches!(store.list_cached_triggers(), Err(TriggerflowError::CachingDisabled)));
        assert!(matches!(store.commit_cached_triggers().await, Err(TriggerflowError::CachingDisabled)));

        let err = store
            .add_trigger(NewTrigger::on(CloudEvent::new("B")).persistent("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerflowError::ResourceAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_commit_cached_triggers() {
        let (mut store, backing) = local_store(StoreMode::Cached);
        store.create_namespace("ns", Some(json!({"k": 1})), None).await.unwrap();
        assert!(matches!(store.commit_cached_triggers().await, Err(TriggerflowError::EmptyCache)));

        store
            .add_trigger(NewTrigger::on(CloudEvent::new("A")).persistent("t1"))
            .await
            .unwrap();
        let response = store.commit_cached_triggers().await.unwrap();
        assert_eq!(response, json!({"triggers": ["t1"]}));

        let context: Map<String, Value> = load(backing.as_ref(), "ns", documents::GLOBAL_CONTEXT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(context["namespace"], "ns");
        assert_eq!(context["k"], 1);

        store.flush_cached_triggers();
        assert!(store.list_cached_triggers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let (mut store, _) = local_store(StoreMode::Cached);
        assert!(matches!(store.delete_namespace(None).await, Err(TriggerflowError::NullNamespace)));
        assert!(matches!(
            store.create_namespace("ns", Some(json!("text")), None).await,
            Err(TriggerflowError::Validation(_))
        ));

        store.create_namespace("ns", None, None).await.unwrap();
        assert_eq!(store.namespace(), Some("ns"));
        assert!(matches!(
            store.create_namespace("ns", None, None).await,
            Err(TriggerflowError::ResourceAlreadyExists(_))
        ));

        store
            .add_event_source(&EventSource::memory("events", "ns"), false)
            .await
            .unwrap();

        store.delete_namespace(None).await.unwrap();
        assert_eq!(store.namespace(), None);
    }
}
