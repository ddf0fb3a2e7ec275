// In-process persistence transport backed by a document store

//! # Local Transport
//!
//! [`LocalTransport`] answers the same calls as the HTTP trigger API, but
//! writes straight into a [`DocumentStore`]. It lets a single process compile
//! a workflow, commit its triggers and run a worker over the very same store,
//! which is how tests and local runs wire the system together.
//!
//! ## Semantics
//!
//! - creating an existing namespace is a conflict
//! - event sources are kept by name; re-registering one without `overwrite`
//!   is a conflict
//! - a trigger batch is checked as a whole before anything is written: any id
//!   already stored (or repeated inside the batch) rejects the batch
//! - every trigger write also refreshes the `source_events` index document
//!
//! Errors use the status contract of the HTTP transport: conflicts surface as
//! [`TriggerflowError::ResourceAlreadyExists`], missing namespaces as a
//! `Transport` error with status 404.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::transport::PersistenceTransport;
use crate::engine::storage::{load, save, DocumentStore};
use crate::models::{add_to_index, documents, EventSource, SourceEvents, Trigger};
use crate::{Result, TriggerflowError};

/// Persistence transport writing into a local document store
#[derive(Clone)]
pub struct LocalTransport {
    store: Arc<dyn DocumentStore>,
}

impl LocalTransport {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// The document store this transport writes into
    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    async fn require_namespace(&self, namespace: &str) -> Result<()> {
        if self.store.namespace_exists(namespace).await? {
            Ok(())
        } else {
            Err(TriggerflowError::Transport {
                status: Some(404),
                body: json!({"error": format!("Namespace {} not found", namespace)}).to_string(),
            })
        }
    }
}

#[async_trait]
impl PersistenceTransport for LocalTransport {
    async fn put_namespace(
        &self,
        namespace: &str,
        global_context: &Map<String, Value>,
        event_source: Option<&EventSource>,
    ) -> Result<Value> {
        if self.store.namespace_exists(namespace).await? {
            return Err(TriggerflowError::ResourceAlreadyExists(
                json!({"error": format!("Namespace {} already exists", namespace)}).to_string(),
            ));
        }

        let store = self.store.as_ref();
        save(store, namespace, documents::GLOBAL_CONTEXT, global_context).await?;
        save(store, namespace, documents::TRIGGERS, &HashMap::<String, Trigger>::new()).await?;
        save(store, namespace, documents::SOURCE_EVENTS, &SourceEvents::new()).await?;

        let mut sources: HashMap<String, EventSource> = HashMap::new();
        if let Some(source) = event_source {
            save(store, namespace, documents::EVENT_SOURCE, source).await?;
            sources.insert(source.name.clone(), source.clone());
        }
        save(store, namespace, documents::EVENT_SOURCES, &sources).await?;

        debug!("Created namespace {}", namespace);
        Ok(json!({ "namespace": namespace }))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<Value> {
        self.require_namespace(namespace).await?;
        self.store.delete_namespace(namespace).await?;
        debug!("Deleted namespace {}", namespace);
        Ok(json!({ "deleted": namespace }))
    }

    async fn put_event_source(
        &self,
        namespace: &str,
        event_source: &EventSource,
        overwrite: bool,
    ) -> Result<Value> {
        self.require_namespace(namespace).await?;
        let store = self.store.as_ref();

        let mut sources: HashMap<String, EventSource> =
            load(store, namespace, documents::EVENT_SOURCES).await?.unwrap_or_default();
        if sources.contains_key(&event_source.name) && !overwrite {
            return Err(TriggerflowError::ResourceAlreadyExists(
                json!({"error": format!("Event source {} already exists", event_source.name)}).to_string(),
            ));
        }

        sources.insert(event_source.name.clone(), event_source.clone());
        save(store, namespace, documents::EVENT_SOURCES, &sources).await?;
        save(store, namespace, documents::EVENT_SOURCE, event_source).await?;

        Ok(json!({ "eventsource": event_source.name }))
    }

    async fn post_triggers(&self, namespace: &str, triggers: &[Trigger]) -> Result<Value> {
        self.require_namespace(namespace).await?;
        let store = self.store.as_ref();

        let mut stored: HashMap<String, Trigger> =
            load(store, namespace, documents::TRIGGERS).await?.unwrap_or_default();

        let mut batch_ids = HashSet::new();
        for trigger in triggers {
            if stored.contains_key(&trigger.trigger_id) || !batch_ids.insert(trigger.trigger_id.as_str()) {
                return Err(TriggerflowError::ResourceAlreadyExists(
                    json!({"error": format!("Trigger {} already exists", trigger.trigger_id)}).to_string(),
                ));
            }
        }

        let mut index: SourceEvents = load(store, namespace, documents::SOURCE_EVENTS)
            .await?
            .unwrap_or_default();
        for trigger in triggers {
            add_to_index(&mut index, trigger);
            stored.insert(trigger.trigger_id.clone(), trigger.clone());
        }

        save(store, namespace, documents::TRIGGERS, &stored).await?;
        save(store, namespace, documents::SOURCE_EVENTS, &index).await?;

        debug!("Stored {} triggers in namespace {}", triggers.len(), namespace);
        let ids: Vec<&str> = triggers.iter().map(|t| t.trigger_id.as_str()).collect();
        Ok(json!({ "triggers": ids }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryDocumentStore;
    use crate::models::CloudEvent;

    fn transport() -> LocalTransport {
        LocalTransport::new(Arc::new(InMemoryDocumentStore::new()))
    }

    fn trigger(id: &str, subjects: &[&str]) -> Trigger {
        Trigger {
            trigger_id: id.to_string(),
            condition: "true".to_string(),
            action: "pass".to_string(),
            context: Map::new(),
            depends_on_events: subjects.iter().map(|s| CloudEvent::new(*s)).collect(),
            transient: false,
        }
    }

    #[tokio::test]
    async fn test_namespace_conflict() {
        let transport = transport();
        transport.put_namespace("ns", &Map::new(), None).await.unwrap();

        let err = transport.put_namespace("ns", &Map::new(), None).await.unwrap_err();
        assert!(matches!(err, TriggerflowError::ResourceAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_triggers_require_namespace() {
        let err = transport()
            .post_triggers("missing", &[trigger("t1", &["A"])])
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerflowError::Transport { status: Some(404), .. }));
    }

    #[tokio::test]
    async fn test_post_triggers_updates_index() {
        let transport = transport();
        transport.put_namespace("ns", &Map::new(), None).await.unwrap();
        transport
            .post_triggers("ns", &[trigger("t1", &["A"]), trigger("t2", &["A", "B"])])
            .await
            .unwrap();

        let store = transport.store();
        let index: SourceEvents = load(store.as_ref(), "ns", documents::SOURCE_EVENTS)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index["A"], vec!["t1", "t2"]);
        assert_eq!(index["B"], vec!["t2"]);
    }

    #[tokio::test]
    async fn test_duplicate_batch_is_rejected_whole() {
        let transport = transport();
        transport.put_namespace("ns", &Map::new(), None).await.unwrap();
        transport.post_triggers("ns", &[trigger("t1", &["A"])]).await.unwrap();

        let err = transport
            .post_triggers("ns", &[trigger("t2", &["B"]), trigger("t1", &["C"])])
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerflowError::ResourceAlreadyExists(_)));

        let store = transport.store();
        let stored: HashMap<String, Trigger> = load(store.as_ref(), "ns", documents::TRIGGERS)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["t1"].depends_on_events[0].subject, "A");
    }

    #[tokio::test]
    async fn test_event_source_overwrite() {
        let transport = transport();
        transport.put_namespace("ns", &Map::new(), None).await.unwrap();

        let source = EventSource::memory("src", "topic-a");
        transport.put_event_source("ns", &source, false).await.unwrap();
        assert!(matches!(
            transport.put_event_source("ns", &source, false).await,
            Err(TriggerflowError::ResourceAlreadyExists(_))
        ));

        let replacement = EventSource::memory("src", "topic-b");
        transport.put_event_source("ns", &replacement, true).await.unwrap();

        let store = transport.store();
        let active: EventSource = load(store.as_ref(), "ns", documents::EVENT_SOURCE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active, replacement);
    }

    #[tokio::test]
    async fn test_delete_namespace() {
        let transport = transport();
        transport.put_namespace("ns", &Map::new(), None).await.unwrap();
        transport.delete_namespace("ns").await.unwrap();
        assert!(transport.delete_namespace("ns").await.is_err());
    }
}
