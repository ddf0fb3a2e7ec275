// Document storage abstraction for namespace metadata and triggers
// This defines the interface for persisting JSON documents per namespace

//! # Document Store Abstraction
//!
//! Namespaces persist their state as a handful of JSON documents keyed by
//! `(namespace, document_id)`:
//!
//! | Document | Contents |
//! |---|---|
//! | `global_context` | read-only key-value state shared by all triggers |
//! | `event_source` | the event-source descriptor the worker consumes |
//! | `event_sources` | every registered event source, by name |
//! | `triggers` | trigger definitions by id |
//! | `source_events` | subject → ids of triggers waiting on it |
//! | `worker_{uuid}` | per-worker status written on shutdown |
//!
//! The layer follows the **Repository Pattern**: the [`DocumentStore`] trait
//! defines the operations, [`InMemoryDocumentStore`] backs tests and local
//! runs, and [`NatsDocumentStore`](crate::engine::nats::NatsDocumentStore)
//! persists to a JetStream key-value bucket.
//!
//! ## Thread Safety
//!
//! Implementations must be `Send + Sync`; the in-memory store guards its maps
//! with a `tokio::sync::RwLock` so readers never block each other.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::models::documents;
use crate::Result;

/// Keyed get/put of JSON documents, scoped by namespace
///
/// ## Return Values
/// `Result<Option<Value>>` separates "the store failed" (`Err`) from "no such
/// document" (`Ok(None)`).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document
    async fn get(&self, namespace: &str, document_id: &str) -> Result<Option<Value>>;

    /// Create or replace a document
    async fn put(&self, namespace: &str, document_id: &str, document: Value) -> Result<()>;

    /// Remove a document, reporting whether it existed
    async fn delete(&self, namespace: &str, document_id: &str) -> Result<bool>;

    /// Remove every document of a namespace, reporting whether any existed
    async fn delete_namespace(&self, namespace: &str) -> Result<bool>;

    /// A namespace exists once its global context has been written
    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        Ok(self.get(namespace, documents::GLOBAL_CONTEXT).await?.is_some())
    }
}

/// Fetch a document and deserialize it into `T`
pub async fn load<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    namespace: &str,
    document_id: &str,
) -> Result<Option<T>> {
    match store.get(namespace, document_id).await? {
        Some(document) => Ok(Some(serde_json::from_value(document)?)),
        None => Ok(None),
    }
}

/// Serialize `document` and store it
pub async fn save<T: Serialize + ?Sized>(
    store: &dyn DocumentStore,
    namespace: &str,
    document_id: &str,
    document: &T,
) -> Result<()> {
    store
        .put(namespace, document_id, serde_json::to_value(document)?)
        .await
}

/// In-memory document store for development and testing
///
/// ## Limitations
///
/// - **Not persistent**: data is lost when the process exits
/// - **Not distributed**: cannot be shared across processes
#[derive(Default)]
pub struct InMemoryDocumentStore {
    /// Namespace → document id → document
    namespaces: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, namespace: &str, document_id: &str) -> Result<Option<Value>> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces
            .get(namespace)
            .and_then(|documents| documents.get(document_id))
            .cloned())
    }

    async fn put(&self, namespace: &str, document_id: &str, document: Value) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(document_id.to_string(), document);
        Ok(())
    }

    async fn delete(&self, namespace: &str, document_id: &str) -> Result<bool> {
        let mut namespaces = self.namespaces.write().await;
        Ok(namespaces
            .get_mut(namespace)
            .map_or(false, |documents| documents.remove(document_id).is_some()))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool> {
        let mut namespaces = self.namespaces.write().await;
        Ok(namespaces.remove(namespace).is_some())
    }
}
