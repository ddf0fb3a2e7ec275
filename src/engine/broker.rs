// Broker abstraction over a namespace's event log

//! # Brokers
//!
//! A [`Broker`] is a cursor over one event log with Kafka-like semantics:
//!
//! - [`poll`](Broker::poll) returns at most one record, or `None` when the log
//!   has nothing new
//! - [`commit`](Broker::commit) marks records as processed; a broker reopened
//!   on the same log resumes after the last committed record, so anything
//!   polled but not committed is delivered again (at-least-once)
//! - [`publish`](Broker::publish) appends an event to the same log, which is
//!   how state actions announce their completion
//!
//! [`MemoryHub`] provides in-process topics for tests and single-process runs;
//! [`NatsBroker`](crate::engine::nats::NatsBroker) consumes a JetStream
//! subject. [`BrokerResolver`] picks the implementation from an
//! [`EventSource`] descriptor's `event_source_type` tag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::nats::NatsBroker;
use crate::models::{EventSource, EventSourceKind};
use crate::{Result, TriggerflowError};

/// One record read from an event log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    /// Position of the record in its log
    pub offset: u64,
    /// Raw payload, expected to be a JSON event
    pub value: Vec<u8>,
}

impl BrokerRecord {
    /// Decode the payload as JSON
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

/// Poll/commit/publish access to an event log
#[async_trait]
pub trait Broker: Send + Sync {
    /// Next uncommitted record, if any
    async fn poll(&mut self) -> Result<Option<BrokerRecord>>;

    /// Mark records as processed
    async fn commit(&mut self, records: &[BrokerRecord]) -> Result<()>;

    /// Append an event to the log
    async fn publish(&mut self, event: &Value) -> Result<()>;
}

#[derive(Debug, Default)]
struct Topic {
    log: Vec<Vec<u8>>,
    committed: u64,
}

/// Shared in-process topics
///
/// Cloning a hub is cheap and every clone sees the same topics.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a JSON event to `topic` and return its offset
    pub async fn publish(&self, topic: &str, event: &Value) -> Result<u64> {
        self.publish_raw(topic, serde_json::to_vec(event)?).await
    }

    /// Append raw bytes to `topic` and return their offset
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<u64> {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(topic.to_string()).or_default();
        topic.log.push(payload);
        Ok(topic.log.len() as u64 - 1)
    }

    /// Consumer over `topic`, starting after its committed offset
    pub fn broker(&self, topic: &str) -> MemoryBroker {
        MemoryBroker {
            hub: self.clone(),
            topic: topic.to_string(),
            cursor: None,
        }
    }

    /// Offset of the first record not yet committed
    pub async fn committed_offset(&self, topic: &str) -> u64 {
        self.topics.lock().await.get(topic).map_or(0, |t| t.committed)
    }

    /// Every JSON event on `topic`, skipping payloads that do not decode
    pub async fn events(&self, topic: &str) -> Vec<Value> {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|t| t.log.iter().filter_map(|raw| serde_json::from_slice(raw).ok()).collect())
            .unwrap_or_default()
    }
}

/// Cursor over one [`MemoryHub`] topic
#[derive(Debug)]
pub struct MemoryBroker {
    hub: MemoryHub,
    topic: String,
    cursor: Option<u64>,
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn poll(&mut self) -> Result<Option<BrokerRecord>> {
        let mut topics = self.hub.topics.lock().await;
        let topic = topics.entry(self.topic.clone()).or_default();

        let offset = *self.cursor.get_or_insert(topic.committed);
        match topic.log.get(offset as usize) {
            Some(value) => {
                self.cursor = Some(offset + 1);
                Ok(Some(BrokerRecord {
                    offset,
                    value: value.clone(),
                }))
            }
            None => Ok(None),
        }
    }

    async fn commit(&mut self, records: &[BrokerRecord]) -> Result<()> {
        let Some(last) = records.iter().map(|r| r.offset).max() else {
            return Ok(());
        };

        let mut topics = self.hub.topics.lock().await;
        let topic = topics.entry(self.topic.clone()).or_default();
        topic.committed = topic.committed.max(last + 1);
        Ok(())
    }

    async fn publish(&mut self, event: &Value) -> Result<()> {
        self.hub.publish(&self.topic, event).await.map(|_| ())
    }
}

/// Resolves event-source descriptors to broker clients
#[derive(Debug, Clone)]
pub struct BrokerResolver {
    hub: Option<MemoryHub>,
    stream_prefix: String,
    fetch_timeout: Duration,
}

impl Default for BrokerResolver {
    fn default() -> Self {
        Self {
            hub: None,
            stream_prefix: "TRIGGERFLOW".to_string(),
            fetch_timeout: Duration::from_secs(1),
        }
    }
}

impl BrokerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `memory` event sources from `hub`
    pub fn with_memory_hub(mut self, hub: MemoryHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Prefix of JetStream stream names created for `nats` event sources
    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    /// How long a JetStream poll waits for a message
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Build the broker for `source`, consuming on behalf of `namespace`
    pub async fn resolve(&self, source: &EventSource, namespace: &str) -> Result<Box<dyn Broker>> {
        debug!("Resolving {} event source {} for {}", source.source_type(), source.name, namespace);

        match &source.kind {
            EventSourceKind::Memory { topic } => {
                let hub = self.hub.as_ref().ok_or_else(|| {
                    TriggerflowError::Broker(format!(
                        "event source {} is in-memory but no memory hub is configured",
                        source.name
                    ))
                })?;
                Ok(Box::new(hub.broker(topic)))
            }
            EventSourceKind::Nats { url, subject } => {
                let broker = NatsBroker::connect(
                    url,
                    subject,
                    &self.stream_prefix,
                    &format!("triggerflow_{}", namespace),
                    self.fetch_timeout,
                )
                .await?;
                Ok(Box::new(broker))
            }
        }
    }
}
