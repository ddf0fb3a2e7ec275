// NATS JetStream backends: event broker and document store

//! # NATS Backends
//!
//! Two JetStream-backed implementations used by deployed workers:
//!
//! - [`NatsBroker`]: a durable pull consumer on the event-source subject.
//!   Records are acked on [`commit`](Broker::commit), so anything polled but
//!   not committed is redelivered after the ack wait expires.
//! - [`NatsDocumentStore`]: namespace documents in a key-value bucket under
//!   keys `{namespace}.{document_id}`.
//!
//! Streams and buckets are created on first use.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, kv, stream, Context};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::engine::broker::{Broker, BrokerRecord};
use crate::engine::storage::DocumentStore;
use crate::{Result, TriggerflowError};

/// JetStream stream names may not contain `.`, `*`, `>` or whitespace
fn stream_name(prefix: &str, subject: &str) -> String {
    let sanitized: String = subject
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}_{}", prefix, sanitized)
}

/// Key-value keys allow letters, digits and `-_=/.` only
fn document_key(namespace: &str, document_id: &str) -> Result<String> {
    let valid = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '/'))
    };
    if !valid(namespace) || !valid(document_id) {
        return Err(TriggerflowError::Validation(format!(
            "'{}' / '{}' cannot be used as a document key",
            namespace, document_id
        )));
    }
    Ok(format!("{}.{}", namespace, document_id))
}

fn broker_error(context: &str, e: impl std::fmt::Display) -> TriggerflowError {
    TriggerflowError::Broker(format!("{}: {}", context, e))
}

fn storage_error(context: &str, e: impl std::fmt::Display) -> TriggerflowError {
    TriggerflowError::Storage(anyhow::anyhow!("{}: {}", context, e))
}

/// Durable JetStream pull consumer over one subject
pub struct NatsBroker {
    jetstream: Context,
    subject: String,
    consumer: consumer::PullConsumer,
    fetch_timeout: Duration,
    /// Polled messages awaiting their ack, by stream sequence
    pending: HashMap<u64, jetstream::Message>,
}

impl NatsBroker {
    /// Connect to `url` and bind the durable consumer `durable_name`
    pub async fn connect(
        url: &str,
        subject: &str,
        stream_prefix: &str,
        durable_name: &str,
        fetch_timeout: Duration,
    ) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| broker_error("Failed to connect to NATS", e))?;
        let jetstream = jetstream::new(client);

        let name = stream_name(stream_prefix, subject);
        let stream = jetstream
            .get_or_create_stream(stream::Config {
                name: name.clone(),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| broker_error("Failed to open stream", e))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    deliver_policy: consumer::DeliverPolicy::All,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| broker_error("Failed to create consumer", e))?;

        info!("📡 Consuming {} from stream {} as {}", subject, name, durable_name);
        Ok(Self {
            jetstream,
            subject: subject.to_string(),
            consumer,
            fetch_timeout,
            pending: HashMap::new(),
        })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn poll(&mut self) -> Result<Option<BrokerRecord>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(self.fetch_timeout)
            .messages()
            .await
            .map_err(|e| broker_error("Failed to fetch", e))?;

        let Some(message) = batch.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| broker_error("Failed to receive message", e))?;
        let offset = message
            .info()
            .map_err(|e| broker_error("Message has no JetStream metadata", e))?
            .stream_sequence;

        let record = BrokerRecord {
            offset,
            value: message.payload.to_vec(),
        };
        self.pending.insert(offset, message);
        Ok(Some(record))
    }

    async fn commit(&mut self, records: &[BrokerRecord]) -> Result<()> {
        for record in records {
            match self.pending.remove(&record.offset) {
                Some(message) => message
                    .ack()
                    .await
                    .map_err(|e| broker_error("Failed to ack message", e))?,
                None => warn!("Commit for unknown sequence {} on {}", record.offset, self.subject),
            }
        }
        Ok(())
    }

    async fn publish(&mut self, event: &Value) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.jetstream
            .publish(self.subject.clone(), Bytes::from(payload))
            .await
            .map_err(|e| broker_error("Failed to publish", e))?
            .await
            .map_err(|e| broker_error("Publish was not acknowledged", e))?;
        Ok(())
    }
}

/// Namespace documents in a JetStream key-value bucket
#[derive(Clone)]
pub struct NatsDocumentStore {
    kv: kv::Store,
}

impl NatsDocumentStore {
    /// Connect to `url` and open (or create) `bucket`
    pub async fn connect(url: &str, bucket: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| storage_error("Failed to connect to NATS", e))?;
        let jetstream = jetstream::new(client);

        let kv = match jetstream.get_key_value(bucket).await {
            Ok(kv) => {
                debug!("Using existing KV bucket: {}", bucket);
                kv
            }
            Err(_) => {
                info!("Creating KV bucket: {}", bucket);
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        description: "Triggerflow namespace documents".to_string(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| storage_error("Failed to create KV bucket", e))?
            }
        };

        Ok(Self { kv })
    }

    async fn namespace_keys(&self, namespace: &str) -> Result<Vec<String>> {
        let prefix = format!("{}.", namespace);
        let mut keys = self
            .kv
            .keys()
            .await
            .map_err(|e| storage_error("Failed to list keys", e))?;

        let mut matching = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| storage_error("Failed to read key", e))?;
            if key.starts_with(&prefix) {
                matching.push(key);
            }
        }
        Ok(matching)
    }
}

#[async_trait]
impl DocumentStore for NatsDocumentStore {
    async fn get(&self, namespace: &str, document_id: &str) -> Result<Option<Value>> {
        let key = document_key(namespace, document_id)?;
        match self
            .kv
            .get(&key)
            .await
            .map_err(|e| storage_error("Failed to read document", e))?
        {
            Some(bytes) if !bytes.is_empty() => Ok(Some(serde_json::from_slice(&bytes)?)),
            _ => Ok(None),
        }
    }

    async fn put(&self, namespace: &str, document_id: &str, document: Value) -> Result<()> {
        let key = document_key(namespace, document_id)?;
        let payload = serde_json::to_vec(&document)?;
        self.kv
            .put(&key, Bytes::from(payload))
            .await
            .map_err(|e| storage_error("Failed to write document", e))?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, document_id: &str) -> Result<bool> {
        if self.get(namespace, document_id).await?.is_none() {
            return Ok(false);
        }
        let key = document_key(namespace, document_id)?;
        self.kv
            .purge(&key)
            .await
            .map_err(|e| storage_error("Failed to delete document", e))?;
        Ok(true)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool> {
        let keys = self.namespace_keys(namespace).await?;
        for key in &keys {
            self.kv
                .purge(key)
                .await
                .map_err(|e| storage_error("Failed to delete document", e))?;
        }
        Ok(!keys.is_empty())
    }
}
