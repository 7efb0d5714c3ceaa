//! Narrow interfaces to the managed services the harness consumes
//!
//! Sources and sinks never talk to a cloud SDK directly. They go through
//! three object-safe traits shared as `Arc<dyn ...>`:
//! - `ObjectStore` for blob reads and writes
//! - `MessageQueue` for receive / delete / visibility / batched send
//! - `KeyValueTable` for single-row conditional writes
//!
//! Two implementations ship: in-memory and local-filesystem.

mod local;
mod memory;

pub use local::{LocalObjectStore, LocalQueue, LocalTable};
pub use memory::{MemoryObjectStore, MemoryQueue, MemoryTable};

use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use async_trait::async_trait;

/// Largest number of entries accepted by one `send_batch` call
pub const MAX_SEND_BATCH: usize = 10;

/// Location of an object: bucket plus verbatim key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `scheme://bucket/key`; the key is kept exactly as written
    pub fn parse(uri: &str) -> Result<Self, BackendError> {
        let uri = uri.trim();
        let parsed = url::Url::parse(uri)
            .map_err(|e| BackendError::Invalid(format!("malformed object uri `{}`: {}", uri, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(BackendError::Invalid(format!(
                "object uri `{}` has no bucket",
                uri
            )));
        }

        let rest = uri
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| BackendError::Invalid(format!("object uri `{}` has no scheme", uri)))?;

        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::new(bucket, key))
            }
            _ => Err(BackendError::Invalid(format!(
                "object uri `{}` must look like scheme://bucket/key",
                uri
            ))),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, object: &ObjectRef) -> Result<Vec<u8>, BackendError>;

    /// Create or overwrite an object
    async fn put_object(
        &self,
        object: &ObjectRef,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BackendError>;
}

/// Options for one receive call
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    /// Long-poll duration
    pub wait_time: Duration,
    /// How long received messages stay hidden from other consumers
    pub visibility_timeout: Duration,
}

/// A received message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// Number of times the message has been received, this delivery included
    pub receive_count: u32,
}

/// A message to enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Batch-local entry id
    pub id: String,
    pub body: String,
    /// Content-derived de-duplication id
    pub dedup_id: Option<String>,
}

/// Per-entry failure from `send_batch`
#[derive(Debug, Clone, PartialEq)]
pub struct SendFailure {
    pub id: String,
    pub reason: String,
}

/// Managed message queue
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn receive(
        &self,
        queue: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, BackendError>;

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<(), BackendError>;

    /// Reset the visibility window of an in-flight message (zero means visible now)
    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), BackendError>;

    /// Enqueue up to `MAX_SEND_BATCH` messages; returns the entries that failed
    async fn send_batch(
        &self,
        queue: &str,
        messages: &[OutgoingMessage],
    ) -> Result<Vec<SendFailure>, BackendError>;
}

/// Table row
pub type Item = serde_json::Map<String, Value>;

/// Primary key of a row: hash key plus optional range key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableKey {
    pub hash: String,
    pub range: Option<String>,
}

impl TableKey {
    pub fn hash(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            range: None,
        }
    }

    pub fn with_range(hash: impl Into<String>, range: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            range: Some(range.into()),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            Some(range) => write!(f, "{}/{}", self.hash, range),
            None => f.write_str(&self.hash),
        }
    }
}

/// Guard for a single-row write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCondition {
    Always,
    /// Fails if the row already exists
    NotExists,
    /// Fails unless the stored row's numeric `field` equals `version`
    VersionEquals { field: String, version: u64 },
}

/// Key-value table with single-row conditional writes
#[async_trait]
pub trait KeyValueTable: Send + Sync {
    async fn get_item(&self, table: &str, key: &TableKey) -> Result<Option<Item>, BackendError>;

    async fn put_item(
        &self,
        table: &str,
        key: &TableKey,
        item: Item,
        condition: WriteCondition,
    ) -> Result<(), BackendError>;

    async fn scan(&self, table: &str) -> Result<Vec<(TableKey, Item)>, BackendError>;
}

/// The set of backends a run is wired against
#[derive(Clone)]
pub struct Backends {
    pub objects: Arc<dyn ObjectStore>,
    pub queues: Arc<dyn MessageQueue>,
    pub tables: Arc<dyn KeyValueTable>,
}

impl Backends {
    /// Process-local backends; state is lost on exit
    pub fn in_memory() -> Self {
        Self {
            objects: Arc::new(MemoryObjectStore::new()),
            queues: Arc::new(MemoryQueue::new()),
            tables: Arc::new(MemoryTable::new()),
        }
    }

    /// Filesystem backends rooted at `root`
    pub fn local(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;

        Ok(Self {
            objects: Arc::new(LocalObjectStore::new(root.join("objects"))),
            queues: Arc::new(LocalQueue::open(root.join("queues.json"))?),
            tables: Arc::new(LocalTable::open(root.join("tables.json"))?),
        })
    }
}
