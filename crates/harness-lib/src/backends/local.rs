//! Local filesystem backends
//!
//! Objects live at `root/bucket/key`. Queue and table state is held in
//! memory and persisted as a JSON snapshot after every mutation, so a
//! harness restarted against the same root picks up where it left off.

use super::memory::{MemoryQueue, MemoryTable, QueueState, StoredRow};
use super::{
    async_trait, Item, KeyValueTable, MessageQueue, ObjectRef, ObjectStore, OutgoingMessage,
    QueueMessage, ReceiveOptions, SendFailure, TableKey, WriteCondition,
};
use crate::error::BackendError;
use anyhow::Context;
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Write `bytes` to `path` atomically using a temp file and rename
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(&temp_path, path)
}

fn io_error(context: String, err: std::io::Error) -> BackendError {
    match err.kind() {
        ErrorKind::NotFound => BackendError::NotFound(context),
        ErrorKind::InvalidInput | ErrorKind::InvalidData => {
            BackendError::Invalid(format!("{}: {}", context, err))
        }
        _ => BackendError::Unavailable(format!("{}: {}", context, err)),
    }
}

fn load_snapshot<T: serde::de::DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_slice(&data).with_context(|| format!("Failed to parse snapshot {:?}", path))
}

/// Object store over a directory tree
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, object: &ObjectRef) -> Result<PathBuf, BackendError> {
        let relative = Path::new(&object.bucket).join(&object.key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || object.bucket.contains('/') {
            return Err(BackendError::Invalid(format!(
                "object {} does not map to a path under the store root",
                object
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get_object(&self, object: &ObjectRef) -> Result<Vec<u8>, BackendError> {
        let path = self.path_for(object)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(object.to_string(), e))
    }

    async fn put_object(
        &self,
        object: &ObjectRef,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), BackendError> {
        let path = self.path_for(object)?;
        let context = object.to_string();
        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .map_err(|e| BackendError::Unavailable(format!("write task failed: {}", e)))?
            .map_err(|e| io_error(context, e))?;

        debug!(object = %object, "Object written");
        Ok(())
    }
}

/// Queue persisted to a JSON snapshot
#[derive(Debug)]
pub struct LocalQueue {
    inner: MemoryQueue,
    path: PathBuf,
}

impl LocalQueue {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let snapshot: HashMap<String, QueueState> = load_snapshot(&path)?;
        Ok(Self {
            inner: MemoryQueue::from_snapshot(snapshot),
            path,
        })
    }

    /// Enqueue a raw body and persist; returns the message id
    pub fn push(&self, queue: &str, body: impl Into<String>) -> Result<String, BackendError> {
        let id = self.inner.push(queue, body)?;
        self.persist()?;
        Ok(id)
    }

    pub fn bodies(&self, queue: &str) -> Vec<String> {
        self.inner.bodies(queue)
    }

    fn persist(&self) -> Result<(), BackendError> {
        let snapshot = self.inner.snapshot()?;
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| BackendError::Invalid(format!("queue snapshot: {}", e)))?;
        write_atomic(&self.path, &bytes).map_err(|e| io_error(self.path.display().to_string(), e))
    }
}

#[async_trait]
impl MessageQueue for LocalQueue {
    async fn receive(
        &self,
        queue: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, BackendError> {
        let messages = self.inner.receive(queue, options).await?;
        if !messages.is_empty() {
            self.persist()?;
        }
        Ok(messages)
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<(), BackendError> {
        self.inner.delete(queue, receipt_handle).await?;
        self.persist()
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        self.inner
            .change_visibility(queue, receipt_handle, timeout)
            .await?;
        self.persist()
    }

    async fn send_batch(
        &self,
        queue: &str,
        messages: &[OutgoingMessage],
    ) -> Result<Vec<SendFailure>, BackendError> {
        let failures = self.inner.send_batch(queue, messages).await?;
        self.persist()?;
        Ok(failures)
    }
}

/// Table persisted to a JSON snapshot
#[derive(Debug)]
pub struct LocalTable {
    inner: MemoryTable,
    path: PathBuf,
    // Serializes snapshot writes
    write_lock: tokio::sync::Mutex<()>,
}

impl LocalTable {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let snapshot: HashMap<String, Vec<StoredRow>> = load_snapshot(&path)?;
        Ok(Self {
            inner: MemoryTable::from_snapshot(snapshot),
            path,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn persist(&self) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec(&self.inner.snapshot())
            .map_err(|e| BackendError::Invalid(format!("table snapshot: {}", e)))?;
        write_atomic(&self.path, &bytes).map_err(|e| io_error(self.path.display().to_string(), e))
    }
}

#[async_trait]
impl KeyValueTable for LocalTable {
    async fn get_item(&self, table: &str, key: &TableKey) -> Result<Option<Item>, BackendError> {
        self.inner.get_item(table, key).await
    }

    async fn put_item(
        &self,
        table: &str,
        key: &TableKey,
        item: Item,
        condition: WriteCondition,
    ) -> Result<(), BackendError> {
        let _guard = self.write_lock.lock().await;
        self.inner.put_item(table, key, item, condition).await?;
        self.persist()
    }

    async fn scan(&self, table: &str) -> Result<Vec<(TableKey, Item)>, BackendError> {
        self.inner.scan(table).await
    }
}
