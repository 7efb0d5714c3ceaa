//! In-memory backends
//!
//! Used for tests and for dry runs. The queue models the managed-queue
//! semantics the harness depends on: visibility timeouts, receipt handles,
//! receive counts and send de-duplication.

use super::{
    async_trait, Item, KeyValueTable, MessageQueue, ObjectRef, ObjectStore, OutgoingMessage,
    QueueMessage, ReceiveOptions, SendFailure, TableKey, WriteCondition, MAX_SEND_BATCH,
};
use crate::error::BackendError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a send de-duplication id suppresses repeats
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Object store backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<ObjectRef, Vec<u8>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: ObjectRef, body: Vec<u8>) {
        self.objects.insert(object, body);
    }

    pub fn get(&self, object: &ObjectRef) -> Option<Vec<u8>> {
        self.objects.get(object).map(|v| v.value().clone())
    }

    /// Keys stored under `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().bucket == bucket)
            .map(|entry| entry.key().key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object(&self, object: &ObjectRef) -> Result<Vec<u8>, BackendError> {
        self.get(object)
            .ok_or_else(|| BackendError::NotFound(object.to_string()))
    }

    async fn put_object(
        &self,
        object: &ObjectRef,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), BackendError> {
        self.insert(object.clone(), body);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
    visible_at_ms: i64,
    receipt_handle: Option<String>,
}

/// State of one named queue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueState {
    messages: Vec<StoredMessage>,
    /// dedup id -> first send time, pruned to `DEDUP_WINDOW`
    #[serde(default)]
    dedup_sent_at_ms: HashMap<String, i64>,
    next_id: u64,
}

impl QueueState {
    fn enqueue(&mut self, body: String) -> String {
        self.next_id += 1;
        let message_id = format!("msg-{:08}", self.next_id);
        self.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body,
            receive_count: 0,
            visible_at_ms: 0,
            receipt_handle: None,
        });
        message_id
    }

    /// True when `dedup_id` was not sent within the window
    fn admit(&mut self, dedup_id: &str, now_ms: i64) -> bool {
        let window = millis(DEDUP_WINDOW);
        self.dedup_sent_at_ms
            .retain(|_, sent_at| now_ms.saturating_sub(*sent_at) < window);
        if self.dedup_sent_at_ms.contains_key(dedup_id) {
            return false;
        }
        self.dedup_sent_at_ms.insert(dedup_id.to_string(), now_ms);
        true
    }

    fn by_receipt(&mut self, receipt_handle: &str) -> Option<&mut StoredMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
    }
}

/// Queue with visibility-timeout semantics
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_snapshot(snapshot: HashMap<String, QueueState>) -> Self {
        Self {
            queues: Mutex::new(snapshot),
        }
    }

    pub(crate) fn snapshot(&self) -> Result<HashMap<String, QueueState>, BackendError> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>, BackendError> {
        self.queues
            .lock()
            .map_err(|_| BackendError::Unavailable("queue state lock poisoned".to_string()))
    }

    /// Enqueue a raw body; returns the message id
    pub fn push(&self, queue: &str, body: impl Into<String>) -> Result<String, BackendError> {
        let mut queues = self.lock()?;
        Ok(queues.entry(queue.to_string()).or_default().enqueue(body.into()))
    }

    /// Bodies of every message still in the queue, visible or not
    pub fn bodies(&self, queue: &str) -> Vec<String> {
        self.lock()
            .map(|queues| {
                queues
                    .get(queue)
                    .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.lock()
            .map(|queues| queues.get(queue).map(|q| q.messages.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Messages that a receive call would return right now
    pub fn visible_len(&self, queue: &str) -> usize {
        let now = now_millis();
        self.lock()
            .map(|queues| {
                queues
                    .get(queue)
                    .map(|q| q.messages.iter().filter(|m| m.visible_at_ms <= now).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Receive count of a message, if it is still queued
    pub fn receive_count(&self, queue: &str, message_id: &str) -> Option<u32> {
        let queues = self.lock().ok()?;
        queues
            .get(queue)?
            .messages
            .iter()
            .find(|m| m.message_id == message_id)
            .map(|m| m.receive_count)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn receive(
        &self,
        queue: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<QueueMessage>, BackendError> {
        let now = now_millis();
        let hidden_until = now + millis(options.visibility_timeout);
        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();

        let received = state
            .messages
            .iter_mut()
            .filter(|m| m.visible_at_ms <= now)
            .take(options.max_messages.min(MAX_SEND_BATCH))
            .map(|m| {
                m.receive_count += 1;
                m.visible_at_ms = hidden_until;
                let handle = uuid::Uuid::new_v4().to_string();
                m.receipt_handle = Some(handle.clone());
                QueueMessage {
                    message_id: m.message_id.clone(),
                    receipt_handle: handle,
                    body: m.body.clone(),
                    receive_count: m.receive_count,
                }
            })
            .collect();

        Ok(received)
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<(), BackendError> {
        let mut queues = self.lock()?;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::NotFound(format!("queue {}", queue)))?;

        let before = state.messages.len();
        state
            .messages
            .retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        if state.messages.len() == before {
            return Err(BackendError::NotFound(format!(
                "receipt handle {}",
                receipt_handle
            )));
        }
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let mut queues = self.lock()?;
        let message = queues
            .get_mut(queue)
            .and_then(|state| state.by_receipt(receipt_handle))
            .ok_or_else(|| BackendError::NotFound(format!("receipt handle {}", receipt_handle)))?;

        message.visible_at_ms = now_millis() + millis(timeout);
        Ok(())
    }

    async fn send_batch(
        &self,
        queue: &str,
        messages: &[OutgoingMessage],
    ) -> Result<Vec<SendFailure>, BackendError> {
        if messages.len() > MAX_SEND_BATCH {
            return Err(BackendError::Invalid(format!(
                "batch of {} exceeds {} entries",
                messages.len(),
                MAX_SEND_BATCH
            )));
        }

        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();
        let now = now_millis();
        for message in messages {
            if let Some(dedup_id) = &message.dedup_id {
                if !state.admit(dedup_id, now) {
                    continue;
                }
            }
            state.enqueue(message.body.clone());
        }

        Ok(Vec::new())
    }
}

/// Table backed by one ordered map per table name
#[derive(Debug, Default)]
pub struct MemoryTable {
    tables: DashMap<String, BTreeMap<TableKey, Item>>,
}

/// Serializable row, used for snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRow {
    key: TableKey,
    item: Item,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_snapshot(snapshot: HashMap<String, Vec<StoredRow>>) -> Self {
        let tables = DashMap::new();
        for (name, rows) in snapshot {
            let rows: BTreeMap<TableKey, Item> =
                rows.into_iter().map(|row| (row.key, row.item)).collect();
            tables.insert(name, rows);
        }
        Self { tables }
    }

    pub(crate) fn snapshot(&self) -> HashMap<String, Vec<StoredRow>> {
        self.tables
            .iter()
            .map(|entry| {
                let rows = entry
                    .value()
                    .iter()
                    .map(|(key, item)| StoredRow {
                        key: key.clone(),
                        item: item.clone(),
                    })
                    .collect();
                (entry.key().clone(), rows)
            })
            .collect()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    pub fn get(&self, table: &str, key: &TableKey) -> Option<Item> {
        self.tables.get(table)?.get(key).cloned()
    }
}

fn check_condition(
    existing: Option<&Item>,
    key: &TableKey,
    condition: &WriteCondition,
) -> Result<(), BackendError> {
    match (condition, existing) {
        (WriteCondition::Always, _) => Ok(()),
        (WriteCondition::NotExists, None) => Ok(()),
        (WriteCondition::NotExists, Some(_)) => Err(BackendError::ConditionFailed(format!(
            "row {} already exists",
            key
        ))),
        (WriteCondition::VersionEquals { field, version }, Some(item)) => {
            let stored = item.get(field).and_then(|v| v.as_u64());
            if stored == Some(*version) {
                Ok(())
            } else {
                Err(BackendError::ConditionFailed(format!(
                    "row {} has {} {:?}, expected {}",
                    key, field, stored, version
                )))
            }
        }
        (WriteCondition::VersionEquals { .. }, None) => Err(BackendError::ConditionFailed(
            format!("row {} does not exist", key),
        )),
    }
}

#[async_trait]
impl KeyValueTable for MemoryTable {
    async fn get_item(&self, table: &str, key: &TableKey) -> Result<Option<Item>, BackendError> {
        Ok(self.get(table, key))
    }

    async fn put_item(
        &self,
        table: &str,
        key: &TableKey,
        item: Item,
        condition: WriteCondition,
    ) -> Result<(), BackendError> {
        // The entry guard holds the shard lock, so check-and-write is atomic
        let mut rows = self.tables.entry(table.to_string()).or_default();
        check_condition(rows.get(key), key, &condition)?;
        rows.insert(key.clone(), item);
        Ok(())
    }

    async fn scan(&self, table: &str) -> Result<Vec<(TableKey, Item)>, BackendError> {
        Ok(self
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
