//! Record sources
//!
//! A source yields decoded records one at a time and is told afterwards
//! whether each record was durably handled (`ack`) or should be delivered
//! again (`requeue`). Two variants exist, selected once at startup:
//! - `ObjectListSource`: an explicit list of object URIs (batch mode)
//! - `QueueSource`: a subscribed message queue (service mode)

mod object_list;
mod queue;

pub use object_list::ObjectListSource;
pub use queue::QueueSource;

use crate::backends::{Backends, ObjectRef, ObjectStore};
use crate::codec::decode_payload;
use crate::error::Result;
use crate::models::{InputRecord, Payload, RecordMeta};
use crate::settings::SourceSettings;
use std::sync::Arc;
use std::time::Duration;

/// A record that could not be fetched or decoded
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFailure {
    pub record_id: String,
    pub meta: RecordMeta,
    pub reason: String,
    /// Whether redelivery may succeed (receive budget not yet spent)
    pub retryable: bool,
}

/// One item produced by a source
#[derive(Debug, Clone)]
pub enum SourceItem {
    Record(InputRecord),
    Failed(SourceFailure),
}

impl SourceItem {
    pub fn record_id(&self) -> &str {
        match self {
            SourceItem::Record(r) => &r.id,
            SourceItem::Failed(f) => &f.record_id,
        }
    }
}

/// Counters kept by a source over its lifetime
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceStats {
    pub records: u64,
    pub failures: u64,
    pub messages_received: u64,
    pub messages_deleted: u64,
    pub messages_released: u64,
    pub dead_lettered: u64,
    pub discarded_messages: u64,
}

/// The configured source
pub enum Source {
    ObjectList(ObjectListSource),
    Queue(QueueSource),
}

impl Source {
    pub fn from_settings(settings: &SourceSettings, backends: &Backends) -> Self {
        match settings {
            SourceSettings::ObjectList(s) => {
                Source::ObjectList(ObjectListSource::new(s.clone(), backends.objects.clone()))
            }
            SourceSettings::Queue(s) => Source::Queue(QueueSource::new(
                s.clone(),
                backends.queues.clone(),
                backends.objects.clone(),
            )),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Source::ObjectList(_) => "object-list",
            Source::Queue(_) => "queue",
        }
    }

    /// Queue sources keep producing across passes; object lists end
    pub fn is_continuous(&self) -> bool {
        matches!(self, Source::Queue(_))
    }

    /// Delay applied when a record is handed back for redelivery
    pub fn requeue_delay(&self) -> Duration {
        match self {
            Source::ObjectList(_) => Duration::ZERO,
            Source::Queue(q) => q.requeue_delay(),
        }
    }

    pub async fn open(&mut self) -> Result<()> {
        match self {
            Source::ObjectList(s) => s.open().await,
            Source::Queue(s) => s.open().await,
        }
    }

    /// Next record or per-record failure; `None` ends the current pass
    pub async fn next_item(&mut self) -> Result<Option<SourceItem>> {
        match self {
            Source::ObjectList(s) => s.next_item().await,
            Source::Queue(s) => s.next_item().await,
        }
    }

    /// The record was durably handled downstream
    pub async fn ack(&mut self, record_id: &str) -> Result<()> {
        match self {
            Source::ObjectList(s) => s.ack(record_id),
            Source::Queue(s) => s.ack(record_id).await,
        }
    }

    /// The record should be delivered again after `delay`
    pub async fn requeue(&mut self, record_id: &str, delay: Duration) -> Result<()> {
        match self {
            Source::ObjectList(s) => s.requeue(record_id, delay),
            Source::Queue(s) => s.requeue(record_id, delay).await,
        }
    }

    /// Extend visibility of in-flight work that is close to expiring
    pub async fn keep_alive(&mut self) -> Result<()> {
        match self {
            Source::ObjectList(_) => Ok(()),
            Source::Queue(s) => s.keep_alive().await,
        }
    }

    /// Release anything still held
    pub async fn close(&mut self) -> Result<()> {
        match self {
            Source::ObjectList(s) => s.close(),
            Source::Queue(s) => s.close().await,
        }
    }

    pub fn stats(&self) -> SourceStats {
        match self {
            Source::ObjectList(s) => s.stats(),
            Source::Queue(s) => s.stats(),
        }
    }
}

/// Fetch one object and decode it on the blocking pool
pub(crate) async fn fetch_payload(
    objects: Arc<dyn ObjectStore>,
    object: ObjectRef,
) -> std::result::Result<Payload, String> {
    let bytes = objects
        .get_object(&object)
        .await
        .map_err(|e| format!("fetch {} failed: {}", object, e))?;

    let key = object.key.clone();
    tokio::task::spawn_blocking(move || decode_payload(&key, &bytes))
        .await
        .map_err(|e| format!("decode task for {} failed: {}", object, e))?
        .map_err(|e| format!("decode {} failed: {:#}", object, e))
}
