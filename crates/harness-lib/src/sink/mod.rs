//! Record sinks
//!
//! A sink receives one `ResultChunk` per call and reports, per record,
//! whether it was accepted. Every sink tolerates the same chunk being
//! written more than once: the runner retries whole chunks on transient
//! errors.

mod object_file;
mod queue;
mod table;

pub use object_file::ObjectFileSink;
pub use queue::{QueueSink, MAX_MESSAGE_BYTES};
pub use table::{RequestRow, StuckRequest, TableSink};

use crate::backends::Backends;
use crate::error::Result;
use crate::models::ResultChunk;
use crate::settings::SinkSettings;
use std::time::Duration;

/// A record the sink refused after its own retries
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub record_id: String,
    pub reason: String,
}

/// Per-record outcome of one `put_records` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutReport {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedRecord>,
}

impl PutReport {
    /// Every record of the chunk accepted
    pub fn accept_all(chunk: &ResultChunk) -> Self {
        Self {
            accepted: chunk.record_ids(),
            rejected: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// The configured sink
pub enum Sink {
    Queue(QueueSink),
    ObjectFile(ObjectFileSink),
    Table(TableSink),
}

impl Sink {
    pub fn from_settings(settings: &SinkSettings, backends: &Backends) -> Self {
        match settings {
            SinkSettings::Queue(s) => Sink::Queue(QueueSink::new(s.clone(), backends.queues.clone())),
            SinkSettings::ObjectFile(s) => {
                Sink::ObjectFile(ObjectFileSink::new(s.clone(), backends.objects.clone()))
            }
            SinkSettings::Table(s) => Sink::Table(TableSink::new(s.clone(), backends.tables.clone())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Sink::Queue(_) => "queue",
            Sink::ObjectFile(_) => "object-file",
            Sink::Table(_) => "table",
        }
    }

    /// Write one chunk
    ///
    /// `Err(SinkTransient)` means nothing can be assumed about the chunk and
    /// it should be retried in full; `Err(SinkPermanent)` aborts the run.
    pub async fn put_records(&mut self, chunk: &ResultChunk) -> Result<PutReport> {
        match self {
            Sink::Queue(s) => s.put_records(chunk).await,
            Sink::ObjectFile(s) => s.put_records(chunk).await,
            Sink::Table(s) => s.put_records(chunk).await,
        }
    }

    /// Whether the sink keeps request state that can get stuck
    pub fn tracks_requests(&self) -> bool {
        matches!(self, Sink::Table(_))
    }

    /// Requests left in PROCESSING for longer than `older_than`
    pub async fn find_stuck_requests(&self, older_than: Duration) -> Result<Vec<StuckRequest>> {
        match self {
            Sink::Table(s) => s.find_stuck_requests(older_than).await,
            _ => Ok(Vec::new()),
        }
    }
}
