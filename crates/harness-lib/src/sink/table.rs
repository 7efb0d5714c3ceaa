//! Two-table state sink
//!
//! For every chunk:
//! 1. make sure each request row exists (created as PROCESSING)
//! 2. write one result row per prediction
//! 3. fold the chunk's outcomes into each request row and move its state
//!
//! Request rows keep the sets of completed and failed record ids, so a
//! retried chunk folds in nothing new and leaves the row untouched.

use super::PutReport;
use crate::backends::{Item, KeyValueTable, TableKey, WriteCondition};
use crate::codec::{cell_text, flatten, round_floats, stable_hash};
use crate::error::{BackendError, HarnessError, Result};
use crate::models::{ChunkEntry, PredictionResult, RecordMeta, RequestState, ResultChunk};
use crate::settings::TableSinkSettings;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts at a read-modify-write before giving up on a request row
const MAX_CONDITIONAL_ATTEMPTS: u32 = 5;

const VERSION_FIELD: &str = "version";

/// Errors kept on a request row
const MAX_REQUEST_ERRORS: usize = 100;

/// A request row as stored in the requests table
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRow {
    pub request_id: String,
    pub collection_id: Option<String>,
    pub state: RequestState,
    pub expected_count: u32,
    pub completed_records: BTreeSet<String>,
    pub failed_records: BTreeSet<String>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl RequestRow {
    fn new(request_id: &str, progress: &Progress, now: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.to_string(),
            collection_id: progress.collection_id.clone(),
            state: RequestState::Processing,
            expected_count: progress.expected_count,
            completed_records: BTreeSet::new(),
            failed_records: BTreeSet::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Time-based key for a state/collection index
    pub fn state_rangekey(&self) -> String {
        format!("{}#{}", self.state, self.updated_at.to_rfc3339())
    }

    /// Fold one chunk's outcomes in; returns whether anything changed
    fn apply(&mut self, progress: &Progress) -> bool {
        let before = self.clone();

        if self.collection_id.is_none() {
            self.collection_id = progress.collection_id.clone();
        }
        self.expected_count = self.expected_count.max(progress.expected_count);
        self.completed_records
            .extend(progress.completed.iter().cloned());
        self.failed_records.extend(progress.failed.iter().cloned());
        for reason in &progress.errors {
            if self.errors.len() < MAX_REQUEST_ERRORS && !self.errors.contains(reason) {
                self.errors.push(reason.clone());
            }
        }

        let next = if !self.failed_records.is_empty() {
            RequestState::Failed
        } else if self.expected_count > 0
            && self.completed_records.len() >= self.expected_count as usize
        {
            RequestState::Complete
        } else {
            RequestState::Processing
        };
        if self.state.can_transition_to(next) {
            self.state = next;
        }

        *self != before
    }

    fn to_item(&self, settings: &TableSinkSettings) -> Item {
        let mut item = Item::new();
        item.insert(
            settings.requests_hash_key.clone(),
            Value::String(self.request_id.clone()),
        );
        if let Some(collection_id) = &self.collection_id {
            item.insert("collection_id".into(), Value::String(collection_id.clone()));
        }
        item.insert(
            settings.state_field.clone(),
            Value::String(self.state.as_str().to_string()),
        );
        item.insert("expected_count".into(), json!(self.expected_count));
        item.insert("completed_records".into(), json!(self.completed_records));
        item.insert("failed_records".into(), json!(self.failed_records));
        item.insert("errors".into(), json!(self.errors));
        item.insert("created_at".into(), json!(self.created_at.to_rfc3339()));
        item.insert("updated_at".into(), json!(self.updated_at.to_rfc3339()));
        item.insert("state_rangekey".into(), json!(self.state_rangekey()));
        item.insert(VERSION_FIELD.into(), json!(self.version));
        item
    }

    fn from_item(item: &Item, settings: &TableSinkSettings) -> Result<Self> {
        let text = |field: &str| item.get(field).and_then(Value::as_str).map(str::to_string);
        let set = |field: &str| -> BTreeSet<String> {
            item.get(field)
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default()
        };
        let time = |field: &str| -> Result<DateTime<Utc>> {
            let raw = text(field).unwrap_or_default();
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    HarnessError::SinkPermanent(format!("request row field `{}`: {}", field, e))
                })
        };

        let state_text = text(&settings.state_field).unwrap_or_default();
        let state = RequestState::parse(&state_text).ok_or_else(|| {
            HarnessError::SinkPermanent(format!("unknown request state `{}`", state_text))
        })?;

        Ok(Self {
            request_id: text(&settings.requests_hash_key).unwrap_or_default(),
            collection_id: text("collection_id"),
            state,
            expected_count: item
                .get("expected_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            completed_records: set("completed_records"),
            failed_records: set("failed_records"),
            errors: item
                .get("errors")
                .and_then(Value::as_array)
                .map(|e| e.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
            created_at: time("created_at")?,
            updated_at: time("updated_at")?,
            version: item.get(VERSION_FIELD).and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

/// A request that has not progressed recently
#[derive(Debug, Clone, PartialEq)]
pub struct StuckRequest {
    pub request_id: String,
    pub state: RequestState,
    pub updated_at: DateTime<Utc>,
}

/// One chunk's outcomes for a single request
#[derive(Debug, Default)]
struct Progress {
    collection_id: Option<String>,
    expected_count: u32,
    completed: BTreeSet<String>,
    failed: BTreeSet<String>,
    errors: Vec<String>,
}

impl Progress {
    fn note(&mut self, meta: &RecordMeta) {
        if self.collection_id.is_none() {
            self.collection_id = meta.collection_id.clone();
        }
        self.expected_count = self.expected_count.max(meta.expected_count);
    }
}

pub struct TableSink {
    settings: TableSinkSettings,
    tables: Arc<dyn KeyValueTable>,
}

impl TableSink {
    pub fn new(settings: TableSinkSettings, tables: Arc<dyn KeyValueTable>) -> Self {
        Self { settings, tables }
    }

    pub async fn put_records(&mut self, chunk: &ResultChunk) -> Result<PutReport> {
        // Schema problems surface before anything is written
        let rows = chunk
            .results()
            .map(|result| self.result_row(result))
            .collect::<Result<Vec<_>>>()?;

        let mut requests: BTreeMap<String, Progress> = BTreeMap::new();
        for entry in &chunk.entries {
            let progress = requests.entry(entry.meta().request_id.clone()).or_default();
            progress.note(entry.meta());
            match entry {
                ChunkEntry::Result(result) => {
                    progress.completed.insert(result.record_id.clone());
                }
                ChunkEntry::Failure(failure) => {
                    progress.failed.insert(failure.record_id.clone());
                    progress
                        .errors
                        .push(format!("{} ({}): {}", failure.record_id, failure.stage, failure.reason));
                }
            }
        }

        for (request_id, progress) in &requests {
            self.ensure_request(request_id, progress).await?;
        }

        for (key, item) in rows {
            self.tables
                .put_item(&self.settings.results_table, &key, item, WriteCondition::Always)
                .await
                .map_err(HarnessError::from_sink)?;
        }

        for (request_id, progress) in &requests {
            self.advance(request_id, progress).await?;
        }

        Ok(PutReport::accept_all(chunk))
    }

    /// Create the request row as PROCESSING if nobody has yet
    async fn ensure_request(&self, request_id: &str, progress: &Progress) -> Result<()> {
        let key = TableKey::hash(request_id);
        let existing = self
            .tables
            .get_item(&self.settings.requests_table, &key)
            .await
            .map_err(HarnessError::from_sink)?;
        if existing.is_some() {
            return Ok(());
        }

        let mut row = RequestRow::new(request_id, progress, Utc::now());
        row.version = 1;
        match self
            .tables
            .put_item(
                &self.settings.requests_table,
                &key,
                row.to_item(&self.settings),
                WriteCondition::NotExists,
            )
            .await
        {
            Ok(()) => {
                info!(request_id = %request_id, state = %row.state, "Request created");
                Ok(())
            }
            // Created concurrently; fine either way
            Err(BackendError::ConditionFailed(_)) => Ok(()),
            Err(e) => Err(HarnessError::from_sink(e)),
        }
    }

    /// Read-modify-conditional-write of one request row
    async fn advance(&self, request_id: &str, progress: &Progress) -> Result<RequestState> {
        let key = TableKey::hash(request_id);

        for attempt in 1..=MAX_CONDITIONAL_ATTEMPTS {
            let now = Utc::now();
            let current = self
                .tables
                .get_item(&self.settings.requests_table, &key)
                .await
                .map_err(HarnessError::from_sink)?;

            let (mut row, condition) = match current {
                Some(item) => {
                    let row = RequestRow::from_item(&item, &self.settings)?;
                    let condition = WriteCondition::VersionEquals {
                        field: VERSION_FIELD.to_string(),
                        version: row.version,
                    };
                    (row, condition)
                }
                None => (RequestRow::new(request_id, progress, now), WriteCondition::NotExists),
            };

            let previous = row.state;
            if !row.apply(progress) && row.version > 0 {
                debug!(request_id = %request_id, state = %row.state, "Request already up to date");
                return Ok(row.state);
            }
            row.updated_at = now;
            row.version += 1;

            match self
                .tables
                .put_item(
                    &self.settings.requests_table,
                    &key,
                    row.to_item(&self.settings),
                    condition,
                )
                .await
            {
                Ok(()) => {
                    if previous != row.state {
                        info!(
                            request_id = %request_id,
                            from = %previous,
                            to = %row.state,
                            completed = row.completed_records.len(),
                            expected = row.expected_count,
                            "Request state changed"
                        );
                    }
                    return Ok(row.state);
                }
                Err(BackendError::ConditionFailed(reason)) => {
                    debug!(
                        request_id = %request_id,
                        attempt = attempt,
                        reason = %reason,
                        "Request row changed underneath, retrying"
                    );
                }
                Err(e) => return Err(HarnessError::from_sink(e)),
            }
        }

        warn!(request_id = %request_id, "Gave up updating request row");
        Err(HarnessError::SinkTransient(format!(
            "request {} kept changing during {} update attempts",
            request_id, MAX_CONDITIONAL_ATTEMPTS
        )))
    }

    fn result_row(&self, result: &PredictionResult) -> Result<(TableKey, Item)> {
        let meta = &result.meta;
        let precision = self.settings.decimal_precision;
        let fields = flatten(&result.fields);

        let hash = stable_hash(&[meta.request_id.as_str(), result.record_id.as_str()]);
        let sort = fields
            .get(&self.settings.results_sort_key)
            .or_else(|| meta.attributes.get(&self.settings.results_sort_key))
            .map(cell_text)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| result.record_id.clone());

        let mut item = Item::new();
        for (name, value) in &fields {
            item.insert(name.clone(), round_floats(value, precision));
        }

        for field in &self.settings.parent_fields {
            let value = match field.as_str() {
                "request_id" => Some(Value::String(meta.request_id.clone())),
                "record_id" => Some(Value::String(result.record_id.clone())),
                "collection_id" => meta.collection_id.clone().map(Value::String),
                _ => meta.attributes.get(field).cloned(),
            };
            match value {
                Some(value) => {
                    item.insert(field.clone(), round_floats(&value, precision));
                }
                None => {
                    return Err(HarnessError::SinkPermanent(format!(
                        "record {} is missing parent field `{}`",
                        result.record_id, field
                    )))
                }
            }
        }

        item.insert("record_id".into(), Value::String(result.record_id.clone()));
        item.insert("request_id".into(), Value::String(meta.request_id.clone()));
        if let Some(collection_id) = &meta.collection_id {
            item.insert("collection_id".into(), Value::String(collection_id.clone()));
        }
        item.insert("valid_number".into(), json!(meta.sequence));
        item.insert(self.settings.results_hash_key.clone(), Value::String(hash.clone()));
        item.insert(self.settings.results_sort_key.clone(), Value::String(sort.clone()));

        Ok((TableKey::with_range(hash, sort), item))
    }

    pub async fn request(&self, request_id: &str) -> Result<Option<RequestRow>> {
        let item = self
            .tables
            .get_item(&self.settings.requests_table, &TableKey::hash(request_id))
            .await
            .map_err(HarnessError::from_sink)?;
        item.map(|item| RequestRow::from_item(&item, &self.settings))
            .transpose()
    }

    /// Non-terminal requests whose last update is older than `older_than`
    pub async fn find_stuck_requests(&self, older_than: Duration) -> Result<Vec<StuckRequest>> {
        let threshold = chrono::Duration::from_std(older_than)
            .map_err(|e| HarnessError::Config(format!("stuck request threshold: {}", e)))?;
        let cutoff = Utc::now() - threshold;

        let rows = self
            .tables
            .scan(&self.settings.requests_table)
            .await
            .map_err(HarnessError::from_sink)?;

        let mut stuck = Vec::new();
        for (_, item) in rows {
            let row = match RequestRow::from_item(&item, &self.settings) {
                Ok(row) => row,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable request row");
                    continue;
                }
            };
            if !row.state.is_terminal() && row.updated_at < cutoff {
                stuck.push(StuckRequest {
                    request_id: row.request_id,
                    state: row.state,
                    updated_at: row.updated_at,
                });
            }
        }
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryTable;
    use crate::models::{FailedRecord, FailureStage, Fields};

    fn settings() -> TableSinkSettings {
        TableSinkSettings {
            requests_table: "requests".to_string(),
            results_table: "results".to_string(),
            requests_hash_key: "request_id".to_string(),
            results_hash_key: "hashkey".to_string(),
            results_sort_key: "s3_uri".to_string(),
            state_field: "state".to_string(),
            parent_fields: vec!["request_id".to_string(), "s3_uri".to_string()],
            decimal_precision: 3,
        }
    }

    fn meta(sequence: u32) -> RecordMeta {
        let mut attributes = Fields::new();
        attributes.insert("s3_uri".into(), json!(format!("s3://in/{}.png", sequence)));
        RecordMeta {
            request_id: "req-1".to_string(),
            collection_id: Some("col-1".to_string()),
            sequence,
            expected_count: 3,
            attributes,
            ..Default::default()
        }
    }

    fn result(sequence: u32) -> ChunkEntry {
        let mut fields = Fields::new();
        fields.insert("score".into(), json!(0.123456));
        fields.insert("mean".into(), json!({"r": 0.5}));
        ChunkEntry::Result(PredictionResult {
            record_id: format!("r{}", sequence),
            meta: meta(sequence),
            fields,
        })
    }

    fn failure(sequence: u32) -> ChunkEntry {
        ChunkEntry::Failure(FailedRecord::new(
            format!("r{}", sequence),
            meta(sequence),
            FailureStage::Predict,
            "model rejected input",
        ))
    }

    fn chunk(sequence: u64, entries: Vec<ChunkEntry>) -> ResultChunk {
        ResultChunk { sequence, entries }
    }

    fn sink(table: &Arc<MemoryTable>) -> TableSink {
        TableSink::new(settings(), table.clone())
    }

    #[tokio::test]
    async fn test_request_completes_after_all_expected_rows() {
        let table = Arc::new(MemoryTable::new());
        let mut sink = sink(&table);

        sink.put_records(&chunk(0, vec![result(0), result(1)]))
            .await
            .unwrap();
        let row = sink.request("req-1").await.unwrap().unwrap();
        assert_eq!(row.state, RequestState::Processing);
        assert_eq!(row.expected_count, 3);
        assert_eq!(table.row_count("results"), 2);

        sink.put_records(&chunk(1, vec![result(2)])).await.unwrap();
        let row = sink.request("req-1").await.unwrap().unwrap();
        assert_eq!(row.state, RequestState::Complete);
        assert_eq!(row.completed_records.len(), 3);
        assert!(row.state_rangekey().starts_with("COMPLETE#"));
    }

    #[tokio::test]
    async fn test_any_permanent_failure_fails_request() {
        let table = Arc::new(MemoryTable::new());
        let mut sink = sink(&table);

        sink.put_records(&chunk(0, vec![result(0), failure(1), result(2)]))
            .await
            .unwrap();

        let row = sink.request("req-1").await.unwrap().unwrap();
        assert_eq!(row.state, RequestState::Failed);
        assert!(row.failed_records.contains("r1"));
        assert!(row.errors[0].contains("model rejected input"));
        // Failed records get no result row
        assert_eq!(table.row_count("results"), 2);
    }

    #[tokio::test]
    async fn test_reflushing_a_chunk_is_idempotent() {
        let table = Arc::new(MemoryTable::new());
        let mut sink = sink(&table);
        let c = chunk(0, vec![result(0), result(1)]);

        let result_key = TableKey::with_range(stable_hash(&["req-1", "r0"]), "s3://in/0.png");

        sink.put_records(&c).await.unwrap();
        let first_request = table.get("requests", &TableKey::hash("req-1")).unwrap();
        let first_result = table.get("results", &result_key).unwrap();

        sink.put_records(&c).await.unwrap();
        let second_request = table.get("requests", &TableKey::hash("req-1")).unwrap();

        assert_eq!(first_request, second_request);
        assert_eq!(first_result, table.get("results", &result_key).unwrap());
        assert_eq!(table.row_count("results"), 2);
    }

    #[tokio::test]
    async fn test_terminal_state_never_regresses() {
        let table = Arc::new(MemoryTable::new());
        let mut sink = sink(&table);

        sink.put_records(&chunk(0, vec![result(0), result(1), result(2)]))
            .await
            .unwrap();
        sink.put_records(&chunk(1, vec![failure(2)])).await.unwrap();

        let row = sink.request("req-1").await.unwrap().unwrap();
        assert_eq!(row.state, RequestState::Complete);
    }

    #[tokio::test]
    async fn test_result_row_layout() {
        let table = Arc::new(MemoryTable::new());
        let mut sink = sink(&table);
        sink.put_records(&chunk(0, vec![result(1)])).await.unwrap();

        let hash = stable_hash(&["req-1", "r1"]);
        let row = table
            .get("results", &TableKey::with_range(hash.clone(), "s3://in/1.png"))
            .unwrap();
        assert_eq!(row["hashkey"], json!(hash));
        assert_eq!(row["s3_uri"], "s3://in/1.png");
        assert_eq!(row["collection_id"], "col-1");
        assert_eq!(row["valid_number"], 1);
        assert_eq!(row["request_id"], "req-1");
        assert_eq!(row["score"], json!(0.123));
        assert_eq!(row["mean__r"], json!(0.5));
    }

    #[tokio::test]
    async fn test_missing_parent_field_is_permanent() {
        let table = Arc::new(MemoryTable::new());
        let mut settings = settings();
        settings.parent_fields.push("owner".to_string());
        let mut sink = TableSink::new(settings, table.clone());

        let err = sink.put_records(&chunk(0, vec![result(0)])).await.unwrap_err();
        assert!(matches!(err, HarnessError::SinkPermanent(_)));
        assert_eq!(table.row_count("requests"), 0);
        assert_eq!(table.row_count("results"), 0);
    }

    #[tokio::test]
    async fn test_find_stuck_requests() {
        let table = Arc::new(MemoryTable::new());
        let mut sink = sink(&table);
        sink.put_records(&chunk(0, vec![result(0)])).await.unwrap();

        let fresh = sink
            .find_stuck_requests(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(fresh.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stuck = sink
            .find_stuck_requests(Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].request_id, "req-1");
        assert_eq!(stuck[0].state, RequestState::Processing);
    }
}
