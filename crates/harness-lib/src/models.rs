//! Core data models for the prediction harness

use ndarray::{Array3, ArrayD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Structured prediction fields (field name to JSON value)
pub type Fields = serde_json::Map<String, Value>;

/// Upper bound on failure entries kept in a summary; counts stay exact
pub const MAX_SUMMARY_FAILURES: usize = 1_000;

/// Decoded record payload handed to a predictor
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Height x width x RGB pixels
    Image(Array3<u8>),
    /// Arbitrary numeric tensor, usually produced by `preprocess`
    Tensor(ArrayD<f32>),
    /// Structured document (JSON objects in storage)
    Document(Value),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Image(_) => "image",
            Payload::Tensor(_) => "tensor",
            Payload::Document(_) => "document",
        }
    }
}

/// Provenance and routing metadata attached to every record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Queue message the record was expanded from (queue sources only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    pub receive_count: u32,
    /// Position of the record inside its request
    pub sequence: u32,
    /// Number of records the request is expected to produce
    pub expected_count: u32,
    /// Request-level attributes (the originating request document)
    pub attributes: Fields,
}

/// A decoded input record owned by the source until handed to the adapter
#[derive(Debug, Clone)]
pub struct InputRecord {
    pub id: String,
    pub payload: Payload,
    pub meta: RecordMeta,
}

/// Output of a successful predictor invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub record_id: String,
    pub meta: RecordMeta,
    pub fields: Fields,
}

impl PredictionResult {
    /// Message document: prediction fields merged with routing keys
    pub fn to_document(&self) -> Value {
        let mut doc = self.fields.clone();
        doc.insert("record_id".into(), Value::String(self.record_id.clone()));
        doc.insert(
            "request_id".into(),
            Value::String(self.meta.request_id.clone()),
        );
        if let Some(collection_id) = &self.meta.collection_id {
            doc.insert("collection_id".into(), Value::String(collection_id.clone()));
        }
        Value::Object(doc)
    }
}

/// Pipeline stage a record failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Fetch,
    Validate,
    Preprocess,
    Predict,
    Postprocess,
    Sink,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Validate => "validate",
            FailureStage::Preprocess => "preprocess",
            FailureStage::Predict => "predict",
            FailureStage::Postprocess => "postprocess",
            FailureStage::Sink => "sink",
        };
        f.write_str(name)
    }
}

/// A record that could not be turned into a prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub record_id: String,
    pub meta: RecordMeta,
    pub stage: FailureStage,
    pub reason: String,
}

impl FailedRecord {
    pub fn new(
        record_id: impl Into<String>,
        meta: RecordMeta,
        stage: FailureStage,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            meta,
            stage,
            reason: reason.into(),
        }
    }
}

/// One buffered outcome, in source order
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEntry {
    Result(PredictionResult),
    Failure(FailedRecord),
}

impl ChunkEntry {
    pub fn record_id(&self) -> &str {
        match self {
            ChunkEntry::Result(r) => &r.record_id,
            ChunkEntry::Failure(f) => &f.record_id,
        }
    }

    pub fn meta(&self) -> &RecordMeta {
        match self {
            ChunkEntry::Result(r) => &r.meta,
            ChunkEntry::Failure(f) => &f.meta,
        }
    }
}

/// Ordered, bounded group of outcomes flushed in one sink call
#[derive(Debug, Clone, PartialEq)]
pub struct ResultChunk {
    pub sequence: u64,
    pub entries: Vec<ChunkEntry>,
}

impl ResultChunk {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn results(&self) -> impl Iterator<Item = &PredictionResult> {
        self.entries.iter().filter_map(|e| match e {
            ChunkEntry::Result(r) => Some(r),
            ChunkEntry::Failure(_) => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailedRecord> {
        self.entries.iter().filter_map(|e| match e {
            ChunkEntry::Failure(f) => Some(f),
            ChunkEntry::Result(_) => None,
        })
    }

    pub fn record_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.record_id().to_string())
            .collect()
    }
}

/// Lifecycle of a logical request in the requests table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "PENDING",
            RequestState::Processing => "PROCESSING",
            RequestState::Complete => "COMPLETE",
            RequestState::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(RequestState::Pending),
            "PROCESSING" => Some(RequestState::Processing),
            "COMPLETE" => Some(RequestState::Complete),
            "FAILED" => Some(RequestState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Complete | RequestState::Failed)
    }

    /// States only move forward; terminal states never change
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        match (self, next) {
            (current, next) if *current == next => true,
            (RequestState::Pending, _) => true,
            (RequestState::Processing, RequestState::Complete | RequestState::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure line in a run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub record_id: String,
    pub stage: FailureStage,
    pub reason: String,
}

/// Counters emitted when a run (or a service pass) finishes
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Items yielded by the source (records and per-record source failures)
    pub sourced: u64,
    /// Predictor adapter invocations attempted
    pub attempted: u64,
    /// Predictions durably accepted by the sink
    pub succeeded: u64,
    pub failed: u64,
    /// Records handed back to the source for redelivery
    pub requeued: u64,
    pub dead_lettered: u64,
    /// Queue messages whose body could not be interpreted at all
    pub discarded_messages: u64,
    pub chunks_flushed: u64,
    pub flush_retries: u64,
    pub predict_seconds: f64,
    pub flush_seconds: f64,
    pub failures: Vec<FailureEntry>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn is_empty(&self) -> bool {
        self.sourced == 0 && self.discarded_messages == 0
    }

    pub fn record_failure(
        &mut self,
        record_id: impl Into<String>,
        stage: FailureStage,
        reason: impl Into<String>,
    ) {
        self.failed += 1;
        if self.failures.len() < MAX_SUMMARY_FAILURES {
            self.failures.push(FailureEntry {
                record_id: record_id.into(),
                stage,
                reason: reason.into(),
            });
        }
    }

    /// Fold another pass into this one (service mode totals)
    pub fn absorb(&mut self, other: &RunSummary) {
        self.sourced += other.sourced;
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
        self.discarded_messages += other.discarded_messages;
        self.chunks_flushed += other.chunks_flushed;
        self.flush_retries += other.flush_retries;
        self.predict_seconds += other.predict_seconds;
        self.flush_seconds += other.flush_seconds;
        let room = MAX_SUMMARY_FAILURES.saturating_sub(self.failures.len());
        self.failures
            .extend(other.failures.iter().take(room).cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(request_id: &str) -> RecordMeta {
        RecordMeta {
            request_id: request_id.to_string(),
            collection_id: Some("col-1".to_string()),
            expected_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_request_state_is_monotonic() {
        assert!(RequestState::Pending.can_transition_to(RequestState::Processing));
        assert!(RequestState::Processing.can_transition_to(RequestState::Complete));
        assert!(RequestState::Processing.can_transition_to(RequestState::Failed));
        assert!(RequestState::Complete.can_transition_to(RequestState::Complete));

        assert!(!RequestState::Complete.can_transition_to(RequestState::Processing));
        assert!(!RequestState::Failed.can_transition_to(RequestState::Complete));
        assert!(!RequestState::Processing.can_transition_to(RequestState::Pending));
    }

    #[test]
    fn test_request_state_round_trips_through_str() {
        for state in [
            RequestState::Pending,
            RequestState::Processing,
            RequestState::Complete,
            RequestState::Failed,
        ] {
            assert_eq!(RequestState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RequestState::parse("processing"), None);
        assert_eq!(
            serde_json::to_value(RequestState::Complete).unwrap(),
            "COMPLETE"
        );
    }

    #[test]
    fn test_prediction_document_carries_routing_keys() {
        let mut fields = Fields::new();
        fields.insert("label".into(), Value::from("cat"));
        let result = PredictionResult {
            record_id: "s3://bucket/a.png".into(),
            meta: meta("req-1"),
            fields,
        };

        let doc = result.to_document();
        assert_eq!(doc["label"], "cat");
        assert_eq!(doc["record_id"], "s3://bucket/a.png");
        assert_eq!(doc["request_id"], "req-1");
        assert_eq!(doc["collection_id"], "col-1");
    }

    #[test]
    fn test_chunk_splits_results_and_failures_in_order() {
        let chunk = ResultChunk {
            sequence: 0,
            entries: vec![
                ChunkEntry::Result(PredictionResult {
                    record_id: "a".into(),
                    meta: meta("r"),
                    fields: Fields::new(),
                }),
                ChunkEntry::Failure(FailedRecord::new("b", meta("r"), FailureStage::Predict, "boom")),
                ChunkEntry::Result(PredictionResult {
                    record_id: "c".into(),
                    meta: meta("r"),
                    fields: Fields::new(),
                }),
            ],
        };

        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.record_ids(), vec!["a", "b", "c"]);
        assert_eq!(chunk.results().count(), 2);
        assert_eq!(chunk.failures().next().unwrap().reason, "boom");
    }

    #[test]
    fn test_summary_caps_failure_entries_but_not_counts() {
        let mut summary = RunSummary::default();
        for i in 0..(MAX_SUMMARY_FAILURES + 5) {
            summary.record_failure(format!("r{}", i), FailureStage::Predict, "bad");
        }
        assert_eq!(summary.failed as usize, MAX_SUMMARY_FAILURES + 5);
        assert_eq!(summary.failures.len(), MAX_SUMMARY_FAILURES);

        let mut total = RunSummary::default();
        total.absorb(&summary);
        total.absorb(&summary);
        assert_eq!(total.failed as usize, 2 * (MAX_SUMMARY_FAILURES + 5));
        assert_eq!(total.failures.len(), MAX_SUMMARY_FAILURES);
    }
}
