//! Observability infrastructure for the harness
//!
//! Provides:
//! - Prometheus metrics (prediction latency, flush latency, record and chunk counters)
//! - Structured JSON logging with tracing

use crate::models::{FailureStage, RunSummary};
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<HarnessMetricsInner> = OnceLock::new();

struct HarnessMetricsInner {
    prediction_latency_seconds: Histogram,
    flush_latency_seconds: Histogram,
    records_sourced: IntCounter,
    predictions_succeeded: IntCounter,
    predictions_failed: IntCounter,
    source_failures: IntCounter,
    chunks_flushed: IntCounter,
    flush_retries: IntCounter,
    chunks_abandoned: IntCounter,
    records_requeued: IntCounter,
    messages_dead_lettered: IntCounter,
    buffered_items: IntGauge,
    stuck_requests: IntGauge,
}

impl HarnessMetricsInner {
    fn new() -> Self {
        Self {
            prediction_latency_seconds: register_histogram!(
                "predict_harness_prediction_latency_seconds",
                "Time spent in preprocess, predict and postprocess for one record",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            flush_latency_seconds: register_histogram!(
                "predict_harness_flush_latency_seconds",
                "Time spent writing one result chunk to the sink",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register flush_latency_seconds"),

            records_sourced: register_int_counter!(
                "predict_harness_records_sourced_total",
                "Total number of items yielded by the source"
            )
            .expect("Failed to register records_sourced"),

            predictions_succeeded: register_int_counter!(
                "predict_harness_predictions_succeeded_total",
                "Total number of predictions durably written to the sink"
            )
            .expect("Failed to register predictions_succeeded"),

            predictions_failed: register_int_counter!(
                "predict_harness_predictions_failed_total",
                "Total number of records that failed in the predictor"
            )
            .expect("Failed to register predictions_failed"),

            source_failures: register_int_counter!(
                "predict_harness_source_failures_total",
                "Total number of records that could not be fetched or decoded"
            )
            .expect("Failed to register source_failures"),

            chunks_flushed: register_int_counter!(
                "predict_harness_chunks_flushed_total",
                "Total number of result chunks accepted by the sink"
            )
            .expect("Failed to register chunks_flushed"),

            flush_retries: register_int_counter!(
                "predict_harness_flush_retries_total",
                "Total number of chunk flush retries after transient sink errors"
            )
            .expect("Failed to register flush_retries"),

            chunks_abandoned: register_int_counter!(
                "predict_harness_chunks_abandoned_total",
                "Total number of chunks whose flush retries were exhausted"
            )
            .expect("Failed to register chunks_abandoned"),

            records_requeued: register_int_counter!(
                "predict_harness_records_requeued_total",
                "Total number of records handed back to the source for redelivery"
            )
            .expect("Failed to register records_requeued"),

            messages_dead_lettered: register_int_counter!(
                "predict_harness_messages_dead_lettered_total",
                "Total number of queue messages removed after exhausting their receive budget"
            )
            .expect("Failed to register messages_dead_lettered"),

            buffered_items: register_int_gauge!(
                "predict_harness_buffered_items",
                "Number of outcomes waiting in the result buffer"
            )
            .expect("Failed to register buffered_items"),

            stuck_requests: register_int_gauge!(
                "predict_harness_stuck_requests",
                "Requests left in PROCESSING longer than the configured threshold"
            )
            .expect("Failed to register stuck_requests"),
        }
    }
}

/// Harness metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct HarnessMetrics {
    _private: (),
}

impl Default for HarnessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(HarnessMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &HarnessMetricsInner {
        GLOBAL_METRICS.get_or_init(HarnessMetricsInner::new)
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
    }

    pub fn observe_flush_latency(&self, duration_secs: f64) {
        self.inner().flush_latency_seconds.observe(duration_secs);
    }

    pub fn inc_records_sourced(&self) {
        self.inner().records_sourced.inc();
    }

    pub fn inc_predictions_succeeded(&self, count: u64) {
        self.inner().predictions_succeeded.inc_by(count);
    }

    pub fn inc_predictions_failed(&self) {
        self.inner().predictions_failed.inc();
    }

    pub fn inc_source_failures(&self) {
        self.inner().source_failures.inc();
    }

    pub fn inc_chunks_flushed(&self) {
        self.inner().chunks_flushed.inc();
    }

    pub fn inc_flush_retries(&self) {
        self.inner().flush_retries.inc();
    }

    pub fn inc_chunks_abandoned(&self) {
        self.inner().chunks_abandoned.inc();
    }

    pub fn inc_records_requeued(&self) {
        self.inner().records_requeued.inc();
    }

    pub fn inc_messages_dead_lettered(&self, count: u64) {
        self.inner().messages_dead_lettered.inc_by(count);
    }

    pub fn set_buffered_items(&self, items: usize) {
        self.inner().buffered_items.set(items as i64);
    }

    pub fn set_stuck_requests(&self, count: usize) {
        self.inner().stuck_requests.set(count as i64);
    }
}

/// Structured logger for harness events
///
/// Every event carries the run id so passes of a long-running service can
/// be told apart.
#[derive(Clone)]
pub struct StructuredLogger {
    run_id: String,
}

impl StructuredLogger {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Log harness startup
    pub fn log_run_started(
        &self,
        source: &str,
        sink: &str,
        predictor: &str,
        predictor_version: &str,
        chunk_size: usize,
    ) {
        info!(
            event = "run_started",
            run_id = %self.run_id,
            source = %source,
            sink = %sink,
            predictor = %predictor,
            predictor_version = %predictor_version,
            chunk_size = chunk_size,
            "Prediction run started"
        );
    }

    pub fn log_record_failed(&self, record_id: &str, stage: FailureStage, reason: &str) {
        warn!(
            event = "record_failed",
            run_id = %self.run_id,
            record_id = %record_id,
            stage = %stage,
            reason = %reason,
            "Record failed"
        );
    }

    pub fn log_record_requeued(&self, record_id: &str, reason: &str, delay_secs: u64) {
        info!(
            event = "record_requeued",
            run_id = %self.run_id,
            record_id = %record_id,
            reason = %reason,
            delay_secs = delay_secs,
            "Record handed back for redelivery"
        );
    }

    pub fn log_chunk_flushed(
        &self,
        sequence: u64,
        records: usize,
        rejected: usize,
        attempts: u32,
        duration_secs: f64,
    ) {
        info!(
            event = "chunk_flushed",
            run_id = %self.run_id,
            sequence = sequence,
            records = records,
            rejected = rejected,
            attempts = attempts,
            duration_secs = duration_secs,
            "Result chunk flushed"
        );
    }

    pub fn log_flush_retry(&self, sequence: u64, attempt: u32, max_attempts: u32, error: &str) {
        warn!(
            event = "flush_retry",
            run_id = %self.run_id,
            sequence = sequence,
            attempt = attempt,
            max_attempts = max_attempts,
            error = %error,
            "Chunk flush failed, retrying"
        );
    }

    pub fn log_chunk_abandoned(&self, sequence: u64, records: usize, error: &str) {
        error!(
            event = "chunk_abandoned",
            run_id = %self.run_id,
            sequence = sequence,
            records = records,
            error = %error,
            "Chunk flush retries exhausted, marking every record failed"
        );
    }

    pub fn log_stuck_request(&self, request_id: &str, state: &str, updated_at: &str) {
        warn!(
            event = "request_stuck",
            run_id = %self.run_id,
            request_id = %request_id,
            state = %state,
            updated_at = %updated_at,
            "Request has not progressed within the configured threshold"
        );
    }

    pub fn log_fatal(&self, error: &str) {
        error!(
            event = "run_fatal",
            run_id = %self.run_id,
            error = %error,
            "Run aborted"
        );
    }

    pub fn log_summary(&self, summary: &RunSummary) {
        let succeeded = summary.succeeded;
        let failed = summary.failed;
        if failed > 0 {
            warn!(
                event = "run_summary",
                run_id = %self.run_id,
                sourced = summary.sourced,
                attempted = summary.attempted,
                succeeded = succeeded,
                failed = failed,
                requeued = summary.requeued,
                dead_lettered = summary.dead_lettered,
                discarded_messages = summary.discarded_messages,
                chunks_flushed = summary.chunks_flushed,
                flush_retries = summary.flush_retries,
                predict_seconds = summary.predict_seconds,
                flush_seconds = summary.flush_seconds,
                "Run finished with failures"
            );
        } else {
            info!(
                event = "run_summary",
                run_id = %self.run_id,
                sourced = summary.sourced,
                attempted = summary.attempted,
                succeeded = succeeded,
                failed = failed,
                requeued = summary.requeued,
                dead_lettered = summary.dead_lettered,
                discarded_messages = summary.discarded_messages,
                chunks_flushed = summary.chunks_flushed,
                flush_retries = summary.flush_retries,
                predict_seconds = summary.predict_seconds,
                flush_seconds = summary.flush_seconds,
                "Run finished"
            );
        }
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "harness_shutdown",
            run_id = %self.run_id,
            reason = %reason,
            "Prediction harness shutting down"
        );
    }
}
