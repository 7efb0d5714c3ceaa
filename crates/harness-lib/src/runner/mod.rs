//! Orchestration: Source -> Predictor Adapter -> Result Buffer -> Sink
//!
//! One runner owns one source, one adapter and one sink and drives them
//! sequentially. Records are acknowledged to the source only after the
//! chunk holding them has been durably flushed.


use crate::buffer::ResultBuffer;
use crate::error::{HarnessError, Result};
use crate::health::{HealthRegistry, PassReport};
use crate::models::{ChunkEntry, FailedRecord, FailureStage, ResultChunk, RunSummary};
use crate::observability::{HarnessMetrics, StructuredLogger};
use crate::predictor::PredictorAdapter;
use crate::settings::RunnerSettings;
use crate::sink::{PutReport, Sink};
use crate::source::{Source, SourceItem};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Exit status of a run that finished without a fatal error
pub const EXIT_OK: u8 = 0;
/// Fatal setup or permanent sink error
pub const EXIT_FATAL: u8 = 1;
/// Completed, but some records failed and `fail_on_partial` is set
pub const EXIT_PARTIAL: u8 = 2;

/// Where the runner currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Sourcing,
    Predicting,
    Buffering,
    Flushing,
    Done,
    Fatal,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::Sourcing => "sourcing",
            RunState::Predicting => "predicting",
            RunState::Buffering => "buffering",
            RunState::Flushing => "flushing",
            RunState::Done => "done",
            RunState::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Process exit code for a finished run
pub fn exit_code(outcome: &Result<RunSummary>, fail_on_partial: bool) -> u8 {
    match outcome {
        Ok(summary) if fail_on_partial && summary.has_failures() => EXIT_PARTIAL,
        Ok(_) => EXIT_OK,
        Err(_) => EXIT_FATAL,
    }
}

pub struct Runner {
    source: Source,
    adapter: PredictorAdapter,
    sink: Sink,
    settings: RunnerSettings,
    logger: StructuredLogger,
    metrics: HarnessMetrics,
    health: Option<HealthRegistry>,
    state: RunState,
    announced: bool,
    /// What the current pass has seen, reported to health when it ends
    pass: PassReport,
}

impl Runner {
    pub fn new(
        source: Source,
        adapter: PredictorAdapter,
        sink: Sink,
        settings: RunnerSettings,
        logger: StructuredLogger,
    ) -> Self {
        let adapter = adapter.with_timeout(settings.predict_timeout);
        Self {
            source,
            adapter,
            sink,
            settings,
            logger,
            metrics: HarnessMetrics::new(),
            health: None,
            state: RunState::Init,
            announced: false,
            pass: PassReport::default(),
        }
    }

    /// Report component health to `health` as the run progresses
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn sink(&self) -> &Sink {
        &self.sink
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Runner state");
            self.state = next;
        }
    }

    /// Run one pass: drain the source, flush every chunk, return the summary
    ///
    /// For an object-list source this is the whole batch. Only fatal errors
    /// come back as `Err`; per-record and per-chunk problems are counted in
    /// the summary.
    pub async fn run(&mut self) -> Result<RunSummary> {
        if !self.announced {
            self.logger.log_run_started(
                self.source.kind(),
                self.sink.kind(),
                self.adapter.name(),
                self.adapter.version(),
                self.settings.chunk_size,
            );
            self.announced = true;
        }

        self.transition(RunState::Init);
        self.pass = PassReport::default();
        match self.run_pass().await {
            Ok(summary) => {
                self.transition(RunState::Done);
                self.pass.attempted = summary.attempted;
                if let Some(health) = &self.health {
                    health.pass_finished(self.pass).await;
                }
                if !self.source.is_continuous() || !summary.is_empty() {
                    self.logger.log_summary(&summary);
                }
                Ok(summary)
            }
            Err(e) => {
                self.transition(RunState::Fatal);
                self.logger.log_fatal(&e.to_string());
                if let Err(close_err) = self.source.close().await {
                    warn!(error = %close_err, "Failed to release source after fatal error");
                }
                Err(e)
            }
        }
    }

    async fn run_pass(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut buffer = ResultBuffer::new(self.settings.chunk_size);
        let stats_before = self.source.stats();

        self.source.open().await?;
        self.transition(RunState::Sourcing);

        loop {
            let item = match self.source.next_item().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Source poll failed, ending pass");
                    self.pass.poll_failed = true;
                    if let Some(health) = &self.health {
                        health.poll_failed(e.to_string()).await;
                    }
                    break;
                }
            };
            summary.sourced += 1;
            self.metrics.inc_records_sourced();

            let entry = match item {
                SourceItem::Record(record) => {
                    self.transition(RunState::Predicting);
                    summary.attempted += 1;
                    let started = Instant::now();
                    let outcome = self.adapter.process(record).await;
                    let elapsed = started.elapsed().as_secs_f64();
                    summary.predict_seconds += elapsed;
                    self.metrics.observe_prediction_latency(elapsed);

                    match outcome {
                        Ok(result) => ChunkEntry::Result(result),
                        Err(failed) => {
                            self.metrics.inc_predictions_failed();
                            if failed.stage != FailureStage::Validate {
                                self.pass.predict_failures += 1;
                            }
                            self.logger
                                .log_record_failed(&failed.record_id, failed.stage, &failed.reason);
                            summary.record_failure(
                                failed.record_id.clone(),
                                failed.stage,
                                failed.reason.clone(),
                            );
                            ChunkEntry::Failure(failed)
                        }
                    }
                }
                SourceItem::Failed(failure) => {
                    self.metrics.inc_source_failures();
                    if failure.retryable {
                        self.requeue(&failure.record_id, &failure.reason, &mut summary)
                            .await?;
                        continue;
                    }
                    self.logger
                        .log_record_failed(&failure.record_id, FailureStage::Fetch, &failure.reason);
                    summary.record_failure(
                        failure.record_id.clone(),
                        FailureStage::Fetch,
                        failure.reason.clone(),
                    );
                    ChunkEntry::Failure(FailedRecord::new(
                        failure.record_id,
                        failure.meta,
                        FailureStage::Fetch,
                        failure.reason,
                    ))
                }
            };

            self.transition(RunState::Buffering);
            let ready = buffer.push(entry);
            self.metrics.set_buffered_items(buffer.len());
            if let Some(chunk) = ready {
                self.flush(chunk, &mut summary).await?;
            }

            if let Err(e) = self.source.keep_alive().await {
                warn!(error = %e, "Failed to extend in-flight visibility");
            }
            self.transition(RunState::Sourcing);
        }

        if let Some(chunk) = buffer.drain() {
            self.flush(chunk, &mut summary).await?;
        }
        self.metrics.set_buffered_items(0);

        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close source");
        }

        let stats = self.source.stats();
        summary.dead_lettered = stats.dead_lettered.saturating_sub(stats_before.dead_lettered);
        summary.discarded_messages = stats
            .discarded_messages
            .saturating_sub(stats_before.discarded_messages);
        self.metrics.inc_messages_dead_lettered(summary.dead_lettered);

        Ok(summary)
    }

    /// Write one chunk with bounded retries, then settle its records
    async fn flush(&mut self, chunk: ResultChunk, summary: &mut RunSummary) -> Result<()> {
        self.transition(RunState::Flushing);
        let max_attempts = self.settings.max_flush_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            match self.sink.put_records(&chunk).await {
                Ok(report) => break Ok(report),
                Err(e) if e.is_fatal() => {
                    if let Some(health) = &self.health {
                        health.sink_failed(e.to_string()).await;
                    }
                    return Err(e);
                }
                Err(e) if attempt < max_attempts => {
                    summary.flush_retries += 1;
                    self.metrics.inc_flush_retries();
                    self.logger
                        .log_flush_retry(chunk.sequence, attempt, max_attempts, &e.to_string());
                    tokio::time::sleep(self.settings.flush_retry_delay).await;
                    if let Err(e) = self.source.keep_alive().await {
                        warn!(error = %e, "Failed to extend in-flight visibility");
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        summary.flush_seconds += elapsed;
        self.metrics.observe_flush_latency(elapsed);

        match outcome {
            Ok(report) => self.settle(&chunk, report, attempt, elapsed, summary).await,
            Err(e) => self.abandon(&chunk, e, summary).await,
        }
    }

    async fn settle(
        &mut self,
        chunk: &ResultChunk,
        report: PutReport,
        attempts: u32,
        elapsed: f64,
        summary: &mut RunSummary,
    ) -> Result<()> {
        summary.chunks_flushed += 1;
        self.metrics.inc_chunks_flushed();
        if let Some(health) = &self.health {
            health.chunk_flushed().await;
        }

        let rejected: HashMap<&str, &str> = report
            .rejected
            .iter()
            .map(|r| (r.record_id.as_str(), r.reason.as_str()))
            .collect();

        let mut succeeded = 0;
        for entry in &chunk.entries {
            let record_id = entry.record_id();
            let written = match rejected.get(record_id) {
                Some(reason) => {
                    // Rejections already went through the sink's own retries
                    self.logger
                        .log_record_failed(record_id, FailureStage::Sink, reason);
                    summary.record_failure(record_id, FailureStage::Sink, *reason);
                    false
                }
                None => {
                    if matches!(entry, ChunkEntry::Result(_)) {
                        succeeded += 1;
                    }
                    true
                }
            };
            self.adapter.post_predict_hook(entry, written);
            self.ack(record_id).await?;
        }

        summary.succeeded += succeeded;
        self.metrics.inc_predictions_succeeded(succeeded);
        self.logger.log_chunk_flushed(
            chunk.sequence,
            chunk.len(),
            rejected.len(),
            attempts,
            elapsed,
        );
        Ok(())
    }

    /// Retries exhausted: every record fails and goes back to the source
    async fn abandon(
        &mut self,
        chunk: &ResultChunk,
        error: HarnessError,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let reason = error.to_string();
        self.metrics.inc_chunks_abandoned();
        self.logger
            .log_chunk_abandoned(chunk.sequence, chunk.len(), &reason);
        if let Some(health) = &self.health {
            health.chunk_abandoned(chunk.sequence, reason.clone()).await;
        }

        for entry in &chunk.entries {
            let record_id = entry.record_id();
            // Failure entries were counted when they happened
            if let ChunkEntry::Result(_) = entry {
                self.logger
                    .log_record_failed(record_id, FailureStage::Sink, &reason);
                summary.record_failure(record_id, FailureStage::Sink, reason.clone());
            }
            self.adapter.post_predict_hook(entry, false);
            self.requeue(record_id, &reason, summary).await?;
        }
        Ok(())
    }

    async fn ack(&mut self, record_id: &str) -> Result<()> {
        match self.source.ack(record_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(record_id = %record_id, error = %e, "Failed to acknowledge record");
                Ok(())
            }
        }
    }

    async fn requeue(
        &mut self,
        record_id: &str,
        reason: &str,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let delay = self.source.requeue_delay();
        match self.source.requeue(record_id, delay).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(record_id = %record_id, error = %e, "Failed to hand record back");
                return Ok(());
            }
        }

        if self.source.is_continuous() {
            summary.requeued += 1;
            self.metrics.inc_records_requeued();
            self.logger
                .log_record_requeued(record_id, reason, delay.as_secs());
        }
        Ok(())
    }

    /// Run passes until `shutdown` fires; returns totals across passes
    pub async fn serve(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<RunSummary> {
        let mut totals = RunSummary::default();
        if let Some(health) = &self.health {
            health.set_serving(true).await;
        }

        loop {
            let pass = tokio::select! {
                result = self.run() => result,
                _ = shutdown.recv() => break,
            };

            let idle = match pass {
                Ok(summary) => {
                    // A pass cut short by a poll error backs off like an idle one
                    let idle = summary.is_empty() || self.pass.poll_failed;
                    totals.absorb(&summary);
                    self.report_stuck_requests().await;
                    idle
                }
                Err(e) if e.is_fatal() => {
                    if let Some(health) = &self.health {
                        health.set_serving(false).await;
                    }
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Pass failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.idle_poll) => {}
                    _ = shutdown.recv() => break,
                }
            }
        }

        self.logger.log_shutdown("shutdown signal received");
        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to release in-flight work on shutdown");
        }
        if let Some(health) = &self.health {
            health.set_serving(false).await;
        }
        self.transition(RunState::Done);
        self.logger.log_summary(&totals);
        Ok(totals)
    }

    async fn report_stuck_requests(&self) {
        let threshold = match self.settings.stuck_request_after {
            Some(threshold) if self.sink.tracks_requests() => threshold,
            _ => return,
        };

        match self.sink.find_stuck_requests(threshold).await {
            Ok(stuck) => {
                self.metrics.set_stuck_requests(stuck.len());
                for request in &stuck {
                    self.logger.log_stuck_request(
                        &request.request_id,
                        request.state.as_str(),
                        &request.updated_at.to_rfc3339(),
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to scan for stuck requests"),
        }
    }
}
