//! Queue sink: one message per prediction

use super::{PutReport, RejectedRecord};
use crate::backends::{MessageQueue, OutgoingMessage, MAX_SEND_BATCH};
use crate::codec::stable_hash;
use crate::error::{HarnessError, Result};
use crate::models::ResultChunk;
use crate::settings::QueueSinkSettings;
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest message body the queue accepts
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

pub struct QueueSink {
    settings: QueueSinkSettings,
    queues: Arc<dyn MessageQueue>,
}

impl QueueSink {
    pub fn new(settings: QueueSinkSettings, queues: Arc<dyn MessageQueue>) -> Self {
        Self { settings, queues }
    }

    /// Send every result of the chunk; failure entries are accepted as-is
    ///
    /// Messages carry a content-derived de-duplication id, so re-sending a
    /// chunk after a transport failure does not enqueue duplicates.
    pub async fn put_records(&mut self, chunk: &ResultChunk) -> Result<PutReport> {
        let mut report = PutReport {
            accepted: chunk.failures().map(|f| f.record_id.clone()).collect(),
            rejected: Vec::new(),
        };

        let mut pending: Vec<(String, String)> = Vec::new();
        for result in chunk.results() {
            let body = serde_json::to_string(&result.to_document())
                .map_err(|e| HarnessError::SinkPermanent(e.to_string()))?;
            if body.len() > MAX_MESSAGE_BYTES {
                warn!(
                    record_id = %result.record_id,
                    bytes = body.len(),
                    "Prediction too large for a queue message"
                );
                report.rejected.push(RejectedRecord {
                    record_id: result.record_id.clone(),
                    reason: format!(
                        "message body of {} bytes exceeds {} bytes",
                        body.len(),
                        MAX_MESSAGE_BYTES
                    ),
                });
                continue;
            }
            pending.push((result.record_id.clone(), body));
        }

        for batch in pending.chunks(MAX_SEND_BATCH) {
            let messages: Vec<OutgoingMessage> = batch
                .iter()
                .enumerate()
                .map(|(i, (_, body))| OutgoingMessage {
                    id: i.to_string(),
                    body: body.clone(),
                    dedup_id: Some(stable_hash(&[body.as_str()])),
                })
                .collect();

            let failures = self
                .queues
                .send_batch(&self.settings.queue_url, &messages)
                .await
                .map_err(HarnessError::from_sink)?;

            let mut failed = vec![None; batch.len()];
            for failure in failures {
                match failure.id.parse::<usize>() {
                    Ok(i) if i < batch.len() => failed[i] = Some(failure.reason),
                    _ => warn!(entry = %failure.id, "Queue reported failure for unknown entry"),
                }
            }

            for (i, (record_id, _)) in batch.iter().enumerate() {
                match failed[i].take() {
                    None => report.accepted.push(record_id.clone()),
                    Some(reason) => match self.retry_single(&messages[i], reason).await? {
                        None => report.accepted.push(record_id.clone()),
                        Some(reason) => report.rejected.push(RejectedRecord {
                            record_id: record_id.clone(),
                            reason,
                        }),
                    },
                }
            }
        }

        debug!(
            sequence = chunk.sequence,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "Chunk sent to queue"
        );
        Ok(report)
    }

    /// Resend one entry on its own; `Some(reason)` once attempts run out
    async fn retry_single(
        &self,
        message: &OutgoingMessage,
        mut reason: String,
    ) -> Result<Option<String>> {
        for attempt in 2..=self.settings.max_send_attempts {
            debug!(attempt = attempt, reason = %reason, "Resending queue entry");
            let failures = self
                .queues
                .send_batch(&self.settings.queue_url, std::slice::from_ref(message))
                .await
                .map_err(HarnessError::from_sink)?;
            match failures.into_iter().next() {
                None => return Ok(None),
                Some(failure) => reason = failure.reason,
            }
        }
        Ok(Some(reason))
    }
}
