//! Queue-subscribed source
//!
//! Each message body names one or more stored objects. A message stays
//! in flight (invisible to other consumers) until every record expanded
//! from it has been acknowledged or handed back, and only then is it
//! settled: deleted, released for redelivery, or dead-lettered once its
//! receive budget is spent.
//!
//! In passthrough mode nothing is fetched: each request document becomes
//! one record. A request naming an object that does not exist is marked
//! `is_valid = false` so the adapter skips it.

use super::{fetch_payload, SourceFailure, SourceItem, SourceStats};
use crate::backends::{MessageQueue, ObjectRef, ObjectStore, QueueMessage, ReceiveOptions};
use crate::codec::derive_request_id;
use crate::error::{BackendError, HarnessError, Result};
use crate::models::{Fields, InputRecord, Payload, RecordMeta};
use crate::predictor::IS_VALID_ATTRIBUTE;
use crate::settings::QueueSourceSettings;
use futures::stream::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bookkeeping for a received, not yet settled message
#[derive(Debug)]
struct InFlight {
    receipt_handle: String,
    receive_count: u32,
    /// Records not yet acked or requeued
    outstanding: usize,
    /// Longest delay asked for by any requeued record
    requeue_delay: Option<Duration>,
    /// A record failed permanently because the receive budget is spent
    exhausted: bool,
    hidden_until: Instant,
}

enum Target {
    /// Fetch and decode the object
    Object(String),
    /// The request document is the payload; the URIs only need to exist
    Passthrough(Vec<String>),
}

/// A record expanded from a message, before its object is fetched
struct Expanded {
    record_id: String,
    target: Target,
    meta: RecordMeta,
}

pub struct QueueSource {
    settings: QueueSourceSettings,
    queues: Arc<dyn MessageQueue>,
    objects: Arc<dyn ObjectStore>,
    ready: VecDeque<SourceItem>,
    in_flight: HashMap<String, InFlight>,
    /// record id -> message id
    owners: HashMap<String, String>,
    produced_this_pass: usize,
    pass_drained: bool,
    stats: SourceStats,
}

impl QueueSource {
    pub fn new(
        settings: QueueSourceSettings,
        queues: Arc<dyn MessageQueue>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            settings,
            queues,
            objects,
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            owners: HashMap::new(),
            produced_this_pass: 0,
            pass_drained: false,
            stats: SourceStats::default(),
        }
    }

    pub fn requeue_delay(&self) -> Duration {
        self.settings.requeue_delay
    }

    /// Messages received but not yet settled
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub async fn open(&mut self) -> Result<()> {
        self.produced_this_pass = 0;
        self.pass_drained = false;
        debug!(
            queue = %self.settings.queue_url,
            max_records_per_pass = self.settings.max_records_per_pass,
            "Queue source opened"
        );
        Ok(())
    }

    /// Next item of the current pass
    ///
    /// A pass ends when the queue returns nothing or enough records were
    /// produced; the following call starts a new pass.
    pub async fn next_item(&mut self) -> Result<Option<SourceItem>> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Ok(Some(item));
            }

            if self.pass_drained || self.produced_this_pass >= self.settings.max_records_per_pass {
                self.pass_drained = false;
                self.produced_this_pass = 0;
                return Ok(None);
            }

            let options = ReceiveOptions {
                max_messages: self.settings.max_messages,
                wait_time: self.settings.wait_time,
                visibility_timeout: self.settings.visibility_timeout,
            };
            let messages = self
                .queues
                .receive(&self.settings.queue_url, &options)
                .await
                .map_err(HarnessError::from_source)?;

            if messages.is_empty() {
                self.pass_drained = true;
                continue;
            }

            self.stats.messages_received += messages.len() as u64;
            self.accept(messages).await?;
        }
    }

    async fn accept(&mut self, messages: Vec<QueueMessage>) -> Result<()> {
        let mut expanded = Vec::new();
        let bare_uri_key = self
            .settings
            .uri_keys
            .first()
            .cloned()
            .unwrap_or_else(|| "uri".to_string());

        for message in messages {
            let records = match parse_requests(&message.body, &bare_uri_key) {
                Ok(requests) => self.expand(&message, requests),
                Err(reason) => {
                    warn!(
                        message_id = %message.message_id,
                        reason = %reason,
                        "Discarding unreadable queue message"
                    );
                    Vec::new()
                }
            };

            if records.is_empty() {
                self.stats.discarded_messages += 1;
                self.delete(&message.message_id, &message.receipt_handle).await?;
                continue;
            }

            self.in_flight.insert(
                message.message_id.clone(),
                InFlight {
                    receipt_handle: message.receipt_handle.clone(),
                    receive_count: message.receive_count,
                    outstanding: records.len(),
                    requeue_delay: None,
                    exhausted: false,
                    hidden_until: Instant::now() + self.settings.visibility_timeout,
                },
            );
            for record in &records {
                self.owners
                    .insert(record.record_id.clone(), message.message_id.clone());
            }
            expanded.extend(records);
        }

        let objects = self.objects.clone();
        let fetched: Vec<(Expanded, std::result::Result<_, String>)> =
            futures::stream::iter(expanded)
                .map(|mut record| {
                    let objects = objects.clone();
                    async move {
                        let payload = match &record.target {
                            Target::Object(uri) => match ObjectRef::parse(uri) {
                                Ok(object) => fetch_payload(objects, object).await,
                                Err(e) => Err(e.to_string()),
                            },
                            Target::Passthrough(uris) => {
                                match missing_reference(objects, uris).await {
                                    Ok(missing) => {
                                        let doc = Value::Object(record.meta.attributes.clone());
                                        if let Some(uri) = missing {
                                            debug!(
                                                record_id = %record.record_id,
                                                uri = %uri,
                                                "Referenced object missing, marking record invalid"
                                            );
                                            record
                                                .meta
                                                .attributes
                                                .insert(IS_VALID_ATTRIBUTE.into(), Value::Bool(false));
                                        }
                                        Ok(Payload::Document(doc))
                                    }
                                    Err(reason) => Err(reason),
                                }
                            }
                        };
                        (record, payload)
                    }
                })
                .buffered(self.settings.download_workers.max(1))
                .collect()
                .await;

        for (record, payload) in fetched {
            self.produced_this_pass += 1;
            let item = match payload {
                Ok(payload) => {
                    self.stats.records += 1;
                    SourceItem::Record(InputRecord {
                        id: record.record_id,
                        payload,
                        meta: record.meta,
                    })
                }
                Err(reason) => {
                    self.stats.failures += 1;
                    let retryable = record.meta.receive_count < self.settings.max_receive_count;
                    if !retryable {
                        if let Some(message_id) = &record.meta.source_message_id {
                            if let Some(entry) = self.in_flight.get_mut(message_id) {
                                entry.exhausted = true;
                            }
                        }
                    }
                    warn!(
                        record_id = %record.record_id,
                        receive_count = record.meta.receive_count,
                        retryable = retryable,
                        reason = %reason,
                        "Failed to load queued object"
                    );
                    SourceItem::Failed(SourceFailure {
                        record_id: record.record_id,
                        meta: record.meta,
                        reason,
                        retryable,
                    })
                }
            };
            self.ready.push_back(item);
        }

        Ok(())
    }

    /// One record per (request, uri key) pair present in the message
    fn expand(&self, message: &QueueMessage, requests: Vec<Fields>) -> Vec<Expanded> {
        let mut records = Vec::new();

        for (request_index, request) in requests.into_iter().enumerate() {
            let uris: Vec<String> = self
                .settings
                .uri_keys
                .iter()
                .filter_map(|key| request.get(key).and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if uris.is_empty() && !self.settings.passthrough {
                warn!(
                    message_id = %message.message_id,
                    uri_keys = ?self.settings.uri_keys,
                    "Request carries none of the configured uri keys"
                );
                continue;
            }

            let request_id = text_field(&request, &self.settings.request_id_field)
                .unwrap_or_else(|| {
                    derive_request_id(&[message.message_id.clone(), request_index.to_string()])
                });
            let collection_id = text_field(&request, &self.settings.collection_id_field);
            let targets = if self.settings.passthrough {
                vec![Target::Passthrough(uris)]
            } else {
                uris.into_iter().map(Target::Object).collect()
            };
            let expected_count = self.expected_count(&request, targets.len());

            for (sequence, target) in targets.into_iter().enumerate() {
                records.push(Expanded {
                    record_id: format!("{}#{}", message.message_id, records.len()),
                    target,
                    meta: RecordMeta {
                        source_message_id: Some(message.message_id.clone()),
                        request_id: request_id.clone(),
                        collection_id: collection_id.clone(),
                        receive_count: message.receive_count,
                        sequence: sequence as u32,
                        expected_count,
                        attributes: request.clone(),
                    },
                });
            }
        }

        records
    }

    /// The request's own count when it is a usable positive u32, else `records`
    fn expected_count(&self, request: &Fields, records: usize) -> u32 {
        request
            .get(&self.settings.expected_count_field)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or_else(|| u32::try_from(records).unwrap_or(u32::MAX))
    }

    pub async fn ack(&mut self, record_id: &str) -> Result<()> {
        self.resolve(record_id, None).await
    }

    pub async fn requeue(&mut self, record_id: &str, delay: Duration) -> Result<()> {
        self.resolve(record_id, Some(delay)).await
    }

    async fn resolve(&mut self, record_id: &str, requeue: Option<Duration>) -> Result<()> {
        let message_id = match self.owners.remove(record_id) {
            Some(id) => id,
            None => {
                debug!(record_id = %record_id, "Record already resolved");
                return Ok(());
            }
        };

        let settled = match self.in_flight.get_mut(&message_id) {
            Some(entry) => {
                if let Some(delay) = requeue {
                    entry.requeue_delay = Some(entry.requeue_delay.map_or(delay, |d| d.max(delay)));
                }
                entry.outstanding = entry.outstanding.saturating_sub(1);
                entry.outstanding == 0
            }
            None => false,
        };

        if settled {
            if let Some(entry) = self.in_flight.remove(&message_id) {
                self.settle(&message_id, entry).await?;
            }
        }
        Ok(())
    }

    async fn settle(&mut self, message_id: &str, entry: InFlight) -> Result<()> {
        let budget = self.settings.max_receive_count;

        match entry.requeue_delay {
            Some(delay) if entry.receive_count < budget => {
                self.queues
                    .change_visibility(&self.settings.queue_url, &entry.receipt_handle, delay)
                    .await
                    .map_err(HarnessError::from_source)?;
                self.stats.messages_released += 1;
                info!(
                    message_id = %message_id,
                    receive_count = entry.receive_count,
                    delay_secs = delay.as_secs(),
                    "Message released for redelivery"
                );
            }
            requeue => {
                self.delete(message_id, &entry.receipt_handle).await?;
                if requeue.is_some() || entry.exhausted {
                    self.stats.dead_lettered += 1;
                    warn!(
                        event = "message_dead_lettered",
                        message_id = %message_id,
                        receive_count = entry.receive_count,
                        max_receive_count = budget,
                        "Queue message exhausted its receive budget, removed as permanently failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn delete(&mut self, message_id: &str, receipt_handle: &str) -> Result<()> {
        self.queues
            .delete(&self.settings.queue_url, receipt_handle)
            .await
            .map_err(HarnessError::from_source)?;
        self.stats.messages_deleted += 1;
        debug!(message_id = %message_id, "Message deleted");
        Ok(())
    }

    /// Extend visibility of messages past half of their window
    pub async fn keep_alive(&mut self) -> Result<()> {
        let now = Instant::now();
        let window = self.settings.visibility_timeout;

        for (message_id, entry) in self.in_flight.iter_mut() {
            if entry.hidden_until.saturating_duration_since(now) > window / 2 {
                continue;
            }
            match self
                .queues
                .change_visibility(&self.settings.queue_url, &entry.receipt_handle, window)
                .await
            {
                Ok(()) => {
                    entry.hidden_until = now + window;
                    debug!(message_id = %message_id, "Extended message visibility");
                }
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Failed to extend message visibility");
                }
            }
        }
        Ok(())
    }

    /// Release every unsettled message so another consumer can pick it up
    pub async fn close(&mut self) -> Result<()> {
        self.ready.clear();
        self.owners.clear();

        let delay = self.settings.requeue_delay;
        for (message_id, entry) in self.in_flight.drain() {
            match self
                .queues
                .change_visibility(&self.settings.queue_url, &entry.receipt_handle, delay)
                .await
            {
                Ok(()) => {
                    self.stats.messages_released += 1;
                    info!(message_id = %message_id, "Released in-flight message on close");
                }
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Failed to release in-flight message");
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

/// First URI whose object does not exist; other store errors are failures
async fn missing_reference(
    objects: Arc<dyn ObjectStore>,
    uris: &[String],
) -> std::result::Result<Option<String>, String> {
    for uri in uris {
        let object = match ObjectRef::parse(uri) {
            Ok(object) => object,
            Err(_) => return Ok(Some(uri.clone())),
        };
        match objects.get_object(&object).await {
            Ok(_) => {}
            Err(BackendError::NotFound(_)) => return Ok(Some(uri.clone())),
            Err(e) => return Err(format!("check {} failed: {}", object, e)),
        }
    }
    Ok(None)
}

fn text_field(request: &Fields, key: &str) -> Option<String> {
    match request.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Interpret a message body as a list of request documents
///
/// Accepts a JSON object, a JSON array of objects, or a bare object URI.
fn parse_requests(body: &str, uri_key: &str) -> std::result::Result<Vec<Fields>, String> {
    let bare = |text: &str| {
        ObjectRef::parse(text)
            .map(|_| {
                let mut request = Fields::new();
                request.insert(uri_key.to_string(), Value::String(text.trim().to_string()));
                vec![request]
            })
            .map_err(|_| "body is neither a JSON request nor an object URI".to_string())
    };

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(request)) => Ok(vec![request]),
        Ok(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(request) => Ok(request),
                other => Err(format!("request list entry is not an object: {}", other)),
            })
            .collect(),
        Ok(Value::String(text)) => bare(&text),
        Ok(other) => Err(format!("unsupported request body: {}", other)),
        Err(_) => bare(body),
    }
}
