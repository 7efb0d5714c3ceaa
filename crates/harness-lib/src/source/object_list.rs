//! Batch source over an explicit list of object URIs

use super::{fetch_payload, SourceFailure, SourceItem, SourceStats};
use crate::backends::{ObjectRef, ObjectStore};
use crate::codec::derive_request_id;
use crate::error::{HarnessError, Result};
use crate::models::{Fields, InputRecord, Payload, RecordMeta};
use crate::settings::ObjectListSettings;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type Fetched = (usize, String, std::result::Result<Payload, String>);

/// Yields one record per URI, in input order
///
/// Objects are fetched ahead with bounded concurrency; the whole list is
/// one logical request.
pub struct ObjectListSource {
    settings: ObjectListSettings,
    objects: Arc<dyn ObjectStore>,
    request_id: String,
    /// One per URI position; a repeated URI gets a position suffix
    record_ids: Vec<String>,
    pending: Option<BoxStream<'static, Fetched>>,
    stats: SourceStats,
}

impl ObjectListSource {
    pub fn new(settings: ObjectListSettings, objects: Arc<dyn ObjectStore>) -> Self {
        let request_id = settings
            .request_id
            .clone()
            .unwrap_or_else(|| derive_request_id(&settings.uris));
        let record_ids = record_ids(&settings.uris);
        Self {
            settings,
            objects,
            request_id,
            record_ids,
            pending: None,
            stats: SourceStats::default(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn open(&mut self) -> Result<()> {
        if self.settings.uris.is_empty() {
            return Err(HarnessError::Config(
                "object-list source needs at least one URI".to_string(),
            ));
        }

        let objects = self.objects.clone();
        let stream = futures::stream::iter(self.settings.uris.clone().into_iter().enumerate())
            .map(move |(index, uri)| {
                let objects = objects.clone();
                async move {
                    let payload = match ObjectRef::parse(&uri) {
                        Ok(object) => fetch_payload(objects, object).await,
                        Err(e) => Err(e.to_string()),
                    };
                    (index, uri, payload)
                }
            })
            .buffered(self.settings.download_workers.max(1))
            .boxed();

        self.pending = Some(stream);
        self.stats = SourceStats::default();
        info!(
            uris = self.settings.uris.len(),
            request_id = %self.request_id,
            download_workers = self.settings.download_workers,
            "Object-list source opened"
        );
        Ok(())
    }

    pub async fn next_item(&mut self) -> Result<Option<SourceItem>> {
        let stream = match self.pending.as_mut() {
            Some(stream) => stream,
            None => return Ok(None),
        };

        match stream.next().await {
            Some((index, uri, Ok(payload))) => {
                self.stats.records += 1;
                let meta = self.meta_for(index, &uri);
                Ok(Some(SourceItem::Record(InputRecord {
                    id: self.record_ids[index].clone(),
                    payload,
                    meta,
                })))
            }
            Some((index, uri, Err(reason))) => {
                self.stats.failures += 1;
                warn!(uri = %uri, reason = %reason, "Failed to load object");
                let meta = self.meta_for(index, &uri);
                Ok(Some(SourceItem::Failed(SourceFailure {
                    record_id: self.record_ids[index].clone(),
                    meta,
                    reason,
                    retryable: false,
                })))
            }
            None => {
                self.pending = None;
                if self.stats.records == 0 && self.stats.failures > 0 {
                    return Err(HarnessError::SourceExhausted {
                        count: self.stats.failures as usize,
                    });
                }
                Ok(None)
            }
        }
    }

    fn meta_for(&self, index: usize, uri: &str) -> RecordMeta {
        let mut attributes = Fields::new();
        attributes.insert(self.settings.uri_key.clone(), Value::String(uri.to_string()));
        RecordMeta {
            source_message_id: None,
            request_id: self.request_id.clone(),
            collection_id: self.settings.collection_id.clone(),
            receive_count: 1,
            sequence: index as u32,
            expected_count: self.settings.uris.len() as u32,
            attributes,
        }
    }

    /// Nothing to acknowledge for a static list
    pub fn ack(&mut self, _record_id: &str) -> Result<()> {
        Ok(())
    }

    pub fn requeue(&mut self, record_id: &str, _delay: Duration) -> Result<()> {
        debug!(record_id = %record_id, "Object-list records are not redelivered");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.pending = None;
        Ok(())
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

/// Record ids for a URI list: the URI itself, or `uri#position` when the
/// URI already appeared earlier in the list
fn record_ids(uris: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(uris.len());
    uris.iter()
        .enumerate()
        .map(|(index, uri)| {
            let mut id = uri.clone();
            let mut suffix = index;
            while !seen.insert(id.clone()) {
                id = format!("{}#{}", uri, suffix);
                suffix += uris.len();
            }
            id
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryObjectStore;
    use std::io::Cursor;

    fn png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        let mut bytes = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut bytes, image::ImageOutputFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn settings(uris: &[&str]) -> ObjectListSettings {
        ObjectListSettings {
            uris: uris.iter().map(|u| u.to_string()).collect(),
            uri_key: "s3_uri".to_string(),
            request_id: None,
            collection_id: Some("col-7".to_string()),
            download_workers: 3,
        }
    }

    fn store_with(keys: &[&str]) -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new());
        for key in keys {
            store.insert(ObjectRef::new("in", *key), png());
        }
        store
    }

    async fn drain(source: &mut ObjectListSource) -> Result<Vec<SourceItem>> {
        let mut items = Vec::new();
        while let Some(item) = source.next_item().await? {
            items.push(item);
        }
        Ok(items)
    }

    #[tokio::test]
    async fn test_records_are_yielded_in_input_order() {
        let keys = ["a.png", "b.png", "c.png", "d.png", "e.png"];
        let uris: Vec<String> = keys.iter().map(|k| format!("s3://in/{}", k)).collect();
        let uri_refs: Vec<&str> = uris.iter().map(String::as_str).collect();
        let mut source = ObjectListSource::new(settings(&uri_refs), store_with(&keys));

        source.open().await.unwrap();
        let items = drain(&mut source).await.unwrap();

        let ids: Vec<&str> = items.iter().map(|i| i.record_id()).collect();
        assert_eq!(ids, uri_refs);
        match &items[2] {
            SourceItem::Record(record) => {
                assert_eq!(record.meta.sequence, 2);
                assert_eq!(record.meta.expected_count, 5);
                assert_eq!(record.meta.collection_id.as_deref(), Some("col-7"));
                assert_eq!(record.meta.attributes["s3_uri"], "s3://in/c.png");
                assert!(matches!(record.payload, Payload::Image(_)));
            }
            other => panic!("unexpected item {:?}", other),
        }
        assert_eq!(source.stats().records, 5);
    }

    #[tokio::test]
    async fn test_one_bad_object_does_not_abort_batch() {
        let store = store_with(&["a.png", "b.png"]);
        store.insert(ObjectRef::new("in", "broken.png"), b"garbage".to_vec());
        let mut source = ObjectListSource::new(
            settings(&["s3://in/a.png", "s3://in/broken.png", "s3://in/b.png"]),
            store,
        );

        source.open().await.unwrap();
        let items = drain(&mut source).await.unwrap();

        assert_eq!(items.len(), 3);
        match &items[1] {
            SourceItem::Failed(failure) => {
                assert_eq!(failure.record_id, "s3://in/broken.png");
                assert!(!failure.retryable);
                assert!(failure.reason.contains("decode"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_every_object_failing_is_fatal() {
        let mut source = ObjectListSource::new(
            settings(&["s3://in/missing.png", "not-a-uri"]),
            store_with(&[]),
        );

        source.open().await.unwrap();
        let mut failures = 0;
        let err = loop {
            match source.next_item().await {
                Ok(Some(SourceItem::Failed(_))) => failures += 1,
                Ok(other) => panic!("unexpected {:?}", other.map(|i| i.record_id().to_string())),
                Err(e) => break e,
            }
        };

        assert_eq!(failures, 2);
        assert!(matches!(err, HarnessError::SourceExhausted { count: 2 }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_empty_list_is_config_error() {
        let mut source = ObjectListSource::new(settings(&[]), store_with(&[]));
        assert!(matches!(source.open().await, Err(HarnessError::Config(_))));
    }

    #[tokio::test]
    async fn test_repeated_uri_gets_distinct_record_id() {
        let mut source = ObjectListSource::new(
            settings(&["s3://in/a.png", "s3://in/a.png", "s3://in/b.png"]),
            store_with(&["a.png", "b.png"]),
        );

        source.open().await.unwrap();
        let items = drain(&mut source).await.unwrap();

        let ids: Vec<&str> = items.iter().map(|i| i.record_id()).collect();
        assert_eq!(ids, vec!["s3://in/a.png", "s3://in/a.png#1", "s3://in/b.png"]);
        match &items[1] {
            SourceItem::Record(record) => {
                assert_eq!(record.meta.attributes["s3_uri"], "s3://in/a.png");
                assert_eq!(record.meta.expected_count, 3);
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[test]
    fn test_record_ids_never_collide() {
        let uris: Vec<String> = ["x", "x#1", "x", "x"].iter().map(|u| u.to_string()).collect();
        let ids = record_ids(&uris);
        let distinct: HashSet<&String> = ids.iter().collect();
        assert_eq!(distinct.len(), 4);
        assert_eq!(ids[0], "x");
        assert_eq!(ids[1], "x#1");
    }

    #[tokio::test]
    async fn test_request_id_is_stable_for_same_list() {
        let a = ObjectListSource::new(settings(&["s3://in/a.png", "s3://in/b.png"]), store_with(&[]));
        let b = ObjectListSource::new(settings(&["s3://in/b.png", "s3://in/a.png"]), store_with(&[]));
        assert_eq!(a.request_id(), b.request_id());

        let mut fixed = settings(&["s3://in/a.png"]);
        fixed.request_id = Some("req-1".to_string());
        let c = ObjectListSource::new(fixed, store_with(&[]));
        assert_eq!(c.request_id(), "req-1");
    }
}
