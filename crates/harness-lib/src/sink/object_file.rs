//! Delimited-file sink: one CSV object per flushed chunk

use super::PutReport;
use crate::backends::{ObjectRef, ObjectStore};
use crate::codec::{cell_text, flatten, stable_hash};
use crate::error::{HarnessError, Result};
use crate::models::{PredictionResult, ResultChunk};
use crate::settings::ObjectFileSettings;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub struct ObjectFileSink {
    settings: ObjectFileSettings,
    objects: Arc<dyn ObjectStore>,
    run_stamp: String,
    written: Vec<ObjectRef>,
}

impl ObjectFileSink {
    pub fn new(settings: ObjectFileSettings, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            settings,
            objects,
            run_stamp: Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
            written: Vec::new(),
        }
    }

    /// Objects written so far, in flush order
    pub fn written(&self) -> &[ObjectRef] {
        &self.written
    }

    /// Validate every row against the header, then write one object
    ///
    /// The object key is derived from the chunk sequence and content, so a
    /// retried chunk overwrites the object it wrote before.
    pub async fn put_records(&mut self, chunk: &ResultChunk) -> Result<PutReport> {
        let rows = chunk
            .results()
            .map(|result| self.row(result))
            .collect::<Result<Vec<_>>>()?;

        if rows.is_empty() {
            return Ok(PutReport::accept_all(chunk));
        }

        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.settings.delimiter)
            .from_writer(Vec::new());
        writer
            .write_record(&self.settings.fieldnames)
            .map_err(|e| HarnessError::SinkPermanent(e.to_string()))?;
        for row in &rows {
            writer
                .write_record(row)
                .map_err(|e| HarnessError::SinkPermanent(e.to_string()))?;
        }
        let body = writer
            .into_inner()
            .map_err(|e| HarnessError::SinkPermanent(e.to_string()))?;

        let object = ObjectRef::new(self.settings.bucket.clone(), self.key_for(chunk.sequence, &body));
        self.objects
            .put_object(&object, body, "text/csv")
            .await
            .map_err(HarnessError::from_sink)?;

        info!(
            object = %object,
            sequence = chunk.sequence,
            rows = rows.len(),
            "Wrote result file"
        );
        self.written.push(object);
        Ok(PutReport::accept_all(chunk))
    }

    fn key_for(&self, sequence: u64, body: &[u8]) -> String {
        let digest = stable_hash(&[String::from_utf8_lossy(body).as_ref()]);
        let name = format!("{}_{:06}_{}.csv", self.run_stamp, sequence, &digest[..12]);
        let prefix = self.settings.key_prefix.trim_matches('/');
        if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    /// Cells in header order: prediction fields, then routing meta, then request attributes
    fn row(&self, result: &PredictionResult) -> Result<Vec<String>> {
        let fields = flatten(&result.fields);
        let header = &self.settings.fieldnames;

        if let Some(extra) = fields.keys().find(|k| !header.contains(*k)) {
            return Err(HarnessError::SinkPermanent(format!(
                "prediction field `{}` of record {} is not in the configured fieldnames",
                extra, result.record_id
            )));
        }

        header
            .iter()
            .map(|column| {
                let value = match fields.get(column) {
                    Some(value) => Some(value.clone()),
                    None => match column.as_str() {
                        "record_id" => Some(Value::String(result.record_id.clone())),
                        "request_id" => Some(Value::String(result.meta.request_id.clone())),
                        "collection_id" => result.meta.collection_id.clone().map(Value::String),
                        _ => result.meta.attributes.get(column).cloned(),
                    },
                };
                value.map(|v| cell_text(&v)).ok_or_else(|| {
                    HarnessError::SinkPermanent(format!(
                        "record {} has no value for column `{}`",
                        result.record_id, column
                    ))
                })
            })
            .collect()
    }
}
