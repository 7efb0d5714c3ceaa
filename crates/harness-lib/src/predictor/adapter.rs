//! Runs the three predictor stages for one record

use super::Predictor;
use crate::models::{
    ChunkEntry, FailedRecord, FailureStage, Fields, InputRecord, Payload, PredictionResult,
    RecordMeta,
};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Wraps a predictor so that every failure mode is contained to one record
///
/// Stages run on the blocking pool. A stage error, a panic, or exceeding the
/// optional timeout all come back as a `FailedRecord`.
#[derive(Clone)]
pub struct PredictorAdapter {
    predictor: Arc<dyn Predictor>,
    timeout: Option<Duration>,
}

impl PredictorAdapter {
    pub fn new(predictor: Arc<dyn Predictor>) -> Self {
        Self {
            predictor,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.predictor.name()
    }

    pub fn version(&self) -> &str {
        self.predictor.version()
    }

    /// Forward a settled entry to the predictor's post hook
    pub fn post_predict_hook(&self, entry: &ChunkEntry, written: bool) {
        self.predictor.post_predict_hook(entry, written);
    }

    /// pre hook -> validity check -> preprocess -> predict -> postprocess
    pub async fn process(&self, record: InputRecord) -> Result<PredictionResult, FailedRecord> {
        let InputRecord { id, payload, meta } = record;
        let predictor = Arc::clone(&self.predictor);
        let task_meta = meta.clone();

        let task = tokio::task::spawn_blocking(move || {
            let mut meta = task_meta;
            let outcome = run_stages(predictor.as_ref(), payload, &mut meta);
            (meta, outcome)
        });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // The blocking call keeps running; its output is discarded
                    return Err(FailedRecord::new(
                        id,
                        meta,
                        FailureStage::Predict,
                        format!("predictor exceeded timeout of {:?}", limit),
                    ));
                }
            },
            None => task.await,
        };

        match joined {
            Ok((meta, Ok(fields))) => {
                debug!(record_id = %id, fields = fields.len(), "Prediction complete");
                Ok(PredictionResult {
                    record_id: id,
                    meta,
                    fields,
                })
            }
            Ok((meta, Err((stage, reason)))) => Err(FailedRecord::new(id, meta, stage, reason)),
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    format!("predictor panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    format!("predictor task cancelled: {}", join_err)
                };
                Err(FailedRecord::new(id, meta, FailureStage::Predict, reason))
            }
        }
    }
}

/// Attribute a pre hook (or the source) sets to `false` to skip a record
pub const IS_VALID_ATTRIBUTE: &str = "is_valid";

fn run_stages(
    predictor: &dyn Predictor,
    payload: Payload,
    meta: &mut RecordMeta,
) -> Result<Fields, (FailureStage, String)> {
    predictor.pre_predict_hook(&payload, meta);
    if meta.attributes.get(IS_VALID_ATTRIBUTE) == Some(&Value::Bool(false)) {
        return Err((
            FailureStage::Validate,
            "is_valid=false, record not processed".to_string(),
        ));
    }
    let meta: &RecordMeta = meta;
    let input = predictor
        .preprocess(payload, meta)
        .map_err(|e| (FailureStage::Preprocess, format!("{:#}", e)))?;
    let prediction = predictor
        .predict(&input, meta)
        .map_err(|e| (FailureStage::Predict, format!("{:#}", e)))?;
    predictor
        .postprocess(prediction)
        .map_err(|e| (FailureStage::Postprocess, format!("{:#}", e)))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Scripted;

    impl Predictor for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn pre_predict_hook(&self, payload: &Payload, meta: &mut RecordMeta) {
            if let Payload::Document(doc) = payload {
                if doc["reject"] == true {
                    meta.attributes
                        .insert(IS_VALID_ATTRIBUTE.into(), Value::Bool(false));
                }
            }
            meta.attributes.insert("hooked".into(), Value::Bool(true));
        }

        fn preprocess(&self, payload: Payload, _meta: &RecordMeta) -> anyhow::Result<Payload> {
            match payload {
                Payload::Document(doc) if doc["fail"] == "preprocess" => {
                    anyhow::bail!("cannot preprocess")
                }
                other => Ok(other),
            }
        }

        fn predict(&self, input: &Payload, _meta: &RecordMeta) -> anyhow::Result<Fields> {
            let doc = match input {
                Payload::Document(doc) => doc,
                _ => anyhow::bail!("documents only"),
            };
            match doc["fail"].as_str() {
                Some("predict") => anyhow::bail!("model rejected input"),
                Some("panic") => panic!("model crashed"),
                Some("slow") => std::thread::sleep(Duration::from_millis(300)),
                _ => {}
            }
            let mut fields = Fields::new();
            fields.insert("score".into(), json!(0.9));
            Ok(fields)
        }

        fn postprocess(&self, mut prediction: Fields) -> anyhow::Result<Fields> {
            prediction.insert("post".into(), Value::Bool(true));
            Ok(prediction)
        }
    }

    fn record(id: &str, doc: Value) -> InputRecord {
        InputRecord {
            id: id.to_string(),
            payload: Payload::Document(doc),
            meta: RecordMeta {
                request_id: "req-1".into(),
                ..Default::default()
            },
        }
    }

    fn adapter() -> PredictorAdapter {
        PredictorAdapter::new(Arc::new(Scripted))
    }

    #[tokio::test]
    async fn test_all_stages_run_in_order() {
        let result = adapter().process(record("r1", json!({}))).await.unwrap();
        assert_eq!(result.record_id, "r1");
        assert_eq!(result.meta.request_id, "req-1");
        assert_eq!(result.fields["score"], 0.9);
        assert_eq!(result.fields["post"], true);
    }

    #[tokio::test]
    async fn test_stage_errors_are_tagged() {
        let failed = adapter()
            .process(record("r1", json!({"fail": "preprocess"})))
            .await
            .unwrap_err();
        assert_eq!(failed.stage, FailureStage::Preprocess);

        let failed = adapter()
            .process(record("r2", json!({"fail": "predict"})))
            .await
            .unwrap_err();
        assert_eq!(failed.stage, FailureStage::Predict);
        assert_eq!(failed.record_id, "r2");
        assert!(failed.reason.contains("model rejected input"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let failed = adapter()
            .process(record("r1", json!({"fail": "panic"})))
            .await
            .unwrap_err();
        assert_eq!(failed.stage, FailureStage::Predict);
        assert!(failed.reason.contains("model crashed"));

        // The adapter is still usable afterwards
        assert!(adapter().process(record("r2", json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_fails_the_record() {
        let adapter = adapter().with_timeout(Some(Duration::from_millis(20)));
        let failed = adapter
            .process(record("slow", json!({"fail": "slow"})))
            .await
            .unwrap_err();
        assert!(failed.reason.contains("timeout"));

        assert!(adapter.process(record("fast", json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_pre_hook_runs_and_its_meta_is_kept() {
        let result = adapter().process(record("r1", json!({}))).await.unwrap();
        assert_eq!(result.meta.attributes["hooked"], true);
    }

    #[tokio::test]
    async fn test_invalid_record_skips_the_stages() {
        let failed = adapter()
            .process(record("r1", json!({"reject": true, "fail": "panic"})))
            .await
            .unwrap_err();
        assert_eq!(failed.stage, FailureStage::Validate);
        assert_eq!(failed.reason, "is_valid=false, record not processed");
        assert_eq!(failed.meta.attributes[IS_VALID_ATTRIBUTE], false);

        // Marked by the source rather than the hook
        let mut invalid = record("r2", json!({}));
        invalid
            .meta
            .attributes
            .insert(IS_VALID_ATTRIBUTE.into(), Value::Bool(false));
        let failed = adapter().process(invalid).await.unwrap_err();
        assert_eq!(failed.stage, FailureStage::Validate);
    }

    struct Recording {
        settled: Mutex<Vec<(String, bool)>>,
    }

    impl Predictor for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn predict(&self, _input: &Payload, _meta: &RecordMeta) -> anyhow::Result<Fields> {
            Ok(Fields::new())
        }

        fn post_predict_hook(&self, entry: &ChunkEntry, written: bool) {
            self.settled
                .lock()
                .unwrap()
                .push((entry.record_id().to_string(), written));
        }
    }

    #[tokio::test]
    async fn test_post_hook_is_forwarded() {
        let predictor = Arc::new(Recording {
            settled: Mutex::new(Vec::new()),
        });
        let adapter = PredictorAdapter::new(predictor.clone());

        let result = adapter.process(record("r1", json!({}))).await.unwrap();
        adapter.post_predict_hook(&ChunkEntry::Result(result), true);

        assert_eq!(
            *predictor.settled.lock().unwrap(),
            vec![("r1".to_string(), true)]
        );
    }
}
