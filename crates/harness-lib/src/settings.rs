//! Harness settings
//!
//! `HarnessSettings` is the flat key/value surface (every key optional, with
//! defaults). `resolve` validates it once at startup into the typed source,
//! sink and runner settings; nothing is re-read per record.

use crate::error::{HarnessError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Environment prefix used in error messages for missing keys
pub const ENV_PREFIX: &str = "HARNESS";

/// Flat settings as read from the environment or a config file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    pub predictor: String,
    pub input: String,
    pub output: String,

    // Input
    pub input_uris: Option<String>,
    pub input_queue_url: Option<String>,
    pub input_uri_keys: String,
    pub input_max_messages: usize,
    pub input_wait_time_secs: u64,
    pub input_visibility_timeout_secs: u64,
    pub input_max_receive_count: u32,
    pub input_requeue_delay_secs: u64,
    pub input_max_records_per_pass: usize,
    pub input_request_id_field: String,
    pub input_collection_id_field: String,
    pub input_expected_count_field: String,
    /// Hand each queued request document to the predictor instead of fetching objects
    pub input_passthrough: bool,
    pub download_workers: usize,
    pub request_id: Option<String>,
    pub collection_id: Option<String>,

    // Output
    pub output_queue_url: Option<String>,
    pub output_max_send_attempts: u32,
    pub output_bucket: Option<String>,
    pub output_key_prefix: String,
    pub output_fieldnames: Option<String>,
    pub output_delimiter: String,
    pub output_requests_table: Option<String>,
    pub output_results_table: Option<String>,
    pub requests_hash_key: String,
    pub results_hash_key: String,
    pub results_sort_key: String,
    pub state_field: String,
    pub parent_fields: String,
    pub decimal_precision: u32,

    // Runner
    pub chunk_size: usize,
    pub max_flush_attempts: u32,
    pub flush_retry_delay_ms: u64,
    pub predict_timeout_secs: Option<u64>,
    pub idle_poll_secs: u64,
    pub stuck_request_secs: Option<u64>,
    pub fail_on_partial: bool,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            predictor: "image-stats".to_string(),
            input: "object-list".to_string(),
            output: "queue".to_string(),

            input_uris: None,
            input_queue_url: None,
            input_uri_keys: "s3_uri".to_string(),
            input_max_messages: 10,
            input_wait_time_secs: 20,
            // 50 requests x 60 seconds each
            input_visibility_timeout_secs: 3_000,
            input_max_receive_count: 3,
            input_requeue_delay_secs: 0,
            input_max_records_per_pass: 50,
            input_request_id_field: "request_id".to_string(),
            input_collection_id_field: "collection_id".to_string(),
            input_expected_count_field: "expected_records".to_string(),
            input_passthrough: false,
            download_workers: 8,
            request_id: None,
            collection_id: None,

            output_queue_url: None,
            output_max_send_attempts: 3,
            output_bucket: None,
            output_key_prefix: "results".to_string(),
            output_fieldnames: None,
            output_delimiter: ",".to_string(),
            output_requests_table: None,
            output_results_table: None,
            requests_hash_key: "request_id".to_string(),
            results_hash_key: "hashkey".to_string(),
            results_sort_key: "s3_uri".to_string(),
            state_field: "state".to_string(),
            parent_fields: "request_id,s3_uri".to_string(),
            decimal_precision: 6,

            chunk_size: 15,
            max_flush_attempts: 3,
            flush_retry_delay_ms: 500,
            predict_timeout_secs: None,
            idle_poll_secs: 1,
            stuck_request_secs: None,
            fail_on_partial: false,
        }
    }
}

/// Object-list (batch) source settings
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectListSettings {
    pub uris: Vec<String>,
    /// Attribute name the URI is recorded under
    pub uri_key: String,
    pub request_id: Option<String>,
    pub collection_id: Option<String>,
    pub download_workers: usize,
}

/// Queue-subscribed source settings
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSourceSettings {
    pub queue_url: String,
    pub uri_keys: Vec<String>,
    pub max_messages: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub requeue_delay: Duration,
    pub max_records_per_pass: usize,
    pub request_id_field: String,
    pub collection_id_field: String,
    pub expected_count_field: String,
    pub passthrough: bool,
    pub download_workers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceSettings {
    ObjectList(ObjectListSettings),
    Queue(QueueSourceSettings),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSinkSettings {
    pub queue_url: String,
    pub max_send_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectFileSettings {
    pub bucket: String,
    pub key_prefix: String,
    pub fieldnames: Vec<String>,
    pub delimiter: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSinkSettings {
    pub requests_table: String,
    pub results_table: String,
    pub requests_hash_key: String,
    pub results_hash_key: String,
    pub results_sort_key: String,
    pub state_field: String,
    pub parent_fields: Vec<String>,
    pub decimal_precision: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkSettings {
    Queue(QueueSinkSettings),
    ObjectFile(ObjectFileSettings),
    Table(TableSinkSettings),
}

/// Orchestration settings
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub chunk_size: usize,
    pub max_flush_attempts: u32,
    pub flush_retry_delay: Duration,
    pub predict_timeout: Option<Duration>,
    pub idle_poll: Duration,
    pub stuck_request_after: Option<Duration>,
    pub fail_on_partial: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            chunk_size: 15,
            max_flush_attempts: 3,
            flush_retry_delay: Duration::from_millis(500),
            predict_timeout: None,
            idle_poll: Duration::from_secs(1),
            stuck_request_after: None,
            fail_on_partial: false,
        }
    }
}

/// Settings after validation
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub predictor: String,
    pub source: SourceSettings,
    pub sink: SinkSettings,
    pub runner: RunnerSettings,
}

/// Split a comma separated setting, dropping blanks
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_name(key: &str) -> String {
    format!("{}_{}", ENV_PREFIX, key.to_uppercase())
}

/// Collects missing required keys so they can be reported together
struct Required {
    component: &'static str,
    missing: Vec<String>,
}

impl Required {
    fn new(component: &'static str) -> Self {
        Self {
            component,
            missing: Vec::new(),
        }
    }

    fn take(&mut self, key: &str, value: &Option<String>) -> String {
        match value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                self.missing.push(env_name(key));
                String::new()
            }
        }
    }

    fn finish(self) -> Result<()> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::MissingConfig {
                component: self.component.to_string(),
                missing: self.missing,
            })
        }
    }
}

impl HarnessSettings {
    /// Validate and resolve into typed settings
    pub fn resolve(&self) -> Result<ResolvedSettings> {
        let source = self.resolve_source()?;
        let sink = self.resolve_sink()?;
        let runner = self.resolve_runner()?;

        if self.predictor.trim().is_empty() {
            return Err(HarnessError::MissingConfig {
                component: "predictor".to_string(),
                missing: vec![env_name("predictor")],
            });
        }

        Ok(ResolvedSettings {
            predictor: self.predictor.trim().to_string(),
            source,
            sink,
            runner,
        })
    }

    fn uri_keys(&self) -> Result<Vec<String>> {
        let keys = split_list(&self.input_uri_keys);
        if keys.is_empty() {
            return Err(HarnessError::Config(format!(
                "{} must name at least one field",
                env_name("input_uri_keys")
            )));
        }
        Ok(keys)
    }

    fn resolve_source(&self) -> Result<SourceSettings> {
        let workers = self.download_workers.max(1);

        match self.input.trim() {
            "object-list" => {
                let mut required = Required::new("object-list source");
                let uris = split_list(&required.take("input_uris", &self.input_uris));
                required.finish()?;

                let uri_key = self.uri_keys()?.remove(0);
                Ok(SourceSettings::ObjectList(ObjectListSettings {
                    uris,
                    uri_key,
                    request_id: self.request_id.clone(),
                    collection_id: self.collection_id.clone(),
                    download_workers: workers,
                }))
            }
            "queue" => {
                let mut required = Required::new("queue source");
                let queue_url = required.take("input_queue_url", &self.input_queue_url);
                required.finish()?;

                if self.input_max_receive_count == 0 {
                    return Err(HarnessError::Config(format!(
                        "{} must be at least 1",
                        env_name("input_max_receive_count")
                    )));
                }

                Ok(SourceSettings::Queue(QueueSourceSettings {
                    queue_url,
                    uri_keys: self.uri_keys()?,
                    max_messages: self.input_max_messages.clamp(1, 10),
                    wait_time: Duration::from_secs(self.input_wait_time_secs),
                    visibility_timeout: Duration::from_secs(self.input_visibility_timeout_secs),
                    max_receive_count: self.input_max_receive_count,
                    requeue_delay: Duration::from_secs(self.input_requeue_delay_secs),
                    max_records_per_pass: self.input_max_records_per_pass.max(1),
                    request_id_field: self.input_request_id_field.clone(),
                    collection_id_field: self.input_collection_id_field.clone(),
                    expected_count_field: self.input_expected_count_field.clone(),
                    passthrough: self.input_passthrough,
                    download_workers: workers,
                }))
            }
            other => Err(HarnessError::Config(format!(
                "unknown input source `{}` (expected object-list or queue)",
                other
            ))),
        }
    }

    fn resolve_sink(&self) -> Result<SinkSettings> {
        match self.output.trim() {
            "queue" => {
                let mut required = Required::new("queue sink");
                let queue_url = required.take("output_queue_url", &self.output_queue_url);
                required.finish()?;

                Ok(SinkSettings::Queue(QueueSinkSettings {
                    queue_url,
                    max_send_attempts: self.output_max_send_attempts.max(1),
                }))
            }
            "object-file" => {
                let mut required = Required::new("object-file sink");
                let bucket = required.take("output_bucket", &self.output_bucket);
                let fieldnames = split_list(&required.take("output_fieldnames", &self.output_fieldnames));
                required.finish()?;

                let delimiter = match self.output_delimiter.as_bytes() {
                    [b] => *b,
                    _ => {
                        return Err(HarnessError::Config(format!(
                            "{} must be a single byte, got `{}`",
                            env_name("output_delimiter"),
                            self.output_delimiter
                        )))
                    }
                };

                Ok(SinkSettings::ObjectFile(ObjectFileSettings {
                    bucket,
                    key_prefix: self.output_key_prefix.trim_matches('/').to_string(),
                    fieldnames,
                    delimiter,
                }))
            }
            "table" => {
                let mut required = Required::new("table sink");
                let requests_table =
                    required.take("output_requests_table", &self.output_requests_table);
                let results_table =
                    required.take("output_results_table", &self.output_results_table);
                required.finish()?;

                Ok(SinkSettings::Table(TableSinkSettings {
                    requests_table,
                    results_table,
                    requests_hash_key: self.requests_hash_key.clone(),
                    results_hash_key: self.results_hash_key.clone(),
                    results_sort_key: self.results_sort_key.clone(),
                    state_field: self.state_field.clone(),
                    parent_fields: split_list(&self.parent_fields),
                    decimal_precision: self.decimal_precision,
                }))
            }
            other => Err(HarnessError::Config(format!(
                "unknown output sink `{}` (expected queue, object-file or table)",
                other
            ))),
        }
    }

    fn resolve_runner(&self) -> Result<RunnerSettings> {
        if self.chunk_size == 0 {
            return Err(HarnessError::Config(format!(
                "{} must be at least 1",
                env_name("chunk_size")
            )));
        }

        Ok(RunnerSettings {
            chunk_size: self.chunk_size,
            max_flush_attempts: self.max_flush_attempts.max(1),
            flush_retry_delay: Duration::from_millis(self.flush_retry_delay_ms),
            predict_timeout: self.predict_timeout_secs.map(Duration::from_secs),
            idle_poll: Duration::from_secs(self.idle_poll_secs),
            stuck_request_after: self.stuck_request_secs.map(Duration::from_secs),
            fail_on_partial: self.fail_on_partial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_settings() -> HarnessSettings {
        HarnessSettings {
            input_uris: Some("s3://in/a.png, s3://in/b.png".to_string()),
            output_queue_url: Some("results".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_resolve_for_batch_mode() {
        let resolved = batch_settings().resolve().unwrap();

        assert_eq!(resolved.predictor, "image-stats");
        match resolved.source {
            SourceSettings::ObjectList(s) => {
                assert_eq!(s.uris, vec!["s3://in/a.png", "s3://in/b.png"]);
                assert_eq!(s.uri_key, "s3_uri");
                assert_eq!(s.download_workers, 8);
            }
            other => panic!("unexpected source {:?}", other),
        }
        assert_eq!(resolved.runner.chunk_size, 15);
        assert_eq!(resolved.runner.max_flush_attempts, 3);
    }

    #[test]
    fn test_missing_table_names_reported_together() {
        let settings = HarnessSettings {
            output: "table".to_string(),
            ..batch_settings()
        };

        match settings.resolve() {
            Err(HarnessError::MissingConfig { component, missing }) => {
                assert_eq!(component, "table sink");
                assert_eq!(
                    missing,
                    vec![
                        "HARNESS_OUTPUT_REQUESTS_TABLE".to_string(),
                        "HARNESS_OUTPUT_RESULTS_TABLE".to_string()
                    ]
                );
            }
            other => panic!("expected MissingConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_object_file_requires_bucket_and_fieldnames() {
        let settings = HarnessSettings {
            output: "object-file".to_string(),
            output_bucket: Some("  ".to_string()),
            ..batch_settings()
        };

        let err = settings.resolve().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("HARNESS_OUTPUT_BUCKET"));
        assert!(msg.contains("HARNESS_OUTPUT_FIELDNAMES"));
    }

    #[test]
    fn test_object_file_rejects_multibyte_delimiter() {
        let settings = HarnessSettings {
            output: "object-file".to_string(),
            output_bucket: Some("out".to_string()),
            output_fieldnames: Some("label".to_string()),
            output_delimiter: "||".to_string(),
            ..batch_settings()
        };

        assert!(matches!(settings.resolve(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_queue_source_requires_url() {
        let settings = HarnessSettings {
            input: "queue".to_string(),
            ..batch_settings()
        };

        let err = settings.resolve().unwrap_err();
        assert!(err.to_string().contains("HARNESS_INPUT_QUEUE_URL"));
    }

    #[test]
    fn test_queue_source_settings_are_clamped() {
        let settings = HarnessSettings {
            input: "queue".to_string(),
            input_queue_url: Some("requests".to_string()),
            input_max_messages: 50,
            input_uri_keys: "s3_uri, thumbnail_uri".to_string(),
            ..batch_settings()
        };

        match settings.resolve().unwrap().source {
            SourceSettings::Queue(q) => {
                assert_eq!(q.max_messages, 10);
                assert_eq!(q.uri_keys, vec!["s3_uri", "thumbnail_uri"]);
                assert_eq!(q.visibility_timeout, Duration::from_secs(3_000));
                assert!(!q.passthrough);
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_passthrough_flag_reaches_queue_settings() {
        let settings = HarnessSettings {
            input: "queue".to_string(),
            input_queue_url: Some("requests".to_string()),
            input_passthrough: true,
            ..batch_settings()
        };

        match settings.resolve().unwrap().source {
            SourceSettings::Queue(q) => assert!(q.passthrough),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_unknown_selectors_are_config_errors() {
        let bad_input = HarnessSettings {
            input: "kafka".to_string(),
            ..batch_settings()
        };
        assert!(matches!(bad_input.resolve(), Err(HarnessError::Config(_))));

        let bad_output = HarnessSettings {
            output: "postgres".to_string(),
            ..batch_settings()
        };
        assert!(matches!(bad_output.resolve(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let settings = HarnessSettings {
            chunk_size: 0,
            ..batch_settings()
        };
        assert!(matches!(settings.resolve(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_split_list_drops_blanks() {
        assert_eq!(split_list(" a, ,b ,"), vec!["a", "b"]);
        assert!(split_list("").is_empty());
    }
}
