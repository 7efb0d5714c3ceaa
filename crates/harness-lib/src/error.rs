//! Error taxonomy for the harness

use thiserror::Error;

/// Errors reported by storage, queue and table backends
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Network or service failure; the call may succeed if retried
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write lost a race with another writer
    #[error("condition check failed: {0}")]
    ConditionFailed(String),

    /// The request itself is malformed and will never succeed
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::ConditionFailed(_)
        )
    }
}

/// Harness-level errors, classified by how the runner recovers from them
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing required configuration for {component}: {}", .missing.join(", "))]
    MissingConfig {
        component: String,
        missing: Vec<String>,
    },

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("all {count} source records failed to load")]
    SourceExhausted { count: usize },

    #[error("predictor error: {0}")]
    Predictor(String),

    #[error("sink error (transient): {0}")]
    SinkTransient(String),

    #[error("sink error (permanent): {0}")]
    SinkPermanent(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl HarnessError {
    /// Fatal errors abort the run; everything else is recovered per record or per chunk
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::Config(_)
                | HarnessError::MissingConfig { .. }
                | HarnessError::SourceExhausted { .. }
                | HarnessError::Predictor(_)
                | HarnessError::SinkPermanent(_)
        )
    }

    /// Classify a backend failure raised while writing to a sink
    pub fn from_sink(err: BackendError) -> Self {
        match err {
            BackendError::Invalid(msg) => HarnessError::SinkPermanent(msg),
            other => HarnessError::SinkTransient(other.to_string()),
        }
    }

    /// Classify a backend failure raised while polling a source
    pub fn from_source(err: BackendError) -> Self {
        match err {
            BackendError::Invalid(msg) => HarnessError::Config(msg),
            other => HarnessError::SourceUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_lists_every_key() {
        let err = HarnessError::MissingConfig {
            component: "table sink".into(),
            missing: vec![
                "HARNESS_OUTPUT_REQUESTS_TABLE".into(),
                "HARNESS_OUTPUT_RESULTS_TABLE".into(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("table sink"));
        assert!(msg.contains("HARNESS_OUTPUT_REQUESTS_TABLE, HARNESS_OUTPUT_RESULTS_TABLE"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_sink_backend_classification() {
        let transient = HarnessError::from_sink(BackendError::Unavailable("timeout".into()));
        assert!(matches!(transient, HarnessError::SinkTransient(_)));
        assert!(!transient.is_fatal());

        let conflict = HarnessError::from_sink(BackendError::ConditionFailed("v2".into()));
        assert!(matches!(conflict, HarnessError::SinkTransient(_)));

        let permanent = HarnessError::from_sink(BackendError::Invalid("schema".into()));
        assert!(matches!(permanent, HarnessError::SinkPermanent(_)));
        assert!(permanent.is_fatal());
    }

    #[test]
    fn test_source_errors_are_recoverable() {
        let err = HarnessError::from_source(BackendError::Unavailable("poll".into()));
        assert!(!err.is_fatal());
        assert!(HarnessError::SourceExhausted { count: 3 }.is_fatal());
    }
}
