//! Predictor contract and its adapter
//!
//! A predictor is any type implementing three stages: `preprocess` and
//! `postprocess` default to pass-through, `predict` is mandatory. Returning
//! an error is the only failure signal and it is scoped to one record.
//!
//! Two optional hooks bracket the stages. `pre_predict_hook` sees every
//! record first and may mark it invalid by setting the `is_valid` attribute
//! to `false`; such records skip the stages. `post_predict_hook` runs once
//! the record's outcome has been written (or given up on) by the sink.

mod adapter;
mod builtin;
mod registry;

pub use adapter::{PredictorAdapter, IS_VALID_ATTRIBUTE};
pub use builtin::ImageStatsPredictor;
pub use registry::{PredictorFactory, PredictorRegistry};

use crate::models::{ChunkEntry, Fields, Payload, RecordMeta};
use anyhow::Result;

/// User-supplied prediction unit
///
/// Calls run on a blocking thread, so implementations may do heavy CPU work.
pub trait Predictor: Send + Sync {
    /// Name used for logging
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "unversioned"
    }

    /// Inspect a record before any stage runs
    fn pre_predict_hook(&self, _payload: &Payload, _meta: &mut RecordMeta) {}

    /// Transform the decoded payload before prediction
    fn preprocess(&self, payload: Payload, _meta: &RecordMeta) -> Result<Payload> {
        Ok(payload)
    }

    /// Produce prediction fields for one record
    fn predict(&self, input: &Payload, meta: &RecordMeta) -> Result<Fields>;

    /// Shape the prediction before it is buffered
    fn postprocess(&self, prediction: Fields) -> Result<Fields> {
        Ok(prediction)
    }

    /// Called after the sink settled the entry; `written` is false when the
    /// sink rejected it or its chunk was abandoned
    fn post_predict_hook(&self, _entry: &ChunkEntry, _written: bool) {}
}
