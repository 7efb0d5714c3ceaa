//! Prediction execution harness
//!
//! This crate provides the core functionality for:
//! - Pulling records from object storage or a subscribed queue
//! - Running a pluggable predictor over each record
//! - Buffering results into chunks and flushing them to a queue, a
//!   delimited file, or a two-table request/result store
//! - Health checks and observability

pub mod backends;
pub mod buffer;
pub mod codec;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod runner;
pub mod settings;
pub mod sink;
pub mod source;

pub use error::{BackendError, HarnessError, Result};
pub use health::{Component, HealthRegistry, HealthSnapshot, PassReport, Readiness, Status};
pub use models::*;
pub use observability::{HarnessMetrics, StructuredLogger};
pub use runner::{exit_code, RunState, Runner};
