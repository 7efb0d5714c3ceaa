//! Entry-point support for the `predict-harness` binary

pub mod api;
pub mod config;
