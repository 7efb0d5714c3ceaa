//! Name-to-factory lookup for predictors

use super::{ImageStatsPredictor, Predictor};
use crate::error::{HarnessError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Builds a predictor instance
pub type PredictorFactory = Box<dyn Fn() -> anyhow::Result<Arc<dyn Predictor>> + Send + Sync>;

/// Predictors available to the harness, resolved once at startup
pub struct PredictorRegistry {
    factories: BTreeMap<String, PredictorFactory>,
}

impl Default for PredictorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl PredictorRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding the predictors that ship with the harness
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ImageStatsPredictor::NAME, || {
            Ok(Arc::new(ImageStatsPredictor::new()) as Arc<dyn Predictor>)
        });
        registry
    }

    /// Add or replace a factory
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<Arc<dyn Predictor>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate the predictor registered under `name`
    pub fn create(&self, name: &str) -> Result<Arc<dyn Predictor>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            HarnessError::Config(format!(
                "unknown predictor `{}` (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;

        let predictor = factory()
            .map_err(|e| HarnessError::Predictor(format!("failed to build `{}`: {:#}", name, e)))?;
        info!(
            predictor = %predictor.name(),
            version = %predictor.version(),
            "Predictor loaded"
        );
        Ok(predictor)
    }
}
