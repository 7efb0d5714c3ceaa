//! Harness configuration
//!
//! Keys come from an optional file overlaid by `HARNESS_*` environment
//! variables; CLI overrides win over both.

use anyhow::{Context, Result};
use harness_lib::settings::{HarnessSettings, ENV_PREFIX};
use harness_lib::backends::Backends;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub predictor: Option<String>,
    pub input: Option<String>,
    pub output: Option<String>,
    /// Comma separated object URIs (forces the object-list source)
    pub input_uris: Option<String>,
}

/// Settings the binary needs on top of the harness settings
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// `local` or `memory`
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Root directory for the local backend
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_local_root() -> PathBuf {
    PathBuf::from("./harness-data")
}

fn default_api_port() -> u16 {
    8080
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            local_root: default_local_root(),
            api_port: default_api_port(),
        }
    }
}

impl RuntimeConfig {
    /// Build the backends this process runs against
    pub fn backends(&self) -> Result<Backends> {
        match self.backend.as_str() {
            "memory" => Ok(Backends::in_memory()),
            "local" => Backends::local(&self.local_root).with_context(|| {
                format!("opening local backend at {}", self.local_root.display())
            }),
            other => anyhow::bail!("unknown backend `{}` (expected local or memory)", other),
        }
    }
}

/// Everything loaded at startup
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub harness: HarnessSettings,
    pub runtime: RuntimeConfig,
}

/// Load configuration from an optional file, the environment and CLI overrides
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<LoadedConfig> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let input = if overrides.input_uris.is_some() {
        Some("object-list".to_string())
    } else {
        overrides.input.clone()
    };

    let config = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true),
        )
        .set_override_option("predictor", overrides.predictor.clone())?
        .set_override_option("input", input)?
        .set_override_option("output", overrides.output.clone())?
        .set_override_option("input_uris", overrides.input_uris.clone())?
        .build()
        .context("reading configuration")?;

    let harness: HarnessSettings = config
        .clone()
        .try_deserialize()
        .context("parsing harness settings")?;
    let runtime: RuntimeConfig = config
        .try_deserialize()
        .context("parsing runtime settings")?;

    Ok(LoadedConfig { harness, runtime })
}
