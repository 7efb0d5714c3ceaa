//! Prediction harness - runs a predictor between a source and a sink
//!
//! Batch mode processes an explicit list of object URIs and exits.
//! Service mode subscribes to a queue and runs until SIGINT/SIGTERM.

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use harness_lib::{
    exit_code,
    health::HealthRegistry,
    observability::StructuredLogger,
    predictor::{PredictorAdapter, PredictorRegistry},
    runner::EXIT_FATAL,
    settings::{ResolvedSettings, SourceSettings},
    sink::Sink,
    source::Source,
    Runner,
};
use predict_harness::{api, config};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const HARNESS_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "predict-harness", version, about = "Run a predictor between a source and a sink")]
struct Cli {
    /// Registered predictor name
    #[arg(short, long)]
    predictor: Option<String>,

    /// Input source (object-list, queue)
    #[arg(short, long)]
    input: Option<String>,

    /// Output sink (queue, object-file, table)
    #[arg(short, long)]
    output: Option<String>,

    /// Configuration file, overlaid by HARNESS_* environment variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single pass against a queue source and exit
    #[arg(long)]
    once: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Object URIs to process in batch mode
    #[arg(value_delimiter = ',')]
    uris: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            predictor: self.predictor.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            input_uris: (!self.uris.is_empty()).then(|| self.uris.join(",")),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing with JSON output and env filter
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Harness failed to start");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    info!(version = HARNESS_VERSION, "Starting predict-harness");

    let loaded = config::load(cli.config.as_deref(), &cli.overrides())?;
    let resolved = loaded.harness.resolve()?;
    let backends = loaded.runtime.backends()?;
    info!(
        backend = %loaded.runtime.backend,
        predictor = %resolved.predictor,
        "Harness configured"
    );

    let predictor = PredictorRegistry::with_builtins().create(&resolved.predictor)?;
    let adapter = PredictorAdapter::new(predictor);

    let source = Source::from_settings(&resolved.source, &backends);
    let sink = Sink::from_settings(&resolved.sink, &backends);
    let logger = StructuredLogger::new(format!("run-{}", Utc::now().format("%Y%m%dT%H%M%SZ")));

    let service_mode = matches!(resolved.source, SourceSettings::Queue(_)) && !cli.once;
    let fail_on_partial = resolved.runner.fail_on_partial;

    if service_mode {
        serve(resolved, source, adapter, sink, logger, loaded.runtime.api_port).await
    } else {
        let mut runner = Runner::new(source, adapter, sink, resolved.runner, logger);
        let outcome = runner.run().await;
        Ok(exit_code(&outcome, fail_on_partial))
    }
}

async fn serve(
    resolved: ResolvedSettings,
    source: Source,
    adapter: PredictorAdapter,
    sink: Sink,
    logger: StructuredLogger,
    api_port: u16,
) -> Result<u8> {
    let health = HealthRegistry::new();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let api_state = api::ApiState::new(health.clone());
    let api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, api_state, api_shutdown).await {
            warn!(error = %e, "API server stopped");
        }
    });

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(());
    });

    let mut runner =
        Runner::new(source, adapter, sink, resolved.runner, logger).with_health(health);
    let outcome = runner.serve(shutdown_rx).await;

    // A fatal error ends serve without a signal; stop the API too
    let _ = shutdown_tx.send(());
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API task failed");
    }
    Ok(exit_code(&outcome, false))
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
