mod config;

use clap::{Parser, Subcommand};
use config::{CommonConfig, Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "gateway")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Replicate Prometheus remote write requests to every configured destination
    RemoteWrite {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("config has no remote_write section")]
    MissingRemoteWrite,
    #[error("could not set up statsd exporter: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    RemoteWrite(#[from] remote_write::errors::RemoteWriteError),
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "Gateway exited");
        eprintln!("gateway: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        CliCommand::RemoteWrite { config } => {
            let config = Config::from_file(&config)?;
            let _sentry = init_logging(config.common.logging.as_ref());
            init_metrics(&config.common)?;

            let remote_write = config.remote_write.ok_or(CliError::MissingRemoteWrite)?;

            tracing::info!("Starting remote-write");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(remote_write::run(remote_write))?;
            Ok(())
        }
    }
}

/// Installs the global subscriber. The returned guard flushes Sentry on drop.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let level = logging
        .and_then(|logging| logging.level.as_deref())
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let guard = logging
        .and_then(|logging| logging.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(common: &CommonConfig) -> Result<(), CliError> {
    let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = &common.metrics
    else {
        return Ok(());
    };

    let recorder = StatsdBuilder::from(statsd_host.as_str(), *statsd_port)
        .build(Some("gateway"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    tracing::info!(host = %statsd_host, port = statsd_port, "Sending metrics to statsd");
    Ok(())
}
