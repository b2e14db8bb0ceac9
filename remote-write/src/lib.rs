pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod rate_limiter;
pub mod replicator;
pub mod request_id;
pub mod service;
pub mod transport;

#[cfg(test)]
mod testutils;

use crate::errors::RemoteWriteError;
use crate::rate_limiter::{ErrorRateLimiter, TracingSink};
use crate::replicator::RequestReplicator;
use crate::service::RemoteWriteService;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;

/// Serves the write endpoint and the admin endpoint until one of them fails or the
/// process is interrupted. Pending error summaries are flushed before returning.
pub async fn run(config: config::Config) -> Result<(), RemoteWriteError> {
    config.validate()?;
    shared::metrics_defs::describe_all(metrics_defs::ALL_METRICS);

    let (limiter, workers) = ErrorRateLimiter::spawn(&config.error_log, Arc::new(TracingSink));
    let replicator = RequestReplicator::new(&config, limiter.clone())?;
    let exporter = RequestReplicator::exporter(&config, limiter)?;

    tracing::info!(
        endpoints = config.endpoints.len(),
        export_endpoints = config.export_endpoints.len(),
        primary = config.primary_write_url.as_ref().map(|url| url.as_str()),
        receive_path = %config.receive_path,
        "Starting remote write gateway on {}:{}",
        config.listener.host,
        config.listener.port
    );

    let mut write_service = RemoteWriteService::new(replicator, &config.receive_path);
    if let Some(exporter) = exporter {
        write_service = write_service.with_exporter(exporter);
    }
    let admin_service = AdminService::new(|| true);

    let write_task = run_http_service(&config.listener.host, config.listener.port, write_service);
    let admin_task = run_http_service::<_, RemoteWriteError>(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    let result = tokio::select! {
        result = async { tokio::try_join!(write_task, admin_task).map(|_| ()) } => result,
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down remote write gateway");
            signal.map_err(RemoteWriteError::from)
        }
    };

    workers.shutdown().await;
    result
}
