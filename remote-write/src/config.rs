use crate::replicator::PRIMARY_ENDPOINT_NAME;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Overrides `error_log.threshold`.
pub const THRESHOLD_ENV: &str = "LOG_MAX_COUNT";
/// Overrides `error_log.interval`, e.g. `600s` or `10m`.
pub const INTERVAL_ENV: &str = "LOG_INTERVAL";

const DEFAULT_THRESHOLD: u64 = 10;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(600);
const DEFAULT_WORKERS: usize = 4;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Receive path must start with '/': {0}")]
    InvalidReceivePath(String),

    #[error("Empty endpoint name")]
    EmptyEndpointName,

    #[error("Duplicate endpoint name: {0}")]
    DuplicateEndpoint(String),

    #[error("No endpoints and no primary write URL configured")]
    NoDestinations,

    #[error("Error log threshold must be at least 1")]
    InvalidThreshold,

    #[error("Error log interval cannot be zero")]
    InvalidInterval,

    #[error("Error log worker count must be at least 1")]
    InvalidWorkerCount,
}

/// Remote write gateway configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener receiving remote write requests
    pub listener: Listener,
    /// Admin listener for health and readiness checks
    pub admin_listener: Listener,
    /// Path the write endpoint is mounted on
    #[serde(default = "default_receive_path")]
    pub receive_path: String,
    /// Base URL of the primary write target. The inbound request path is joined onto
    /// its path for every request.
    #[serde(default)]
    pub primary_write_url: Option<Url>,
    /// Additional destinations each write is replicated to
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Destinations every write is mirrored to before the caller is answered
    #[serde(default)]
    pub export_endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub error_log: ErrorLogConfig,
    /// Upper bound on how much of a failed backend response ends up in the logs
    #[serde(default = "default_response_excerpt_bytes")]
    pub response_excerpt_bytes: usize,
}

fn default_receive_path() -> String {
    "/api/v1/receive".into()
}

fn default_response_excerpt_bytes() -> usize {
    1024
}

impl Config {
    /// Validates the gateway configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if !self.receive_path.starts_with('/') {
            return Err(ValidationError::InvalidReceivePath(
                self.receive_path.clone(),
            ));
        }

        if self.endpoints.is_empty() && self.primary_write_url.is_none() {
            return Err(ValidationError::NoDestinations);
        }

        let mut names = HashSet::new();
        if self.primary_write_url.is_some() {
            names.insert(PRIMARY_ENDPOINT_NAME);
        }
        // Names label metrics and failure logs, so they are unique across both sets
        for endpoint in self.endpoints.iter().chain(&self.export_endpoints) {
            if endpoint.name.is_empty() {
                return Err(ValidationError::EmptyEndpointName);
            }

            if !names.insert(endpoint.name.as_str()) {
                return Err(ValidationError::DuplicateEndpoint(endpoint.name.clone()));
            }
        }

        self.error_log.validate()
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// One replication destination.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Endpoint {
    /// Identifies the destination in logs and metrics
    pub name: String,
    pub url: Url,
    /// Client certificate material for mutual TLS
    #[serde(default)]
    pub tls_config: Option<TlsConfig>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

/// Paths to PEM files. They are read every time a transport is built.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TlsConfig {
    /// CA bundle the destination's server certificate must chain to
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Clone, Deserialize, PartialEq)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Tuning of the repeated-error suppression.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorLogConfig {
    /// Number of independent suppression workers
    pub workers: usize,
    /// Identical failures within `interval` before logging is suppressed
    pub threshold: u64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}

impl Default for ErrorLogConfig {
    fn default() -> Self {
        ErrorLogConfig {
            workers: DEFAULT_WORKERS,
            threshold: DEFAULT_THRESHOLD,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl ErrorLogConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::InvalidWorkerCount);
        }
        if self.threshold == 0 {
            return Err(ValidationError::InvalidThreshold);
        }
        if self.interval.is_zero() {
            return Err(ValidationError::InvalidInterval);
        }
        Ok(())
    }

    /// Applies `LOG_MAX_COUNT` and `LOG_INTERVAL` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`. Unparsable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(THRESHOLD_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(threshold) => self.threshold = threshold,
                Err(err) => {
                    tracing::warn!(variable = THRESHOLD_ENV, value = %raw, error = %err, "Ignoring invalid override")
                }
            }
        }

        if let Some(raw) = lookup(INTERVAL_ENV) {
            match humantime::parse_duration(raw.trim()) {
                Ok(interval) => self.interval = interval,
                Err(err) => {
                    tracing::warn!(variable = INTERVAL_ENV, value = %raw, error = %err, "Ignoring invalid override")
                }
            }
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}
