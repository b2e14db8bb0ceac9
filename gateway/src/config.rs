use remote_write::config::Config as RemoteWriteConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Filter directive, overridden by `RUST_LOG`
    pub level: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub remote_write: Option<RemoteWriteConfig>,
}

impl Config {
    /// Loads the YAML file at `path`, then applies environment overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let mut config: Config = serde_yaml::from_reader(file)?;

        if let Some(remote_write) = config.remote_write.as_mut() {
            remote_write.error_log.apply_env_overrides();
        }

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}
