//! Outbound HTTP transports for replication destinations.
//!
//! Destinations without TLS material share one pooled client. Destinations with a
//! [`TlsConfig`] get a client of their own, built from the PEM files on every request
//! and with connection reuse disabled, so a connection (and the certificate it was
//! negotiated with) is never carried over to another logical destination.

use crate::config::TlsConfig;
use reqwest::tls::Version;
use reqwest::{Certificate, Client, Identity};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MIN_TLS_VERSION: Version = Version::TLS_1_2;

/// A destination's TLS material could not be turned into a transport.
///
/// Only the affected destination is skipped.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("failed to load ca cert file {path}: {source}")]
    ReadCa { path: PathBuf, source: io::Error },

    #[error("failed to parse ca cert file {path}: {source}")]
    ParseCa {
        path: PathBuf,
        source: reqwest::Error,
    },

    #[error("no certificates found in ca cert file {0}")]
    EmptyCa(PathBuf),

    #[error("failed to load client cert/key file {path}: {source}")]
    ReadKeyPair { path: PathBuf, source: io::Error },

    #[error("invalid client cert/key pair: {0}")]
    InvalidKeyPair(#[source] reqwest::Error),

    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
}

#[derive(Clone, Debug)]
pub struct TransportBuilder {
    dial_timeout: Duration,
    keepalive_interval: Duration,
    handshake_timeout: Duration,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        TransportBuilder {
            dial_timeout: DIAL_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
        }
    }
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pooled client used by every destination without TLS material.
    pub fn plain(&self) -> Result<Client, TransportError> {
        Client::builder()
            .connect_timeout(self.dial_timeout)
            .tcp_keepalive(self.keepalive_interval)
            .build()
            .map_err(TransportError::Build)
    }

    /// Builds a mutual-TLS client trusting only the CA bundle of `tls`.
    ///
    /// reqwest performs the handshake inside its connect phase, so the connect timeout
    /// is the dial timeout plus the handshake timeout.
    pub async fn build(&self, tls: &TlsConfig) -> Result<Client, TransportError> {
        let ca_pem = tokio::fs::read(&tls.ca)
            .await
            .map_err(|source| TransportError::ReadCa {
                path: tls.ca.clone(),
                source,
            })?;
        let roots =
            Certificate::from_pem_bundle(&ca_pem).map_err(|source| TransportError::ParseCa {
                path: tls.ca.clone(),
                source,
            })?;
        if roots.is_empty() {
            return Err(TransportError::EmptyCa(tls.ca.clone()));
        }

        let identity = load_identity(&tls.cert, &tls.key).await?;

        let mut builder = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .min_tls_version(MIN_TLS_VERSION)
            .identity(identity)
            .connect_timeout(self.dial_timeout + self.handshake_timeout)
            .tcp_keepalive(self.keepalive_interval)
            .pool_max_idle_per_host(0);

        for root in roots {
            builder = builder.add_root_certificate(root);
        }

        builder.build().map_err(TransportError::Build)
    }
}

async fn load_identity(cert: &Path, key: &Path) -> Result<Identity, TransportError> {
    let read = |path: &Path| {
        let path = path.to_path_buf();
        async move {
            tokio::fs::read(&path)
                .await
                .map_err(|source| TransportError::ReadKeyPair { path, source })
        }
    };

    let mut pem = read(cert).await?;
    pem.push(b'\n');
    pem.extend(read(key).await?);

    Identity::from_pem(&pem).map_err(TransportError::InvalidKeyPair)
}
