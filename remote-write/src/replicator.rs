//! Replication of remote write requests to every configured destination.
//!
//! The inbound body is buffered once and shared by all outbound replicas. Each replica
//! is sent from its own detached task, so the caller is answered before any backend has
//! replied and a slow or broken destination never holds up the others. Outcomes are
//! only observable through metrics and the (rate limited) failure log.
//!
//! Export endpoints use [`RequestReplicator::mirror`] instead, which holds the caller
//! until every copy has finished.

use crate::config::{Config, Endpoint};
use crate::errors::{RemoteWriteError, Result};
use crate::metrics_defs::DELIVERIES;
use crate::rate_limiter::{ErrorRateLimiter, FailureContext, FailureKey, FailureMessage};
use crate::request_id::RequestId;
use crate::transport::{TransportBuilder, TransportError};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, HeaderMap};
use hyper::Request;
use shared::counter;
use shared::headers::forwardable_headers;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use url::Url;

/// Name of the destination derived from `primary_write_url`.
pub const PRIMARY_ENDPOINT_NAME: &str = "primary-write";

/// `code` label of deliveries that ended without a response.
pub const ERROR_CODE_LABEL: &str = "<error>";

const TRANSPORT_FAILED: &str = "Failed to create mtls transport";
const REQUEST_INVALID: &str = "Failed to create the forward request";
const SEND_FAILED: &str = "Failed to send request to the server";
const READ_FAILED: &str = "Failed to read response of the forward request";
const FORWARD_FAILED: &str = "Failed to forward metrics";

/// A destination resolved for a single inbound request.
#[derive(Clone, Debug, PartialEq)]
pub struct Destination {
    pub endpoint: Arc<Endpoint>,
    /// Where this request's replica goes. Differs from `endpoint.url` for the primary
    /// write target.
    pub url: Url,
}

impl Destination {
    pub fn name(&self) -> &str {
        &self.endpoint.name
    }
}

/// How a single replica ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The destination answered; any status, including errors.
    Status(u16),
    /// The destination's TLS material could not be loaded.
    ConfigError(String),
    /// The outbound request could not be built.
    InvalidRequest(String),
    /// Dial, TLS handshake or I/O failure.
    NetworkError(String),
}

impl Delivery {
    pub fn code_label(&self) -> String {
        match self {
            Delivery::Status(code) => code.to_string(),
            _ => ERROR_CODE_LABEL.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Delivery::Status(code) if (200..300).contains(code))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub destination: String,
    pub delivery: Delivery,
}

/// Fans inbound write requests out to the configured destinations.
pub struct RequestReplicator {
    endpoints: Vec<Arc<Endpoint>>,
    primary: Option<Arc<Endpoint>>,
    client: reqwest::Client,
    transports: TransportBuilder,
    limiter: ErrorRateLimiter,
    response_excerpt_bytes: usize,
    completions: Option<mpsc::UnboundedSender<DispatchOutcome>>,
}

impl RequestReplicator {
    /// Replicator for `endpoints` plus the primary write target.
    pub fn new(config: &Config, limiter: ErrorRateLimiter) -> Result<Self, TransportError> {
        Self::with_endpoints(
            &config.endpoints,
            config.primary_write_url.as_ref(),
            config.response_excerpt_bytes,
            limiter,
        )
    }

    /// Replicator for `export_endpoints`, meant for [`RequestReplicator::mirror`].
    /// `None` when no export endpoint is configured.
    pub fn exporter(
        config: &Config,
        limiter: ErrorRateLimiter,
    ) -> Result<Option<Self>, TransportError> {
        if config.export_endpoints.is_empty() {
            return Ok(None);
        }

        Self::with_endpoints(
            &config.export_endpoints,
            None,
            config.response_excerpt_bytes,
            limiter,
        )
        .map(Some)
    }

    pub fn with_endpoints(
        endpoints: &[Endpoint],
        primary_write_url: Option<&Url>,
        response_excerpt_bytes: usize,
        limiter: ErrorRateLimiter,
    ) -> Result<Self, TransportError> {
        let transports = TransportBuilder::new();
        let client = transports.plain()?;

        let primary = primary_write_url.map(|url| {
            Arc::new(Endpoint {
                name: PRIMARY_ENDPOINT_NAME.to_string(),
                url: url.clone(),
                tls_config: None,
                basic_auth: None,
            })
        });

        Ok(RequestReplicator {
            endpoints: endpoints.iter().cloned().map(Arc::new).collect(),
            primary,
            client,
            transports,
            limiter,
            response_excerpt_bytes,
            completions: None,
        })
    }

    /// Reports every finished dispatch on `tx`. Meant for tests that need to wait for a
    /// fan-out to complete.
    pub fn with_completion_notifier(mut self, tx: mpsc::UnboundedSender<DispatchOutcome>) -> Self {
        self.completions = Some(tx);
        self
    }

    /// Destinations of a request to `request_path`, in configuration order with the
    /// primary write target last. The shared configuration is never modified.
    pub fn destinations(&self, request_path: &str) -> Vec<Destination> {
        let configured = self.endpoints.iter().map(|endpoint| Destination {
            endpoint: endpoint.clone(),
            url: endpoint.url.clone(),
        });

        let primary = self.primary.iter().map(|endpoint| Destination {
            endpoint: endpoint.clone(),
            url: primary_url(&endpoint.url, request_path),
        });

        configured.chain(primary).collect()
    }

    /// Buffers the body of `request` and starts one replica per destination.
    ///
    /// Returns the request with its buffered body for further processing. The replicas
    /// keep running after this returns.
    pub async fn replicate<B>(
        &self,
        request: Request<B>,
        request_id: RequestId,
    ) -> Result<Request<Bytes>>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let request = buffer_request(request).await?;
        let dispatched = self.fan_out(&request, &request_id);
        tracing::debug!(
            request_id = %request_id,
            destinations = dispatched,
            bytes = request.body().len(),
            "Replicating write request"
        );

        Ok(request)
    }

    /// Spawns a detached dispatch task per destination. Returns the number of tasks.
    pub fn fan_out(&self, request: &Request<Bytes>, request_id: &RequestId) -> usize {
        let dispatches = self.dispatches(request, request_id);
        let count = dispatches.len();

        for dispatch in dispatches {
            tokio::spawn(dispatch.run());
        }

        count
    }

    /// Copies `request` to every destination while `next` handles it, and returns once
    /// both `next` and every copy have finished.
    ///
    /// Unlike [`RequestReplicator::replicate`] the caller waits for the copies. Their
    /// outcomes still only reach metrics and the failure log.
    pub async fn mirror<B, F, Fut, T>(
        &self,
        request: Request<B>,
        request_id: RequestId,
        next: F,
    ) -> Result<T>
    where
        B: Body,
        B::Error: std::fmt::Display,
        F: FnOnce(Request<Bytes>) -> Fut,
        Fut: Future<Output = T>,
    {
        let request = buffer_request(request).await?;

        let mut copies = JoinSet::new();
        for dispatch in self.dispatches(&request, &request_id) {
            copies.spawn(dispatch.run());
        }
        tracing::debug!(
            request_id = %request_id,
            destinations = copies.len(),
            "Mirroring write request"
        );

        let wait_for_copies = async {
            while let Some(result) = copies.join_next().await {
                if let Err(err) = result {
                    tracing::error!(request_id = %request_id, error = %err, "Mirror task failed");
                }
            }
        };
        let (output, ()) = tokio::join!(next(request), wait_for_copies);

        Ok(output)
    }

    fn dispatches(&self, request: &Request<Bytes>, request_id: &RequestId) -> Vec<Dispatch> {
        self.destinations(request.uri().path())
            .into_iter()
            .map(|destination| Dispatch {
                // Every destination gets its own header map
                headers: forwardable_headers(request.headers(), request.version()),
                body: request.body().clone(),
                destination,
                request_id: request_id.clone(),
                client: self.client.clone(),
                transports: self.transports.clone(),
                limiter: self.limiter.clone(),
                response_excerpt_bytes: self.response_excerpt_bytes,
                completions: self.completions.clone(),
            })
            .collect()
    }
}

/// Reads the whole body of `request` into memory.
async fn buffer_request<B>(request: Request<B>) -> Result<Request<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = request.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| RemoteWriteError::RequestBodyError(e.to_string()))?
        .to_bytes();

    Ok(Request::from_parts(parts, body))
}

/// URL of the primary write target for a request to `request_path`.
pub fn primary_url(base: &Url, request_path: &str) -> Url {
    let mut url = base.clone();
    url.set_path(&join_paths(base.path(), request_path));
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// Joins two absolute paths, dropping empty and `.` segments and resolving `..`.
pub fn join_paths(base: &str, path: &str) -> String {
    let mut segments = Vec::new();
    for segment in base.split('/').chain(path.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Everything a single replica needs, owned so it can outlive the inbound request.
struct Dispatch {
    destination: Destination,
    headers: HeaderMap,
    body: Bytes,
    request_id: RequestId,
    client: reqwest::Client,
    transports: TransportBuilder,
    limiter: ErrorRateLimiter,
    response_excerpt_bytes: usize,
    completions: Option<mpsc::UnboundedSender<DispatchOutcome>>,
}

impl Dispatch {
    async fn run(self) {
        let name = self.destination.name().to_string();
        let limiter = self.limiter.clone();
        let completions = self.completions.clone();

        let delivery = self.send().await;

        counter!(DELIVERIES, "code" => delivery.code_label(), "name" => name.clone()).increment(1);
        if delivery.is_success() {
            limiter.report_success(&name).await;
        }

        if let Some(tx) = completions {
            let _ = tx.send(DispatchOutcome {
                destination: name,
                delivery,
            });
        }
    }

    async fn send(self) -> Delivery {
        let client = match &self.destination.endpoint.tls_config {
            Some(tls) => match self.transports.build(tls).await {
                Ok(client) => client,
                Err(err) => {
                    let message = err.to_string();
                    self.report(TRANSPORT_FAILED, FailureContext {
                        error: Some(message.clone()),
                        ..self.context()
                    })
                    .await;
                    return Delivery::ConfigError(message);
                }
            },
            None => self.client.clone(),
        };

        let mut headers = self.headers.clone();
        let mut builder = client.post(self.destination.url.clone());
        if let Some(auth) = &self.destination.endpoint.basic_auth {
            headers.remove(AUTHORIZATION);
            builder = builder
                .headers(headers)
                .basic_auth(&auth.user, Some(&auth.password));
        } else {
            builder = builder.headers(headers);
        }

        let request = match builder.body(self.body.clone()).build() {
            Ok(request) => request,
            Err(err) => {
                let message = err.to_string();
                self.report(REQUEST_INVALID, FailureContext {
                    error: Some(message.clone()),
                    ..self.context()
                })
                .await;
                return Delivery::InvalidRequest(message);
            }
        };

        let response = match client.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                let message = err.to_string();
                self.report(SEND_FAILED, FailureContext {
                    error: Some(message.clone()),
                    ..self.context()
                })
                .await;
                return Delivery::NetworkError(message);
            }
        };

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                request_id = %self.request_id,
                name = self.destination.name(),
                url = %self.destination.url,
                "Metrics forwarded successfully"
            );
            return Delivery::Status(status.as_u16());
        }

        let context = FailureContext {
            status: Some(status.as_u16()),
            ..self.context()
        };
        match read_excerpt(response, self.response_excerpt_bytes).await {
            Ok(excerpt) => {
                self.report(FORWARD_FAILED, FailureContext {
                    response: Some(excerpt),
                    ..context
                })
                .await
            }
            Err(err) => {
                self.report(READ_FAILED, FailureContext {
                    error: Some(err.to_string()),
                    ..context
                })
                .await
            }
        }

        Delivery::Status(status.as_u16())
    }

    fn context(&self) -> FailureContext {
        FailureContext {
            request_id: Some(self.request_id.clone()),
            url: Some(self.destination.url.to_string()),
            ..Default::default()
        }
    }

    async fn report(&self, message: &'static str, context: FailureContext) {
        self.limiter
            .report_failure(FailureMessage {
                key: FailureKey {
                    source: self.destination.name().to_string(),
                    message,
                },
                context,
            })
            .await;
    }
}

/// Reads at most `limit` bytes of `response` as text.
async fn read_excerpt(mut response: reqwest::Response, limit: usize) -> Result<String, reqwest::Error> {
    let mut excerpt = Vec::new();
    while excerpt.len() < limit {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let take = chunk.len().min(limit - excerpt.len());
        excerpt.extend_from_slice(&chunk[..take]);
    }
    Ok(String::from_utf8_lossy(&excerpt).into_owned())
}
