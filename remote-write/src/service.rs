use crate::errors::RemoteWriteError;
use crate::metrics_defs::REQUESTS;
use crate::replicator::RequestReplicator;
use crate::request_id::{REQUEST_ID_HEADER, RequestIdGenerator};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::counter;
use shared::http::{make_boxed_error_response, make_empty_response};
use std::pin::Pin;
use std::sync::Arc;

/// Accepts remote write requests and hands them to the [`RequestReplicator`].
///
/// Callers get an empty 200 as soon as the body has been buffered and the replicas
/// have been started. They never learn how the destinations answered. With an exporter,
/// the answer additionally waits until every export copy has finished.
pub struct RemoteWriteService {
    replicator: Arc<RequestReplicator>,
    exporter: Option<Arc<RequestReplicator>>,
    receive_path: Arc<str>,
    request_ids: Arc<RequestIdGenerator>,
}

impl RemoteWriteService {
    pub fn new(replicator: RequestReplicator, receive_path: &str) -> Self {
        Self::with_request_ids(replicator, receive_path, RequestIdGenerator::new())
    }

    pub fn with_request_ids(
        replicator: RequestReplicator,
        receive_path: &str,
        request_ids: RequestIdGenerator,
    ) -> Self {
        RemoteWriteService {
            replicator: Arc::new(replicator),
            exporter: None,
            receive_path: receive_path.into(),
            request_ids: Arc::new(request_ids),
        }
    }

    /// Mirrors every write through `exporter` around the regular fan-out.
    pub fn with_exporter(mut self, exporter: RequestReplicator) -> Self {
        self.exporter = Some(Arc::new(exporter));
        self
    }
}

impl Service<Request<Incoming>> for RemoteWriteService {
    type Response = Response<BoxBody<Bytes, Self::Error>>;
    type Error = RemoteWriteError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let replicator = self.replicator.clone();
        let exporter = self.exporter.clone();
        let receive_path = self.receive_path.clone();
        let request_ids = self.request_ids.clone();

        Box::pin(async move {
            if req.uri().path() != &*receive_path {
                return Ok(make_boxed_error_response(StatusCode::NOT_FOUND));
            }

            counter!(REQUESTS, "method" => req.method().to_string()).increment(1);
            if req.method() != Method::POST {
                return Ok(make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED));
            }

            let request_id = request_ids.for_headers(req.headers());
            let result = match exporter {
                Some(exporter) => {
                    let id = request_id.clone();
                    exporter
                        .mirror(req, request_id.clone(), move |request| async move {
                            replicator.fan_out(&request, &id);
                        })
                        .await
                }
                None => replicator.replicate(req, request_id.clone()).await.map(|_| ()),
            };

            let response = match result {
                Ok(()) => make_empty_response(StatusCode::OK),
                Err(err) => {
                    tracing::error!(request_id = %request_id, error = %err, "Failed to replicate request");
                    make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            };

            Ok(with_request_id(response, request_id.as_str()))
        })
    }
}

fn with_request_id<B>(mut response: Response<B>, request_id: &str) -> Response<B> {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), value);
    }
    response
}
