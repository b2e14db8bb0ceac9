use crate::rate_limiter::{FailureMessage, LogSink};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::HeaderMap;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use shared::http::serve_listener;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig, crypto};

/// Path of a PEM file under `tests/fixtures`.
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Log sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<(String, FailureMessage)>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<(String, FailureMessage)> {
        self.records.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records().into_iter().map(|(message, _)| message).collect()
    }
}

impl LogSink for RecordingSink {
    fn error(&self, message: &str, failure: &FailureMessage) {
        self.records
            .lock()
            .unwrap()
            .push((message.to_string(), failure.clone()));
    }
}

#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Local HTTP server that records requests and answers with a fixed status.
pub struct TestBackend {
    scheme: &'static str,
    addr: SocketAddr,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    handle: JoinHandle<io::Result<()>>,
}

impl TestBackend {
    pub async fn start(status: StatusCode) -> Self {
        Self::with_body(status, "").await
    }

    pub async fn with_body(status: StatusCode, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let service = BackendService {
            status,
            body,
            received: received.clone(),
        };
        let handle = tokio::spawn(serve_listener(listener, service));

        TestBackend {
            scheme: "http",
            addr,
            received,
            handle,
        }
    }

    /// HTTPS backend presenting the fixture `cert` / `key` pair. Clients must present a
    /// certificate signed by the fixture CA.
    pub async fn start_tls(status: StatusCode, cert: &str, key: &str) -> Self {
        let provider = Arc::new(crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for ca in CertificateDer::pem_file_iter(fixture("ca.pem")).unwrap() {
            roots.add(ca.unwrap()).unwrap();
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .unwrap();

        let chain = CertificateDer::pem_file_iter(fixture(cert))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let key = PrivateKeyDer::from_pem_file(fixture(key)).unwrap();
        let tls = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let service = BackendService {
            status,
            body: "",
            received: received.clone(),
        };
        let handle = tokio::spawn(serve_tls(listener, TlsAcceptor::from(Arc::new(tls)), service));

        TestBackend {
            scheme: "https",
            addr,
            received,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.addr, path)
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    service: BackendService,
) -> io::Result<()> {
    let service = Arc::new(service);

    loop {
        let (stream, _) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let service = service.clone();

        tokio::spawn(async move {
            // A rejected handshake just closes the socket
            let Ok(stream) = acceptor.accept(stream).await else {
                return;
            };
            let _ = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

struct BackendService {
    status: StatusCode,
    body: &'static str,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl Service<Request<Incoming>> for BackendService {
    type Response = Response<BoxBody<Bytes, io::Error>>;
    type Error = io::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let status = self.status;
        let body = self.body;
        let received = self.received.clone();

        Box::pin(async move {
            let (parts, incoming) = req.into_parts();
            let bytes = incoming.collect().await.map_err(io::Error::other)?.to_bytes();
            received.lock().unwrap().push(ReceivedRequest {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                headers: parts.headers,
                body: bytes,
            });

            let mut response = Response::new(
                Full::new(Bytes::from_static(body.as_bytes()))
                    .map_err(|e| match e {})
                    .boxed(),
            );
            *response.status_mut() = status;
            Ok(response)
        })
    }
}

/// Request body whose first read fails.
pub struct FailingBody;

impl Body for FailingBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(Some(Err(io::Error::other("connection reset by peer"))))
    }
}

static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();

/// Installs a process wide debugging recorder on first use.
///
/// Tests share the recorder, so they must use metric labels nobody else uses.
pub fn metrics_snapshotter() -> &'static Snapshotter {
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("another metrics recorder is already installed");
        snapshotter
    })
}

/// Current value of the counter `name` with exactly `labels`, 0 if never incremented.
pub fn counter_value(name: &str, labels: &[(&str, &str)]) -> u64 {
    metrics_snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .find_map(|(composite, _, _, value)| {
            let key = composite.key();
            let matches = key.name() == name
                && key.labels().count() == labels.len()
                && labels
                    .iter()
                    .all(|(k, v)| key.labels().any(|l| l.key() == *k && l.value() == *v));
            match (matches, value) {
                (true, DebugValue::Counter(value)) => Some(value),
                _ => None,
            }
        })
        .unwrap_or(0)
}
