use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use remote_write::config::Config;
use remote_write::rate_limiter::{ErrorRateLimiter, FailureMessage, LogSink};
use remote_write::replicator::{DispatchOutcome, RequestReplicator};
use remote_write::service::RemoteWriteService;
use shared::http::serve_listener;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Default)]
struct CollectingSink {
    messages: Mutex<Vec<String>>,
}

impl LogSink for CollectingSink {
    fn error(&self, message: &str, _failure: &FailureMessage) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

#[derive(Clone)]
struct Backend {
    status: StatusCode,
    bodies: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl Service<Request<Incoming>> for Backend {
    type Response = Response<BoxBody<Bytes, io::Error>>;
    type Error = io::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let backend = self.clone();
        Box::pin(async move {
            let path = req.uri().path().to_string();
            let body = req
                .into_body()
                .collect()
                .await
                .map_err(io::Error::other)?
                .to_bytes();
            backend.bodies.lock().unwrap().push((path, body));

            let mut response = Response::new(
                Full::new(Bytes::from_static(b"out of order sample"))
                    .map_err(|e| match e {})
                    .boxed(),
            );
            *response.status_mut() = backend.status;
            Ok(response)
        })
    }
}

async fn start_backend(status: StatusCode) -> (SocketAddr, Backend) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let backend = Backend {
        status,
        bodies: Arc::default(),
    };
    tokio::spawn(serve_listener(listener, backend.clone()));
    (addr, backend)
}

#[tokio::test]
async fn test_fan_out_with_suppressed_failures() {
    let (healthy_addr, healthy) = start_backend(StatusCode::OK).await;
    let (flaky_addr, flaky) = start_backend(StatusCode::BAD_REQUEST).await;
    let (primary_addr, primary) = start_backend(StatusCode::NO_CONTENT).await;

    let yaml = format!(
        r#"
        listener:
            host: 127.0.0.1
            port: 8080
        admin_listener:
            host: 127.0.0.1
            port: 8081
        primary_write_url: http://{primary_addr}/store
        endpoints:
            - name: healthy
              url: http://{healthy_addr}/api/v1/push
            - name: flaky
              url: http://{flaky_addr}/api/v1/push
        error_log:
            workers: 2
            threshold: 2
            interval: 10m
        "#
    );
    let config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.validate().unwrap();

    let sink = Arc::new(CollectingSink::default());
    let (limiter, workers) = ErrorRateLimiter::spawn(&config.error_log, sink.clone());
    let (tx, mut outcomes) = mpsc::unbounded_channel::<DispatchOutcome>();
    let replicator = RequestReplicator::new(&config, limiter)
        .unwrap()
        .with_completion_notifier(tx);
    let service = RemoteWriteService::new(replicator, &config.receive_path);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_listener(listener, service));

    let client = reqwest::Client::new();
    for i in 0..5 {
        let response = client
            .post(format!("http://{gateway_addr}/api/v1/receive"))
            .body(format!("write-{i}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    for _ in 0..15 {
        tokio::time::timeout(Duration::from_secs(10), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
    }

    for backend in [&healthy, &flaky, &primary] {
        let mut bodies: Vec<Bytes> = backend
            .bodies
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect();
        bodies.sort();
        let expected: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("write-{i}"))).collect();
        assert_eq!(bodies, expected);
    }
    assert_eq!(primary.bodies.lock().unwrap()[0].0, "/store/api/v1/receive");
    assert_eq!(healthy.bodies.lock().unwrap()[0].0, "/api/v1/push");

    // Stop the workers so they flush their pending summaries
    drop(client);
    server.abort();
    tokio::time::timeout(Duration::from_secs(10), workers.shutdown())
        .await
        .unwrap();

    let messages = sink.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 2, "{messages:?}");
    assert_eq!(messages[0], "Failed to forward metrics");
    assert!(messages[1].starts_with("Error occurred 4 times in last"));
    assert!(messages[1].ends_with(": Failed to forward metrics"));
}
