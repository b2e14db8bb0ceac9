//! Rate limiting of repeated failure logs.
//!
//! Failure events are spread over a fixed pool of workers. Each worker owns one
//! [`SuppressionCounter`] and decides, event by event, whether a failure is logged,
//! silently counted, or folded into a periodic summary. All events of one source land
//! on the same worker, so they are observed in delivery order without any locking.

mod counter;
mod sink;

pub use counter::{SuppressionCounter, SuppressionState, Verdict};
pub use sink::{LogSink, TracingSink};

use crate::config::ErrorLogConfig;
use crate::metrics_defs::SUPPRESSED_ERRORS;
use crate::request_id::RequestId;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

const CHANNEL_CAPACITY: usize = 64;

/// Stable identity of a failure: which source failed, and how.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FailureKey {
    /// Destination name
    pub source: String,
    /// Log message template
    pub message: &'static str,
}

/// Details logged alongside a failure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailureContext {
    pub request_id: Option<RequestId>,
    pub url: Option<String>,
    pub status: Option<u16>,
    pub response: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureMessage {
    pub key: FailureKey,
    pub context: FailureContext,
}

#[derive(Debug)]
enum LimiterEvent {
    Failure(FailureMessage),
    Success { source: String },
}

/// Handle used to submit events. Cheap to clone.
///
/// Workers exit once every handle has been dropped and their queues are drained.
#[derive(Clone)]
pub struct ErrorRateLimiter {
    senders: Arc<[mpsc::Sender<LimiterEvent>]>,
    sink: Arc<dyn LogSink>,
}

/// Join handles of the worker tasks.
pub struct LimiterWorkers {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl LimiterWorkers {
    /// Waits for every worker to exit. Workers only exit on their own once every
    /// [`ErrorRateLimiter`] handle is gone.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Error log worker panicked");
            }
        }
    }

    /// Stops the workers while handles may still be alive. Queued events are processed
    /// and pending summaries are flushed first. Failures reported afterwards go to the
    /// sink unfiltered.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.join().await;
    }
}

impl ErrorRateLimiter {
    /// Spawns `config.workers` workers on the current runtime.
    pub fn spawn(config: &ErrorLogConfig, sink: Arc<dyn LogSink>) -> (Self, LimiterWorkers) {
        let workers = config.workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        let (shutdown, shutdown_rx) = watch::channel(false);

        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            let worker = Worker {
                rx,
                shutdown: shutdown_rx.clone(),
                counter: SuppressionCounter::new(config.threshold, config.interval),
                interval: config.interval,
                sink: sink.clone(),
                last_failure: None,
            };
            senders.push(tx);
            handles.push(tokio::spawn(worker.run()));
        }

        tracing::debug!(
            workers,
            threshold = config.threshold,
            interval_secs = config.interval.as_secs(),
            "Started error log workers"
        );

        let limiter = ErrorRateLimiter {
            senders: senders.into(),
            sink,
        };
        (limiter, LimiterWorkers { handles, shutdown })
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Submits a failure. If its worker is gone the failure is logged unfiltered.
    pub async fn report_failure(&self, message: FailureMessage) {
        let sender = self.sender_for(&message.key.source);
        if let Err(mpsc::error::SendError(event)) = sender.send(LimiterEvent::Failure(message)).await
            && let LimiterEvent::Failure(message) = event
        {
            self.sink.error(message.key.message, &message);
        }
    }

    /// Tells the worker owning `source` that a delivery to it succeeded.
    pub async fn report_success(&self, source: &str) {
        let event = LimiterEvent::Success {
            source: source.to_string(),
        };
        if self.sender_for(source).send(event).await.is_err() {
            tracing::debug!(source, "Error log worker is gone, dropping success signal");
        }
    }

    fn sender_for(&self, source: &str) -> &mpsc::Sender<LimiterEvent> {
        &self.senders[partition(source, self.senders.len())]
    }
}

/// Worker index for `source`, stable across processes and builds.
pub fn partition(source: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    (fnv1a(source.as_bytes()) % workers as u64) as usize
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(data: &[u8]) -> u64 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

struct Worker {
    rx: mpsc::Receiver<LimiterEvent>,
    shutdown: watch::Receiver<bool>,
    counter: SuppressionCounter,
    interval: Duration,
    sink: Arc<dyn LogSink>,
    // Latest failure of the tracked key, reused as the context of summaries
    last_failure: Option<FailureMessage>,
}

impl Worker {
    async fn run(mut self) {
        // Dropping LimiterWorkers without calling shutdown leaves the workers running
        let mut controlled = true;

        loop {
            tokio::select! {
                biased;
                event = timeout(self.interval, self.rx.recv()) => match event {
                    Ok(Some(event)) => self.handle(event),
                    Ok(None) => break,
                    Err(_idle) => {
                        let verdict = self.counter.on_idle(Instant::now());
                        self.apply(verdict);
                    }
                },
                changed = self.shutdown.changed(), if controlled => match changed {
                    Ok(()) if *self.shutdown.borrow() => {
                        while let Ok(event) = self.rx.try_recv() {
                            self.handle(event);
                        }
                        break;
                    }
                    Ok(()) => {}
                    Err(_) => controlled = false,
                },
            }
        }

        // Flush a pending summary before going away
        let verdict = self.counter.on_idle(Instant::now());
        self.apply(verdict);
    }

    fn handle(&mut self, event: LimiterEvent) {
        match event {
            LimiterEvent::Failure(message) => self.on_failure(message),
            LimiterEvent::Success { source } => {
                if self.counter.on_success(&source) {
                    tracing::trace!(source, "Cleared failure suppression");
                }
            }
        }
    }

    fn on_failure(&mut self, message: FailureMessage) {
        let verdict = self.counter.on_failure(&message.key, Instant::now());
        self.last_failure = Some(message);
        self.apply(verdict);
    }

    fn apply(&self, verdict: Verdict) {
        let Some(failure) = &self.last_failure else {
            return;
        };

        match verdict {
            Verdict::Emit => self.sink.error(failure.key.message, failure),
            Verdict::Suppress => {
                counter!(SUPPRESSED_ERRORS, "name" => failure.key.source.clone()).increment(1);
            }
            Verdict::Summary {
                occurrences,
                elapsed,
            } => {
                let summary = format!(
                    "Error occurred {occurrences} times in last {} seconds: {}",
                    elapsed.as_secs(),
                    failure.key.message
                );
                self.sink.error(&summary, failure);
            }
            Verdict::Ignore => {}
        }
    }
}
