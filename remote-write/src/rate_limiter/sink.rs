use super::FailureMessage;

/// Destination of failure log lines that made it past the rate limiter.
pub trait LogSink: Send + Sync + 'static {
    fn error(&self, message: &str, failure: &FailureMessage);
}

/// Writes failures as structured `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn error(&self, message: &str, failure: &FailureMessage) {
        let context = &failure.context;
        tracing::error!(
            request_id = context.request_id.as_ref().map(|id| id.as_str()),
            name = failure.key.source.as_str(),
            url = context.url.as_deref(),
            status = context.status,
            response = context.response.as_deref(),
            error = context.error.as_deref(),
            "{message}"
        );
    }
}
