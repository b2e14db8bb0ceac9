//! Request correlation ids attached to every log line of a request.

use hyper::HeaderMap;
use hyper::header::HeaderName;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Cheap to clone; shared by every dispatch task of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(Arc<str>);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId(Arc::from(value))
    }
}

/// Hands out ids of the form `<prefix>-<sequence>` unless the caller supplied one.
pub struct RequestIdGenerator {
    prefix: String,
    sequence: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seed = (started as u64) ^ u64::from(std::process::id()).rotate_left(32);

        Self::with_prefix(format!("{seed:016x}"))
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        RequestIdGenerator {
            prefix: prefix.into(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Reuses a non-empty, printable `x-request-id` header or generates a new id.
    pub fn for_headers(&self, headers: &HeaderMap) -> RequestId {
        headers
            .get(&REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(RequestId::from)
            .unwrap_or_else(|| self.next())
    }

    fn next(&self) -> RequestId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId::from(format!("{}-{sequence:06}", self.prefix).as_str())
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
