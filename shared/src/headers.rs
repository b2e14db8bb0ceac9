// Header hygiene for requests that are re-sent to another server. Hop-by-hop headers
// describe the inbound connection only, and Host/Content-Length are recomputed by the
// outbound client.

use http::Version;
use http::header::{
    CONNECTION, CONTENT_LENGTH, HOST, HeaderMap, HeaderName, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

pub fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

// For HTTP/1.x connections, hop-by-hop headers are removed before forwarding:
// - standard hop-by-hop headers
// - any extra headers listed in the Connection header value
// - keep-alive header for HTTP/0.9 and HTTP/1.0 only
//
// HTTP/2 and HTTP/3 don't use hop-by-hop headers, so no filtering is performed.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if !is_http1(version) {
        return headers;
    }

    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP_NAMES.iter().chain(listed.iter()) {
        headers.remove(name);
    }

    if matches!(version, Version::HTTP_09 | Version::HTTP_10) {
        headers.remove(HeaderName::from_static("keep-alive"));
    }

    headers
}

/// Returns an owned copy of `headers` that is safe to attach to an outbound request.
///
/// The source map is never modified, so each destination of a fan-out gets its own
/// copy to mutate.
pub fn forwardable_headers(headers: &HeaderMap, version: Version) -> HeaderMap {
    let mut forwarded = headers.clone();
    filter_hop_by_hop(&mut forwarded, version);
    forwarded.remove(HOST);
    forwarded.remove(CONTENT_LENGTH);
    forwarded
}
