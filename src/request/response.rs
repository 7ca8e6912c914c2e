//! Response snapshots and per-request timing metrics.

use std::time::Duration;
use url::Url;

/// Immutable view of a response, delivered with callbacks. Safe to hold
/// across threads; it never refers back into engine state.
#[derive(Debug, Clone)]
pub struct UrlResponseInfo {
    /// Every URL in the chain, original first, final last.
    pub url_chain: Vec<Url>,
    pub status_code: u16,
    pub status_text: String,
    /// Response headers in wire order.
    pub headers: Vec<(String, String)>,
    /// "http/1.1", "h2", "h3", or "cached".
    pub negotiated_protocol: String,
    pub was_cached: bool,
    /// Body bytes delivered so far (final at terminal callbacks).
    pub received_byte_count: u64,
}

impl UrlResponseInfo {
    pub fn url(&self) -> &Url {
        self.url_chain.last().expect("chain is never empty")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Per-request timings, reported to request-finished listeners.
#[derive(Debug, Clone, Default)]
pub struct RequestMetrics {
    pub dns_duration: Option<Duration>,
    pub connect_duration: Option<Duration>,
    /// Request start to first header byte.
    pub time_to_first_byte: Option<Duration>,
    pub total_duration: Option<Duration>,
    pub sent_byte_count: u64,
    pub received_byte_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_case_insensitive() {
        let info = UrlResponseInfo {
            url_chain: vec![Url::parse("http://example/echo").unwrap()],
            status_code: 200,
            status_text: "OK".into(),
            headers: vec![("Content-Type".into(), "text/plain".into())],
            negotiated_protocol: "http/1.1".into(),
            was_cached: false,
            received_byte_count: 0,
        };
        assert_eq!(info.header("content-type"), Some("text/plain"));
        assert_eq!(info.header("missing"), None);
        assert_eq!(info.url().as_str(), "http://example/echo");
    }
}
