//! Request callback contract.
//!
//! Exactly one terminal method (`on_succeeded`, `on_failed`,
//! `on_canceled`) is invoked per request, on the request's executor, in
//! the order the events were produced.

use crate::base::neterror::NetError;
use crate::request::response::{RequestMetrics, UrlResponseInfo};
use bytes::Bytes;
use url::Url;

/// Callbacks driving a `UrlRequest`.
///
/// Flow control is pull-based: after `on_response_started` (and after
/// every `on_read_completed`) the request sits idle until the
/// application calls `read()` again. During `on_redirect_received` the
/// application chooses between `follow_redirect()` and `read()` (treat
/// the redirect response itself as final).
pub trait UrlRequestCallback: Send + Sync {
    /// A redirect arrived; `new_url` is the resolved Location target.
    fn on_redirect_received(&self, info: &UrlResponseInfo, new_url: &Url);

    /// Final response headers are in.
    fn on_response_started(&self, info: &UrlResponseInfo);

    /// One chunk of body bytes, in network order.
    fn on_read_completed(&self, info: &UrlResponseInfo, data: Bytes);

    fn on_succeeded(&self, info: &UrlResponseInfo);

    fn on_failed(&self, info: Option<&UrlResponseInfo>, error: &NetError);

    fn on_canceled(&self, info: Option<&UrlResponseInfo>);
}

/// Engine-wide observer of finished requests (terminal state plus
/// metrics), registered on the engine.
pub trait RequestFinishedListener: Send + Sync {
    fn on_request_finished(&self, info: &RequestFinishedInfo);
}

/// Snapshot delivered to `RequestFinishedListener`s.
#[derive(Debug, Clone)]
pub struct RequestFinishedInfo {
    pub url: Url,
    pub finished_reason: FinishedReason,
    pub response_info: Option<UrlResponseInfo>,
    pub error_code: Option<i32>,
    pub metrics: RequestMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedReason {
    Succeeded,
    Failed,
    Canceled,
}
