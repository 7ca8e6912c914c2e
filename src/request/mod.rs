//! URL requests: the application-facing request handle, its builder,
//! and the job that drives the transaction.

pub mod bidi;
pub mod callback;
pub mod decode;
pub mod job;
pub mod response;
pub mod state;

pub use bidi::{BidirectionalStream, BidirectionalStreamBuilder, BidirectionalStreamCallback};
pub use callback::{
    FinishedReason, RequestFinishedInfo, RequestFinishedListener, UrlRequestCallback,
};
pub use response::{RequestMetrics, UrlResponseInfo};
pub use state::RequestState;

use crate::base::neterror::NetError;
use crate::engine::executor::Executor;
use crate::pool::RequestPriority;
use crate::request::job::{Command, RequestConfig, RequestContext, RequestShared};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

/// Builder for a [`UrlRequest`]. Obtained from the engine.
pub struct UrlRequestBuilder {
    ctx: Arc<RequestContext>,
    url: Url,
    config: RequestConfig,
    executor: Arc<dyn Executor>,
    callback: Arc<dyn UrlRequestCallback>,
}

impl UrlRequestBuilder {
    pub(crate) fn new(
        ctx: Arc<RequestContext>,
        url: Url,
        executor: Arc<dyn Executor>,
        callback: Arc<dyn UrlRequestCallback>,
    ) -> Self {
        Self {
            ctx,
            url,
            config: RequestConfig::default(),
            executor,
            callback,
        }
    }

    pub fn http_method(mut self, method: &str) -> Self {
        self.config.method = method.to_uppercase();
        self
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.config
            .headers
            .push((name.to_string(), value.to_string()));
        self
    }

    /// Attach a request body (buffered).
    pub fn upload(mut self, body: Bytes) -> Self {
        self.config.body = body;
        self
    }

    pub fn priority(mut self, priority: RequestPriority) -> Self {
        self.config.priority = priority;
        self
    }

    pub fn disable_cache(mut self) -> Self {
        self.config.disable_cache = true;
        self
    }

    /// Forbid HTTP/3 for this request even when the origin is hinted.
    pub fn disallow_http3(mut self) -> Self {
        self.config.is_http3_acceptable = false;
        self
    }

    pub fn build(self) -> UrlRequest {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        UrlRequest {
            ctx: self.ctx,
            url: self.url,
            shared: Arc::new(RequestShared::new()),
            cmd_tx,
            staged: Mutex::new(Some(Staged {
                config: self.config,
                executor: self.executor,
                callback: self.callback,
                cmd_rx,
            })),
        }
    }
}

struct Staged {
    config: RequestConfig,
    executor: Arc<dyn Executor>,
    callback: Arc<dyn UrlRequestCallback>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

/// An in-flight (or not yet started) URL request. All methods are safe
/// to call from any thread.
pub struct UrlRequest {
    ctx: Arc<RequestContext>,
    url: Url,
    shared: Arc<RequestShared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    staged: Mutex<Option<Staged>>,
}

impl UrlRequest {
    /// Begin the request. Invoking twice is an error.
    pub fn start(&self) -> Result<(), NetError> {
        let Some(staged) = self.staged.lock().unwrap().take() else {
            return Err(NetError::InvalidArgument("request already started".into()));
        };
        self.ctx.in_flight.fetch_add(1, Ordering::SeqCst);
        let ctx = Arc::clone(&self.ctx);
        let shared = Arc::clone(&self.shared);
        let url = self.url.clone();
        self.ctx.runner_handle.spawn(job::run(
            ctx,
            staged.config,
            url,
            shared,
            staged.callback,
            staged.executor,
            staged.cmd_rx,
        ));
        Ok(())
    }

    /// Continue past a redirect announced via `on_redirect_received`.
    pub fn follow_redirect(&self) {
        let _ = self.cmd_tx.send(Command::FollowRedirect);
    }

    /// Request the next chunk of body bytes.
    pub fn read(&self) {
        let _ = self.cmd_tx.send(Command::Read);
    }

    /// Cancel; the terminal callback collapses to `on_canceled`.
    pub fn cancel(&self) {
        self.shared.cancel();
        let _ = self.cmd_tx.send(Command::Cancel);
    }

    pub fn state(&self) -> RequestState {
        self.shared.state.state()
    }

    /// Coarse progress phase for UI surfaces.
    pub fn load_state(&self) -> crate::base::LoadState {
        self.state().to_load_state()
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.is_terminal()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}
