//! Bidirectional streams.
//!
//! The same transport machinery as URL requests with a write-side API:
//! the application queues writes, marks end-of-stream, and reads the
//! response under the usual pull discipline. Writes are buffered until
//! end-of-stream; redirects are followed automatically.

use crate::base::neterror::NetError;
use crate::engine::executor::Executor;
use crate::request::callback::UrlRequestCallback;
use crate::request::job::{self, Command, RequestConfig, RequestContext, RequestShared};
use crate::request::response::UrlResponseInfo;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

/// Callbacks for a bidirectional stream. One terminal method fires.
pub trait BidirectionalStreamCallback: Send + Sync {
    /// The stream is ready for writes.
    fn on_stream_ready(&self);
    fn on_response_headers_received(&self, info: &UrlResponseInfo);
    fn on_read_completed(&self, info: &UrlResponseInfo, data: Bytes);
    /// A queued write was accepted.
    fn on_write_completed(&self, data: Bytes);
    fn on_succeeded(&self, info: &UrlResponseInfo);
    fn on_failed(&self, error: &NetError);
    fn on_canceled(&self);
}

pub struct BidirectionalStreamBuilder {
    ctx: Arc<RequestContext>,
    url: Url,
    method: String,
    headers: Vec<(String, String)>,
    executor: Arc<dyn Executor>,
    callback: Arc<dyn BidirectionalStreamCallback>,
}

impl BidirectionalStreamBuilder {
    pub(crate) fn new(
        ctx: Arc<RequestContext>,
        url: Url,
        executor: Arc<dyn Executor>,
        callback: Arc<dyn BidirectionalStreamCallback>,
    ) -> Self {
        Self {
            ctx,
            url,
            method: "POST".into(),
            headers: Vec::new(),
            executor,
            callback,
        }
    }

    pub fn http_method(mut self, method: &str) -> Self {
        self.method = method.to_uppercase();
        self
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn build(self) -> BidirectionalStream {
        BidirectionalStream {
            ctx: self.ctx,
            url: self.url,
            method: self.method,
            headers: self.headers,
            executor: self.executor,
            callback: self.callback,
            write_buffer: Mutex::new(BytesMut::new()),
            launched: Mutex::new(None),
        }
    }
}

struct Launched {
    shared: Arc<RequestShared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

pub struct BidirectionalStream {
    ctx: Arc<RequestContext>,
    url: Url,
    method: String,
    headers: Vec<(String, String)>,
    executor: Arc<dyn Executor>,
    callback: Arc<dyn BidirectionalStreamCallback>,
    write_buffer: Mutex<BytesMut>,
    launched: Mutex<Option<Launched>>,
}

impl BidirectionalStream {
    /// Announce readiness; writes may begin.
    pub fn start(&self) {
        let callback = Arc::clone(&self.callback);
        self.executor.execute(Box::new(move || {
            callback.on_stream_ready();
        }));
    }

    /// Queue request bytes. With `end_of_stream` the exchange launches.
    pub fn write(&self, data: Bytes, end_of_stream: bool) -> Result<(), NetError> {
        if self.launched.lock().unwrap().is_some() {
            return Err(NetError::InvalidArgument(
                "write after end of stream".into(),
            ));
        }
        self.write_buffer.lock().unwrap().extend_from_slice(&data);

        let callback = Arc::clone(&self.callback);
        let echoed = data.clone();
        self.executor.execute(Box::new(move || {
            callback.on_write_completed(echoed);
        }));

        if end_of_stream {
            self.launch()?;
        }
        Ok(())
    }

    /// Request the next chunk of response bytes.
    pub fn read(&self) {
        if let Some(launched) = self.launched.lock().unwrap().as_ref() {
            let _ = launched.cmd_tx.send(Command::Read);
        }
    }

    pub fn cancel(&self) {
        let mut launched = self.launched.lock().unwrap();
        match launched.as_ref() {
            Some(active) => {
                active.shared.cancel();
                let _ = active.cmd_tx.send(Command::Cancel);
            }
            None => {
                // Never launched: terminal callback straight away.
                *launched = Some(Launched {
                    shared: Arc::new(RequestShared::new()),
                    cmd_tx: mpsc::unbounded_channel().0,
                });
                let callback = Arc::clone(&self.callback);
                self.executor.execute(Box::new(move || {
                    callback.on_canceled();
                }));
            }
        }
    }

    fn launch(&self) -> Result<(), NetError> {
        let body = {
            let mut buffer = self.write_buffer.lock().unwrap();
            std::mem::take(&mut *buffer).freeze()
        };
        let config = RequestConfig {
            method: self.method.clone(),
            headers: self.headers.clone(),
            body,
            disable_cache: true,
            ..Default::default()
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RequestShared::new());
        let adapter: Arc<dyn UrlRequestCallback> = Arc::new(BidiAdapter {
            callback: Arc::clone(&self.callback),
            cmd_tx: cmd_tx.clone(),
        });

        self.ctx.in_flight.fetch_add(1, Ordering::SeqCst);
        self.ctx.runner_handle.spawn(job::run(
            Arc::clone(&self.ctx),
            config,
            self.url.clone(),
            Arc::clone(&shared),
            adapter,
            Arc::clone(&self.executor),
            cmd_rx,
        ));

        *self.launched.lock().unwrap() = Some(Launched { shared, cmd_tx });
        Ok(())
    }
}

/// Bridges the request job's callback surface to the bidirectional one.
struct BidiAdapter {
    callback: Arc<dyn BidirectionalStreamCallback>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl UrlRequestCallback for BidiAdapter {
    fn on_redirect_received(&self, _info: &UrlResponseInfo, _new_url: &Url) {
        // Bidirectional exchanges follow redirects without surfacing.
        let _ = self.cmd_tx.send(Command::FollowRedirect);
    }

    fn on_response_started(&self, info: &UrlResponseInfo) {
        self.callback.on_response_headers_received(info);
    }

    fn on_read_completed(&self, info: &UrlResponseInfo, data: Bytes) {
        self.callback.on_read_completed(info, data);
    }

    fn on_succeeded(&self, info: &UrlResponseInfo) {
        self.callback.on_succeeded(info);
    }

    fn on_failed(&self, _info: Option<&UrlResponseInfo>, error: &NetError) {
        self.callback.on_failed(error);
    }

    fn on_canceled(&self, _info: Option<&UrlResponseInfo>) {
        self.callback.on_canceled();
    }
}
