//! Request job: drives one URL request from resolution to terminal
//! callback.
//!
//! The job runs on the engine's network task. The application's handle
//! feeds it commands (`follow_redirect`, `read`, `cancel`); callbacks go
//! out through the request's executor. Cancellation is observed at
//! every suspension point and collapses to a single `on_canceled`.

use crate::base::netlog::{NetLog, NetLogEventType};
use crate::base::neterror::NetError;
use crate::base::network::NetworkBinding;
use crate::cache::{CacheEntry, CacheLookup, HttpCache};
use crate::dns::{AddressFamily, Origin, StaleHostResolver};
use crate::engine::executor::Executor;
use crate::pool::{
    HttpStream, OutboundBody, PrivacyMode, RequestPriority, SessionKey, SessionPool,
};
use crate::quic::{H3Body, H3RequestParts, H3Stream, ResponseHead};
use crate::request::callback::{
    FinishedReason, RequestFinishedInfo, RequestFinishedListener, UrlRequestCallback,
};
use crate::request::decode::decode_body;
use crate::request::response::{RequestMetrics, UrlResponseInfo};
use crate::request::state::{RequestState, RequestStateMachine};
use bytes::Bytes;
use http_body_util::BodyExt;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use url::Url;

/// Default redirect cap.
pub const DEFAULT_MAX_REDIRECTS: u32 = 20;

/// Transparent retries per transaction.
const MAX_TRANSPARENT_RETRIES: u32 = 3;

/// Commands from the application's request handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    FollowRedirect,
    Read,
    Cancel,
}

/// Engine internals a job needs; one per engine, shared by all jobs.
pub struct RequestContext {
    pub resolver: Arc<StaleHostResolver>,
    pub pool: Arc<SessionPool>,
    pub cache: Arc<HttpCache>,
    pub netlog: Arc<NetLog>,
    pub user_agent: String,
    pub enable_brotli: bool,
    pub max_redirects: u32,
    pub request_timeout: Option<Duration>,
    pub bound_network: Arc<Mutex<NetworkBinding>>,
    pub listeners: Arc<Mutex<Vec<Arc<dyn RequestFinishedListener>>>>,
    pub in_flight: Arc<AtomicUsize>,
    pub runner_handle: tokio::runtime::Handle,
}

/// Per-request configuration from the builder.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub priority: RequestPriority,
    pub disable_cache: bool,
    pub is_http3_acceptable: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            headers: Vec::new(),
            body: Bytes::new(),
            priority: RequestPriority::Medium,
            disable_cache: false,
            is_http3_acceptable: true,
        }
    }
}

/// State shared between the application handle and the job.
pub struct RequestShared {
    pub state: RequestStateMachine,
    pub canceled: AtomicBool,
    pub cancel_notify: Notify,
    terminal_sent: AtomicBool,
}

impl RequestShared {
    pub fn new() -> Self {
        Self {
            state: RequestStateMachine::new(),
            canceled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            terminal_sent: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
    }

    /// Claims the single terminal-callback slot.
    fn claim_terminal(&self) -> bool {
        !self.terminal_sent.swap(true, Ordering::SeqCst)
    }
}

impl Default for RequestShared {
    fn default() -> Self {
        Self::new()
    }
}

struct Canceled;

/// Everything that flows out of one network transaction.
enum NetResponse {
    Hyper {
        parts: http::response::Parts,
        body: hyper::body::Incoming,
        /// H1 connection to return to the pool when the body is done.
        h1: Option<crate::pool::h1::H1Connection>,
        /// Keeps the H2 stream permit alive while reading.
        h2: Option<crate::h2session::H2Stream>,
    },
    H3 {
        head: ResponseHead,
        body: H3Body,
        stream: H3Stream,
    },
}

impl NetResponse {
    fn status(&self) -> u16 {
        match self {
            NetResponse::Hyper { parts, .. } => parts.status.as_u16(),
            NetResponse::H3 { head, .. } => head.status,
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        match self {
            NetResponse::Hyper { parts, .. } => parts
                .headers
                .iter()
                .map(|(n, v)| {
                    (
                        n.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            NetResponse::H3 { head, .. } => head.headers.clone(),
        }
    }

    fn negotiated_protocol(&self) -> &'static str {
        match self {
            NetResponse::Hyper { h2: Some(_), .. } => "h2",
            NetResponse::Hyper { .. } => "http/1.1",
            NetResponse::H3 { .. } => "h3",
        }
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes, NetError>> {
        match self {
            NetResponse::Hyper { body, .. } => loop {
                match body.frame().await {
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) => return Some(Ok(data)),
                        Err(_) => continue, // trailers
                    },
                    Some(Err(_)) => return Some(Err(NetError::ConnectionReset)),
                    None => return None,
                }
            },
            NetResponse::H3 { body, .. } => body.data().await,
        }
    }

    /// Release transport resources; `reusable` only matters for H1.
    fn finish(self, pool: &SessionPool, reusable: bool) {
        match self {
            NetResponse::Hyper { h1: Some(conn), .. } => pool.release_h1(conn, reusable),
            NetResponse::Hyper { h2: Some(h2), .. } => h2.mark_body_complete(),
            NetResponse::Hyper { .. } => {}
            NetResponse::H3 { stream, .. } => stream.mark_body_complete(),
        }
    }
}

/// Run one request to its terminal callback.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    ctx: Arc<RequestContext>,
    config: RequestConfig,
    url: Url,
    shared: Arc<RequestShared>,
    callback: Arc<dyn UrlRequestCallback>,
    executor: Arc<dyn Executor>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let job = Job {
        ctx,
        config,
        shared,
        callback,
        executor,
        started_at: Instant::now(),
        metrics: RequestMetrics::default(),
        url_chain: vec![url],
        visited: HashSet::new(),
        received: 0,
    };
    job.run(&mut cmd_rx).await;
}

struct Job {
    ctx: Arc<RequestContext>,
    config: RequestConfig,
    shared: Arc<RequestShared>,
    callback: Arc<dyn UrlRequestCallback>,
    executor: Arc<dyn Executor>,
    started_at: Instant,
    metrics: RequestMetrics,
    url_chain: Vec<Url>,
    visited: HashSet<String>,
    received: u64,
}

impl Job {
    async fn run(mut self, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) {
        let outcome = match self.ctx.request_timeout {
            Some(limit) => {
                let headers_phase = self.run_inner(cmd_rx);
                tokio::pin!(headers_phase);
                match tokio::time::timeout(limit, &mut headers_phase).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(NetError::TimedOut),
                }
            }
            None => self.run_inner(cmd_rx).await,
        };

        match outcome {
            Ok(()) => {}
            Err(err) => self.finish_failed(err),
        }
        self.ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// The whole request flow; `Ok(())` means a terminal callback was
    /// already delivered.
    async fn run_inner(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), NetError> {
        self.ctx.netlog.add_sensitive_event(
            NetLogEventType::RequestStarted,
            Some("request"),
            serde_json::json!({"url": self.current_url().as_str(), "method": self.config.method}),
        );

        let mut redirects = 0u32;
        self.visited.insert(self.current_url().to_string());

        loop {
            // Cache consult for this URL.
            let mut conditional: Vec<(String, String)> = Vec::new();
            let mut stale_entry: Option<CacheEntry> = None;
            if !self.config.disable_cache {
                let request_headers = self.effective_headers();
                match self.ctx.cache.lookup(
                    self.current_url(),
                    &self.config.method,
                    &request_headers,
                ) {
                    CacheLookup::Fresh(entry) => {
                        self.ctx.netlog.add_event(NetLogEventType::CacheHit);
                        return self.serve_cached(entry, cmd_rx).await;
                    }
                    CacheLookup::StaleWhileRevalidate(entry) => {
                        self.ctx.netlog.add_event(NetLogEventType::CacheHit);
                        self.spawn_background_revalidation(entry.conditional_headers());
                        return self.serve_cached(entry, cmd_rx).await;
                    }
                    CacheLookup::Stale(entry) => {
                        conditional = entry.conditional_headers();
                        stale_entry = Some(entry);
                    }
                    CacheLookup::Miss => {}
                }
            }

            // Resolution.
            if self.shared.state.state() == RequestState::New
                || self.shared.state.state() == RequestState::RedirectPending
            {
                self.shared.state.advance(RequestState::Resolving);
            }
            let binding = *self.ctx.bound_network.lock().unwrap();
            let origin = Origin::from_url(self.current_url())?;
            let dns_start = Instant::now();
            let endpoints = self
                .cancellable(self.ctx.resolver.resolve(
                    &origin.host,
                    AddressFamily::Unspecified,
                    binding,
                ))
                .await
                .map_err(|_| self.finish_canceled_err())??;
            self.metrics.dns_duration = Some(dns_start.elapsed());

            // Transaction with transparent retry.
            let response = self
                .transact(&origin, binding, &endpoints, &conditional)
                .await?;
            self.metrics.time_to_first_byte = Some(self.started_at.elapsed());

            let status = response.status();
            let response_headers = response.headers();
            let key = SessionKey {
                origin: origin.clone(),
                binding,
                privacy_mode: PrivacyMode::Disabled,
            };
            self.ctx.pool.record_response_status(&key, status);
            self.note_alt_svc(&origin, &response_headers);

            // Conditional revalidation answered from cache.
            if status == 304 {
                if stale_entry.is_some() {
                    if let Some(merged) = self.ctx.cache.update_from_not_modified(
                        self.current_url(),
                        &self.config.method,
                        &response_headers,
                    ) {
                        response.finish(&self.ctx.pool, true);
                        return self.serve_cached(merged, cmd_rx).await;
                    }
                }
                // 304 without a cached entry is a server error from the
                // client's point of view.
                return Err(NetError::InvalidHttpResponse);
            }

            // Redirect handling.
            if (300..400).contains(&status) && status != 304 {
                if let Some(location) = header_of(&response_headers, "location") {
                    let Ok(new_url) = self.current_url().join(&location) else {
                        return Err(NetError::InvalidRedirect);
                    };
                    self.shared.state.advance(RequestState::RedirectPending);
                    self.ctx.netlog.add_event(NetLogEventType::RequestRedirected);

                    let info = self.response_info(status, &response_headers, false);
                    self.post_redirect(info, new_url.clone());

                    match self.await_command(cmd_rx).await {
                        Ok(Command::FollowRedirect) => {
                            redirects += 1;
                            if redirects > self.ctx.max_redirects {
                                return Err(NetError::TooManyRedirects);
                            }
                            if !self.visited.insert(new_url.to_string()) {
                                return Err(NetError::RedirectCycleDetected);
                            }
                            self.apply_cross_origin_stripping(&new_url);
                            // An undrained H1 body poisons the socket.
                            response.finish(&self.ctx.pool, false);
                            self.url_chain.push(new_url);
                            continue;
                        }
                        Ok(Command::Read) => {
                            // The application keeps the redirect response.
                        }
                        Ok(Command::Cancel) | Err(Canceled) => {
                            response.finish(&self.ctx.pool, false);
                            self.finish_canceled();
                            return Ok(());
                        }
                    }
                    // Deliver the redirect response as final; the Read
                    // command consumed above primes the first chunk.
                    return self
                        .deliver_response(response, cmd_rx, stale_entry, true)
                        .await;
                }
            }

            return self.deliver_response(response, cmd_rx, stale_entry, false).await;
        }
    }

    /// One network exchange, transparently retrying eligible failures on
    /// fresh streams.
    async fn transact(
        &mut self,
        origin: &Origin,
        binding: NetworkBinding,
        endpoints: &[SocketAddr],
        conditional: &[(String, String)],
    ) -> Result<NetResponse, NetError> {
        let key = SessionKey {
            origin: origin.clone(),
            binding,
            privacy_mode: PrivacyMode::Disabled,
        };

        let mut attempt = 0u32;
        loop {
            self.shared.state.advance(RequestState::Connecting);
            let connect_start = Instant::now();
            let stream = self
                .cancellable(self.ctx.pool.acquire_stream(
                    &key,
                    endpoints,
                    self.config.is_http3_acceptable,
                    self.config.priority,
                ))
                .await
                .map_err(|_| self.finish_canceled_err())??;
            self.metrics.connect_duration = Some(connect_start.elapsed());
            let was_reused = stream.is_reused();

            self.shared.state.advance(RequestState::WaitingForHeaders);
            self.metrics.sent_byte_count += self.config.body.len() as u64;
            // Dropping the in-flight send on cancel releases the stream;
            // the H1 slot guard returns the connection slot.
            let sent = self
                .cancellable(self.send_on_stream(stream, origin, conditional))
                .await
                .map_err(|_| self.finish_canceled_err())?;
            match sent {
                Ok(response) => return Ok(response),
                Err(err)
                    if err.is_retryable_transparent()
                        && attempt < MAX_TRANSPARENT_RETRIES
                        && (was_reused || err == NetError::Http2ServerRefusedStream) =>
                {
                    // Reused-connection resets and REFUSED_STREAM carry a
                    // no-bytes-processed guarantee; retry silently.
                    tracing::debug!(error = %err, attempt, "transparent retry");
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_on_stream(
        &self,
        stream: HttpStream,
        origin: &Origin,
        conditional: &[(String, String)],
    ) -> Result<NetResponse, NetError> {
        let url = self.current_url().clone();
        let mut headers = self.effective_headers();
        headers.extend(conditional.iter().cloned());

        match stream {
            HttpStream::H1(mut conn) => {
                let path = origin_form(&url);
                let mut builder = http::Request::builder()
                    .method(self.config.method.as_str())
                    .uri(path)
                    .version(http::Version::HTTP_11)
                    .header(http::header::HOST, host_header_value(origin));
                for (name, value) in &headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                let request = builder
                    .body(OutboundBody::new(self.config.body.clone()))
                    .map_err(|_| NetError::InvalidUrl)?;

                conn.sender
                    .ready()
                    .await
                    .map_err(|_| NetError::ConnectionClosed)?;
                let response = match conn.sender.send_request(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        self.ctx.pool.release_h1(conn, false);
                        return Err(classify_hyper_h1_error(e));
                    }
                };
                let (parts, body) = response.into_parts();
                Ok(NetResponse::Hyper {
                    parts,
                    body,
                    h1: Some(conn),
                    h2: None,
                })
            }
            HttpStream::H2(mut h2) => {
                let mut builder = http::Request::builder()
                    .method(self.config.method.as_str())
                    .uri(url.as_str())
                    .version(http::Version::HTTP_2);
                for (name, value) in &headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                let request = builder
                    .body(OutboundBody::new(self.config.body.clone()))
                    .map_err(|_| NetError::InvalidUrl)?;

                let response = h2.send_request(request).await?;
                let (parts, body) = response.into_parts();
                Ok(NetResponse::Hyper {
                    parts,
                    body,
                    h1: None,
                    h2: Some(h2),
                })
            }
            HttpStream::H3(mut h3) => {
                let parts = H3RequestParts {
                    method: self.config.method.clone(),
                    scheme: origin.scheme.clone(),
                    authority: host_header_value(origin),
                    path: origin_form(&url),
                    headers,
                    body: self.config.body.clone(),
                };
                let (head, body) = h3.send_request(parts).await?;
                Ok(NetResponse::H3 {
                    head,
                    body,
                    stream: h3,
                })
            }
        }
    }

    /// Pump the body to the application under pull-based flow control,
    /// store the response, and finish.
    async fn deliver_response(
        &mut self,
        mut response: NetResponse,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        _stale_entry: Option<CacheEntry>,
        first_read_primed: bool,
    ) -> Result<(), NetError> {
        let status = response.status();
        let response_headers = response.headers();
        let protocol = response.negotiated_protocol();

        self.shared.state.advance(RequestState::Reading);
        let info = self.response_info_with_protocol(status, &response_headers, false, protocol);
        self.post_response_started(info);
        self.ctx.netlog.add_event(NetLogEventType::RequestHeadersReceived);

        let content_encoding = header_of(&response_headers, "content-encoding");
        let must_buffer_for_decode = content_encoding
            .as_deref()
            .map(|e| !e.eq_ignore_ascii_case("identity"))
            .unwrap_or(false);

        let mut full_body = Vec::new();
        let mut primed = first_read_primed;

        loop {
            // Pull model: one chunk per application read() call.
            if !primed {
                match self.await_command(cmd_rx).await {
                    Ok(Command::Read) => {}
                    Ok(Command::FollowRedirect) => continue, // ignored here
                    Ok(Command::Cancel) | Err(Canceled) => {
                        response.finish(&self.ctx.pool, false);
                        self.finish_canceled();
                        return Ok(());
                    }
                }
            }
            primed = false;

            let chunk = self
                .cancellable(response.next_chunk())
                .await
                .map_err(|_| self.finish_canceled_err())?;
            match chunk {
                Some(Ok(data)) => {
                    self.received += data.len() as u64;
                    if must_buffer_for_decode {
                        full_body.extend_from_slice(&data);
                        // Chunk is withheld until the stream completes;
                        // re-prime so the next pull continues reading.
                        primed = true;
                        continue;
                    }
                    full_body.extend_from_slice(&data);
                    let info =
                        self.response_info_with_protocol(status, &response_headers, false, protocol);
                    self.post_read_completed(info, data);
                }
                Some(Err(err)) => {
                    response.finish(&self.ctx.pool, false);
                    return Err(err);
                }
                None => break,
            }
        }

        let mut body = Bytes::from(full_body);
        if must_buffer_for_decode {
            body = decode_body(content_encoding.as_deref(), body)?;
            self.received = body.len() as u64;
            let info =
                self.response_info_with_protocol(status, &response_headers, false, protocol);
            // The decoded payload arrives as one chunk after a final read.
            self.post_read_completed(info, body.clone());
        }

        response.finish(&self.ctx.pool, true);

        if !self.config.disable_cache {
            let request_headers = self.effective_headers();
            self.ctx.cache.store(
                self.current_url(),
                &self.config.method,
                &request_headers,
                status,
                &response_headers,
                body,
            );
            self.ctx.netlog.add_event(NetLogEventType::CacheStore);
        }

        self.finish_succeeded(status, &response_headers, protocol);
        Ok(())
    }

    /// Serve a cache entry without touching the network.
    async fn serve_cached(
        &mut self,
        entry: CacheEntry,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), NetError> {
        self.shared.state.advance(RequestState::Connecting);
        self.shared.state.advance(RequestState::WaitingForHeaders);
        self.shared.state.advance(RequestState::Reading);

        let info = self.response_info_with_protocol(entry.status, &entry.headers, true, "cached");
        self.post_response_started(info);

        match self.await_command(cmd_rx).await {
            Ok(Command::Read) => {}
            Ok(_) | Err(Canceled) => {
                self.finish_canceled();
                return Ok(());
            }
        }

        self.received = entry.body.len() as u64;
        let info = self.response_info_with_protocol(entry.status, &entry.headers, true, "cached");
        self.post_read_completed(info, entry.body.clone());

        self.finish_succeeded_cached(&entry);
        Ok(())
    }

    /// Detached conditional fetch refreshing a stale-while-revalidate
    /// entry.
    fn spawn_background_revalidation(&self, conditional: Vec<(String, String)>) {
        let ctx = Arc::clone(&self.ctx);
        let url = self.current_url().clone();
        let method = self.config.method.clone();
        let request_headers = self.effective_headers();
        self.ctx.runner_handle.spawn(async move {
            let Ok(origin) = Origin::from_url(&url) else {
                return;
            };
            let binding = *ctx.bound_network.lock().unwrap();
            let Ok(endpoints) = ctx
                .resolver
                .resolve(&origin.host, AddressFamily::Unspecified, binding)
                .await
            else {
                return;
            };
            let key = SessionKey {
                origin: origin.clone(),
                binding,
                privacy_mode: PrivacyMode::Disabled,
            };
            let Ok(stream) = ctx
                .pool
                .acquire_stream(&key, &endpoints, true, RequestPriority::Idle)
                .await
            else {
                return;
            };

            // Background refreshes ride H1/H2 only through hyper paths.
            if let HttpStream::H1(mut conn) = stream {
                let mut builder = http::Request::builder()
                    .method(method.as_str())
                    .uri(origin_form(&url))
                    .version(http::Version::HTTP_11)
                    .header(http::header::HOST, host_header_value(&origin));
                for (name, value) in request_headers.iter().chain(conditional.iter()) {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                let Ok(request) = builder.body(OutboundBody::new(Bytes::new())) else {
                    return;
                };
                if conn.sender.ready().await.is_err() {
                    return;
                }
                match conn.sender.send_request(request).await {
                    Ok(response) => {
                        let (parts, body) = response.into_parts();
                        let status = parts.status.as_u16();
                        let headers: Vec<(String, String)> = parts
                            .headers
                            .iter()
                            .map(|(n, v)| {
                                (
                                    n.as_str().to_string(),
                                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                                )
                            })
                            .collect();
                        if status == 304 {
                            ctx.cache.update_from_not_modified(&url, &method, &headers);
                        } else if let Ok(collected) = body.collect().await {
                            ctx.cache.store(
                                &url,
                                &method,
                                &request_headers,
                                status,
                                &headers,
                                collected.to_bytes(),
                            );
                        }
                        ctx.pool.release_h1(conn, true);
                    }
                    Err(_) => {
                        ctx.pool.release_h1(conn, false);
                    }
                }
            }
        });
    }

    // ---- callback posting ----

    fn post_redirect(&self, info: UrlResponseInfo, new_url: Url) {
        let callback = Arc::clone(&self.callback);
        self.executor.execute(Box::new(move || {
            callback.on_redirect_received(&info, &new_url);
        }));
    }

    fn post_response_started(&self, info: UrlResponseInfo) {
        let callback = Arc::clone(&self.callback);
        self.executor.execute(Box::new(move || {
            callback.on_response_started(&info);
        }));
    }

    fn post_read_completed(&self, info: UrlResponseInfo, data: Bytes) {
        let callback = Arc::clone(&self.callback);
        self.executor.execute(Box::new(move || {
            callback.on_read_completed(&info, data);
        }));
    }

    fn finish_succeeded(&mut self, status: u16, headers: &[(String, String)], protocol: &str) {
        if !self.shared.claim_terminal() {
            return;
        }
        self.shared.state.advance(RequestState::Succeeded);
        self.metrics.total_duration = Some(self.started_at.elapsed());
        self.metrics.received_byte_count = self.received;
        let info = self.response_info_with_protocol(status, headers, false, protocol);
        let callback = Arc::clone(&self.callback);
        let finished = info.clone();
        self.executor.execute(Box::new(move || {
            callback.on_succeeded(&finished);
        }));
        self.notify_listeners(FinishedReason::Succeeded, Some(info), None);
        self.ctx.netlog.add_event(NetLogEventType::RequestFinished);
    }

    fn finish_succeeded_cached(&mut self, entry: &CacheEntry) {
        if !self.shared.claim_terminal() {
            return;
        }
        self.shared.state.advance(RequestState::Succeeded);
        self.metrics.total_duration = Some(self.started_at.elapsed());
        self.metrics.received_byte_count = self.received;
        let info = self.response_info_with_protocol(entry.status, &entry.headers, true, "cached");
        let callback = Arc::clone(&self.callback);
        let finished = info.clone();
        self.executor.execute(Box::new(move || {
            callback.on_succeeded(&finished);
        }));
        self.notify_listeners(FinishedReason::Succeeded, Some(info), None);
    }

    fn finish_failed(&mut self, error: NetError) {
        if !self.shared.claim_terminal() {
            return;
        }
        self.shared.state.advance(RequestState::Failed);
        self.metrics.total_duration = Some(self.started_at.elapsed());
        self.metrics.received_byte_count = self.received;
        let callback = Arc::clone(&self.callback);
        let error_for_cb = error.clone();
        self.executor.execute(Box::new(move || {
            callback.on_failed(None, &error_for_cb);
        }));
        self.notify_listeners(FinishedReason::Failed, None, Some(error.as_i32()));
        self.ctx.netlog.add_event_params(
            NetLogEventType::RequestFinished,
            serde_json::json!({"error": error.as_i32()}),
        );
    }

    fn finish_canceled(&mut self) {
        if !self.shared.claim_terminal() {
            return;
        }
        self.shared.state.advance(RequestState::Canceled);
        self.metrics.total_duration = Some(self.started_at.elapsed());
        self.metrics.received_byte_count = self.received;
        let callback = Arc::clone(&self.callback);
        self.executor.execute(Box::new(move || {
            callback.on_canceled(None);
        }));
        self.notify_listeners(FinishedReason::Canceled, None, None);
    }

    /// Cancellation noticed mid-flow: deliver the terminal callback here
    /// and surface a marker error that `run` discards.
    fn finish_canceled_err(&mut self) -> NetError {
        self.finish_canceled();
        NetError::Aborted
    }

    fn notify_listeners(
        &self,
        reason: FinishedReason,
        info: Option<UrlResponseInfo>,
        error_code: Option<i32>,
    ) {
        let snapshot = RequestFinishedInfo {
            url: self.url_chain.first().cloned().expect("chain never empty"),
            finished_reason: reason,
            response_info: info,
            error_code,
            metrics: self.metrics.clone(),
        };
        let listeners = self.ctx.listeners.lock().unwrap().clone();
        for listener in listeners {
            let snapshot = snapshot.clone();
            self.executor.execute(Box::new(move || {
                listener.on_request_finished(&snapshot);
            }));
        }
    }

    // ---- helpers ----

    fn current_url(&self) -> &Url {
        self.url_chain.last().expect("chain never empty")
    }

    /// Request headers plus engine defaults (user-agent, accept-encoding).
    fn effective_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.config.headers.clone();
        if !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("user-agent")) {
            headers.push(("user-agent".into(), self.ctx.user_agent.clone()));
        }
        if !headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("accept-encoding"))
        {
            let value = if self.ctx.enable_brotli {
                "gzip, deflate, br"
            } else {
                "gzip, deflate"
            };
            headers.push(("accept-encoding".into(), value.into()));
        }
        headers
    }

    /// Cross-origin redirects lose Authorization and URL credentials.
    fn apply_cross_origin_stripping(&mut self, new_url: &Url) {
        let is_cross_origin = self.current_url().origin() != new_url.origin();
        if is_cross_origin {
            self.config
                .headers
                .retain(|(n, _)| !n.eq_ignore_ascii_case("authorization"));
        }
    }

    fn note_alt_svc(&self, origin: &Origin, headers: &[(String, String)]) {
        let Some(value) = header_of(headers, "alt-svc") else {
            return;
        };
        if let Some(port) = parse_alt_svc_h3_port(&value, origin.port) {
            self.ctx.pool.note_alt_svc_h3(origin, port);
        }
    }

    fn response_info(
        &self,
        status: u16,
        headers: &[(String, String)],
        was_cached: bool,
    ) -> UrlResponseInfo {
        self.response_info_with_protocol(status, headers, was_cached, "")
    }

    fn response_info_with_protocol(
        &self,
        status: u16,
        headers: &[(String, String)],
        was_cached: bool,
        protocol: &str,
    ) -> UrlResponseInfo {
        UrlResponseInfo {
            url_chain: self.url_chain.clone(),
            status_code: status,
            status_text: status_text(status).to_string(),
            headers: headers.to_vec(),
            negotiated_protocol: protocol.to_string(),
            was_cached,
            received_byte_count: self.received,
        }
    }

    /// Wait for the next application command, honoring cancellation.
    async fn await_command(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<Command, Canceled> {
        match self.cancellable(cmd_rx.recv()).await? {
            Some(Command::Cancel) | None => Err(Canceled),
            Some(cmd) => Ok(cmd),
        }
    }

    /// Race a future against cancellation.
    async fn cancellable<F: std::future::Future>(&self, fut: F) -> Result<F::Output, Canceled> {
        if self.shared.canceled.load(Ordering::SeqCst) {
            return Err(Canceled);
        }
        tokio::select! {
            biased;
            _ = self.shared.cancel_notify.notified() => Err(Canceled),
            out = fut => Ok(out),
        }
    }
}

fn header_of(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn host_header_value(origin: &Origin) -> String {
    let default_port = match origin.scheme.as_str() {
        "https" => 443,
        _ => 80,
    };
    if origin.port == default_port {
        origin.host.clone()
    } else {
        format!("{}:{}", origin.host, origin.port)
    }
}

/// Path plus query, as sent on the wire.
fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Extract the first h3 endpoint port from an Alt-Svc header.
fn parse_alt_svc_h3_port(value: &str, default_port: u16) -> Option<u16> {
    for entry in value.split(',') {
        let entry = entry.trim();
        let Some(rest) = entry.strip_prefix("h3=") else {
            continue;
        };
        let authority = rest.split(';').next()?.trim().trim_matches('"');
        let port_part = authority.strip_prefix(':').unwrap_or(authority);
        if port_part.is_empty() {
            return Some(default_port);
        }
        if let Ok(port) = port_part.parse() {
            return Some(port);
        }
    }
    None
}

fn classify_hyper_h1_error(err: hyper::Error) -> NetError {
    if err.is_incomplete_message() {
        NetError::ConnectionClosed
    } else if err.is_timeout() {
        NetError::TimedOut
    } else if err.is_canceled() {
        NetError::ConnectionAborted
    } else {
        NetError::ConnectionReset
    }
}

fn status_text(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}
