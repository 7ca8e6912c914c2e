//! End-to-end request tests against an in-process HTTP/1.1 server.
//!
//! Covers the callback ordering contract (a request delivers a prefix of
//! redirect*, response-started, read*, then exactly one terminal), the
//! redirect-following flow, Accept-Encoding advertisement, and
//! cancellation.

use corenet::engine::DirectExecutor;
use corenet::request::{UrlRequestCallback, UrlResponseInfo};
use corenet::{Engine, NetError};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(Debug)]
enum Event {
    Redirect(String),
    Started(u16),
    Read(Vec<u8>),
    Succeeded(UrlResponseInfo),
    Failed(i32),
    Canceled,
}

struct Recorder {
    tx: Sender<Event>,
}

impl UrlRequestCallback for Recorder {
    fn on_redirect_received(&self, _info: &UrlResponseInfo, new_url: &Url) {
        let _ = self.tx.send(Event::Redirect(new_url.to_string()));
    }

    fn on_response_started(&self, info: &UrlResponseInfo) {
        let _ = self.tx.send(Event::Started(info.status_code));
    }

    fn on_read_completed(&self, _info: &UrlResponseInfo, data: bytes::Bytes) {
        let _ = self.tx.send(Event::Read(data.to_vec()));
    }

    fn on_succeeded(&self, info: &UrlResponseInfo) {
        let _ = self.tx.send(Event::Succeeded(info.clone()));
    }

    fn on_failed(&self, _info: Option<&UrlResponseInfo>, error: &NetError) {
        let _ = self.tx.send(Event::Failed(error.as_i32()));
    }

    fn on_canceled(&self, _info: Option<&UrlResponseInfo>) {
        let _ = self.tx.send(Event::Canceled);
    }
}

fn recorder() -> (Arc<Recorder>, Receiver<Event>) {
    let (tx, rx) = std::sync::mpsc::channel();
    (Arc::new(Recorder { tx }), rx)
}

/// Blocking single-threaded HTTP/1.1 server: answers `connections`
/// sequential connections, one request each, routing by path. Records
/// every raw request head it sees.
fn serve(
    routes: Vec<(&'static str, String)>,
    connections: usize,
) -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_writer = Arc::clone(&seen);

    std::thread::spawn(move || {
        for _ in 0..connections {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            let head = String::from_utf8_lossy(&buf).into_owned();
            let path = head
                .split_whitespace()
                .nth(1)
                .unwrap_or("/")
                .to_string();
            seen_writer.lock().unwrap().push(head);

            let response = routes
                .iter()
                .find(|(p, _)| *p == path)
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| {
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string()
                });
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        }
    });

    (port, seen)
}

fn ok_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

fn redirect_response(location: &str) -> String {
    format!(
        "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )
}

const STEP: Duration = Duration::from_secs(10);

/// The terminal callback is delivered just before the job releases its
/// in-flight slot; wait for that before shutdown.
fn wait_idle(engine: &Engine) {
    for _ in 0..200 {
        if engine.active_request_count() == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("engine never became idle");
}

#[test]
fn test_simple_get_callback_sequence() {
    let (port, _) = serve(vec![("/echo", ok_response("hello"))], 1);
    let engine = Engine::builder().build().unwrap();
    let (callback, events) = recorder();

    let request = engine
        .new_request_builder(
            &format!("http://127.0.0.1:{port}/echo"),
            Arc::new(DirectExecutor),
            callback,
        )
        .unwrap()
        .build();
    request.start().unwrap();

    match events.recv_timeout(STEP).unwrap() {
        Event::Started(status) => assert_eq!(status, 200),
        other => panic!("expected Started, got {other:?}"),
    }

    // Pull the body.
    request.read();
    let mut body = Vec::new();
    loop {
        match events.recv_timeout(STEP).unwrap() {
            Event::Read(data) => {
                body.extend_from_slice(&data);
                request.read();
            }
            Event::Succeeded(info) => {
                assert_eq!(info.status_code, 200);
                assert_eq!(info.received_byte_count, 5);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(body, b"hello");
    assert!(request.is_done());

    wait_idle(&engine);
    engine.shutdown().unwrap();
}

#[test]
fn test_redirect_chain_followed() {
    // GET /a -> 302 /b -> 200 "ok"; the handler follows both times.
    // The Location header needs the bound port, so this server is built
    // inline rather than through `serve`.
    let (port, _) = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let location = format!("http://127.0.0.1:{port}/b");
        let routes = vec![
            ("/a", redirect_response(&location)),
            ("/b", ok_response("ok")),
        ];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_writer = Arc::clone(&seen);
        std::thread::spawn(move || {
            for _ in 0..2 {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&buf).into_owned();
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                seen_writer.lock().unwrap().push(head);
                let response = routes
                    .iter()
                    .find(|(p, _)| *p == path)
                    .map(|(_, r)| r.clone())
                    .unwrap();
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (port, seen)
    };

    let engine = Engine::builder().build().unwrap();
    let (callback, events) = recorder();
    let request = engine
        .new_request_builder(
            &format!("http://127.0.0.1:{port}/a"),
            Arc::new(DirectExecutor),
            callback,
        )
        .unwrap()
        .build();
    request.start().unwrap();

    match events.recv_timeout(STEP).unwrap() {
        Event::Redirect(new_url) => assert!(new_url.ends_with("/b")),
        other => panic!("expected Redirect, got {other:?}"),
    }
    request.follow_redirect();

    match events.recv_timeout(STEP).unwrap() {
        Event::Started(status) => assert_eq!(status, 200),
        other => panic!("expected Started, got {other:?}"),
    }

    request.read();
    let mut body = Vec::new();
    loop {
        match events.recv_timeout(STEP).unwrap() {
            Event::Read(data) => {
                body.extend_from_slice(&data);
                request.read();
            }
            Event::Succeeded(info) => {
                assert!(info.url().as_str().ends_with("/b"), "final URL is the target");
                assert_eq!(info.url_chain.len(), 2);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(body, b"ok");

    wait_idle(&engine);
    engine.shutdown().unwrap();
}

#[test]
fn test_brotli_advertised_only_when_enabled() {
    // Engine with brotli: Accept-Encoding carries br.
    let (port, seen) = serve(vec![("/", ok_response("x"))], 1);
    let engine = Engine::builder().enable_brotli(true).build().unwrap();
    let (callback, events) = recorder();
    let request = engine
        .new_request_builder(
            &format!("http://127.0.0.1:{port}/"),
            Arc::new(DirectExecutor),
            callback,
        )
        .unwrap()
        .build();
    request.start().unwrap();
    drive_to_success(&events, &request);
    wait_idle(&engine);
    engine.shutdown().unwrap();

    let head = seen.lock().unwrap().join("");
    let accept_encoding = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("accept-encoding"))
        .expect("accept-encoding sent")
        .to_ascii_lowercase();
    assert!(accept_encoding.contains("br"), "brotli advertised: {accept_encoding}");
    assert!(accept_encoding.contains("gzip"));

    // Default engine: no br.
    let (port, seen) = serve(vec![("/", ok_response("x"))], 1);
    let engine = Engine::builder().build().unwrap();
    let (callback, events) = recorder();
    let request = engine
        .new_request_builder(
            &format!("http://127.0.0.1:{port}/"),
            Arc::new(DirectExecutor),
            callback,
        )
        .unwrap()
        .build();
    request.start().unwrap();
    drive_to_success(&events, &request);
    wait_idle(&engine);
    engine.shutdown().unwrap();

    let head = seen.lock().unwrap().join("");
    let accept_encoding = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("accept-encoding"))
        .expect("accept-encoding sent")
        .to_ascii_lowercase();
    assert!(!accept_encoding.contains("br"), "br absent by default: {accept_encoding}");
}

#[test]
fn test_cancel_delivers_single_terminal() {
    let (port, _) = serve(vec![("/slow", ok_response("body"))], 1);
    let engine = Engine::builder().build().unwrap();
    let (callback, events) = recorder();
    let request = engine
        .new_request_builder(
            &format!("http://127.0.0.1:{port}/slow"),
            Arc::new(DirectExecutor),
            callback,
        )
        .unwrap()
        .build();
    request.start().unwrap();

    match events.recv_timeout(STEP).unwrap() {
        Event::Started(_) => {}
        other => panic!("expected Started, got {other:?}"),
    }

    // Cancel instead of reading.
    request.cancel();
    match events.recv_timeout(STEP).unwrap() {
        Event::Canceled => {}
        other => panic!("expected Canceled, got {other:?}"),
    }
    assert!(request.is_done());

    // No further events follow the terminal callback.
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    wait_idle(&engine);
    engine.shutdown().unwrap();
}

#[test]
fn test_connection_refused_fails() {
    // Bind-then-drop gives a port that refuses connections.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let engine = Engine::builder()
        .set_connect_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let (callback, events) = recorder();
    let request = engine
        .new_request_builder(
            &format!("http://127.0.0.1:{port}/"),
            Arc::new(DirectExecutor),
            callback,
        )
        .unwrap()
        .build();
    request.start().unwrap();

    match events.recv_timeout(STEP).unwrap() {
        Event::Failed(code) => assert!(code < 0, "stable negative code, got {code}"),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert!(request.is_done());
    wait_idle(&engine);
    engine.shutdown().unwrap();
}

#[test]
fn test_double_start_rejected() {
    let engine = Engine::builder().build().unwrap();
    let (callback, _events) = recorder();
    let request = engine
        .new_request_builder("http://127.0.0.1:1/", Arc::new(DirectExecutor), callback)
        .unwrap()
        .build();
    request.start().unwrap();
    assert!(request.start().is_err());
    request.cancel();
    wait_idle(&engine);
    engine.shutdown().unwrap();
}

fn drive_to_success(events: &Receiver<Event>, request: &corenet::request::UrlRequest) {
    loop {
        match events.recv_timeout(STEP).unwrap() {
            Event::Started(_) => request.read(),
            Event::Read(_) => request.read(),
            Event::Succeeded(_) => return,
            other => panic!("unexpected event {other:?}"),
        }
    }
}
