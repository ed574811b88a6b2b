//! Test doubles shared by the unit tests.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, stream, FutureExt, StreamExt};
use http::{header::CONTENT_TYPE, Method, StatusCode};
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::json_api::{
    Transport, TransportError, TransportRequest, TransportResponse,
};

#[derive(Debug, Clone)]
pub enum Reply {
    Body { status: StatusCode, body: Vec<u8> },
    /// Streams the chunks, then closes the body.
    Lines(Vec<Bytes>),
    /// Streams the chunks, then keeps the body open until the request is cancelled.
    Open(Vec<Bytes>),
    /// The connection fails before any response.
    Fail,
}

impl Reply {
    pub fn json(status: StatusCode, body: Value) -> Self {
        Self::Body {
            status,
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    pub fn empty(status: StatusCode) -> Self {
        Self::Body {
            status,
            body: Vec::new(),
        }
    }

    pub fn lines<S: ToString>(lines: impl IntoIterator<Item = S>) -> Self {
        Self::Lines(terminated(lines))
    }

    pub fn open<S: ToString>(lines: impl IntoIterator<Item = S>) -> Self {
        Self::Open(terminated(lines))
    }

    /// Like [`Reply::open`], but the chunks are sent exactly as given.
    pub fn open_raw<B: Into<Bytes>>(chunks: impl IntoIterator<Item = B>) -> Self {
        Self::Open(chunks.into_iter().map(Into::into).collect())
    }
}

fn terminated<S: ToString>(lines: impl IntoIterator<Item = S>) -> Vec<Bytes> {
    lines
        .into_iter()
        .map(|line| Bytes::from(line.to_string() + "\n"))
        .collect()
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub content_type: Option<String>,
    pub raw_body: Option<String>,
}

impl RecordedRequest {
    /// The URL without its query string.
    pub fn path(&self) -> &str {
        self.url.split('?').next().unwrap_or_default()
    }

    pub fn json(&self) -> Option<Value> {
        self.raw_body
            .as_deref()
            .map(|body| serde_json::from_str(body).unwrap())
    }
}

/// Records every request and replays canned replies keyed by method and path.
///
/// A route with several queued replies hands them out in order; the last one
/// repeats. Unknown routes answer with a Kubernetes `NotFound` status.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    arrived: Notify,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, method: Method, path: &str, reply: Reply) {
        self.routes
            .lock()
            .entry((method, path.to_owned()))
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|request| request.url.clone())
            .collect()
    }

    pub async fn wait_for_requests(&self, count: usize) {
        let wait = async {
            loop {
                let arrived = self.arrived.notified();
                if self.requests.lock().len() >= count {
                    return;
                }
                arrived.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for requests");
    }

    fn next_reply(&self, method: &Method, path: &str) -> Option<Reply> {
        let mut routes = self.routes.lock();
        let queue = routes.get_mut(&(method.clone(), path.to_owned()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

fn line_chunks(chunks: Vec<Bytes>) -> impl futures::Stream<Item = Result<Bytes, TransportError>> {
    stream::iter(chunks.into_iter().map(Ok))
}

impl Transport for FakeTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let recorded = RecordedRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            content_type: request
                .headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            raw_body: request
                .body
                .as_ref()
                .map(|body| String::from_utf8(body.clone()).unwrap()),
        };
        let path = recorded.path().to_owned();
        let reply = self.next_reply(&request.method, &path);
        self.requests.lock().push(recorded);
        self.arrived.notify_waiters();

        let cancel = request.cancel;
        async move {
            match reply {
                None => Ok(TransportResponse::full(
                    StatusCode::NOT_FOUND,
                    serde_json::to_vec(&json!({
                        "kind": "Status",
                        "status": "Failure",
                        "reason": "NotFound",
                        "message": format!("no route for {path}"),
                        "code": 404,
                    }))
                    .unwrap(),
                )),
                Some(Reply::Body { status, body }) => Ok(TransportResponse::full(status, body)),
                Some(Reply::Lines(lines)) => {
                    Ok(TransportResponse::new(StatusCode::OK, line_chunks(lines)))
                }
                Some(Reply::Open(lines)) => Ok(TransportResponse::new(
                    StatusCode::OK,
                    line_chunks(lines)
                        .chain(stream::pending())
                        .take_until(cancel.cancelled_owned()),
                )),
                Some(Reply::Fail) => Err(TransportError::Connection("connection refused".into())),
            }
        }
        .boxed()
    }
}

thread_local! {
    static CAPTURED: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
}

/// Keeps records on the thread that logged them, so tests running in
/// parallel only see their own.
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        CAPTURED.with(|captured| {
            captured
                .borrow_mut()
                .push((record.level(), record.args().to_string()))
        });
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

/// Starts capturing log records emitted on the current thread.
pub fn capture_logs() {
    // Another test may have installed it already.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Trace);
    CAPTURED.with(|captured| captured.borrow_mut().clear());
}

/// Records logged on the current thread since [`capture_logs`].
pub fn captured_logs() -> Vec<(Level, String)> {
    CAPTURED.with(|captured| captured.borrow().clone())
}
