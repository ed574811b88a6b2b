use std::{future::pending, panic::resume_unwind, sync::Arc, time::Duration};

use futures::StreamExt;
use kube_core::ErrorResponse;
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ApiEndpoint, Constructor};
use crate::json_api::{JsonApiError, RequestInit};

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Normalized like every other call: `None` and `""` mean `default`.
    pub namespace: Option<String>,
    /// Watch the kind across every namespace.
    pub all_namespaces: bool,
    /// Starting checkpoint. Defaults to the version of the last `list` in
    /// the same namespace.
    pub resource_version: Option<String>,
    pub timeout_seconds: Option<u64>,
    /// Cancelling this token stops the watch, like [`WatchHandle::stop`].
    pub cancel: Option<CancellationToken>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn all_namespaces(mut self) -> Self {
        self.all_namespaces = true;
        self
    }

    pub fn resource_version(mut self, resource_version: impl Into<String>) -> Self {
        self.resource_version = Some(resource_version.into());
        self
    }

    pub fn timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    Bookmark { resource_version: String },
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> Option<&K> {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => Some(object),
            Self::Bookmark { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// A line that is not a watch event. The stream continues.
    #[error("failed to parse watch event: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("unknown watch event type {0:?}")]
    UnknownEvent(String),
    /// The server reported an `ERROR` event. The watch ends.
    #[error("watch error from server: {0}")]
    Status(#[source] ErrorResponse),
    /// The watch request failed. The watch ends.
    #[error(transparent)]
    Request(#[from] JsonApiError),
}

/// Stops a running watch.
///
/// Dropping the handle leaves the watch running.
#[derive(Debug)]
pub struct WatchHandle {
    id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Aborts the in-flight stream; no reconnect happens afterwards.
    /// Calling it again, or after the watch ended by itself, does nothing.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the watch and waits for its task to wind down.
    pub async fn stop_and_wait(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            if let Ok(panic) = err.try_into_panic() {
                resume_unwind(panic);
            }
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: Value,
}

enum Received<K> {
    Event {
        event: WatchEvent<K>,
        resource_version: Option<String>,
    },
    Status(ErrorResponse),
}

fn parse_line<K>(line: &[u8], construct: Constructor<K>) -> Result<Received<K>, WatchError> {
    let raw: RawEvent = serde_json::from_slice(line).map_err(WatchError::Parse)?;
    let resource_version = raw
        .object
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let event = match raw.event_type.as_str() {
        "ADDED" => WatchEvent::Added(construct(raw.object).map_err(WatchError::Parse)?),
        "MODIFIED" => WatchEvent::Modified(construct(raw.object).map_err(WatchError::Parse)?),
        "DELETED" => WatchEvent::Deleted(construct(raw.object).map_err(WatchError::Parse)?),
        "BOOKMARK" => WatchEvent::Bookmark {
            resource_version: resource_version.clone().unwrap_or_default(),
        },
        "ERROR" => {
            return serde_json::from_value(raw.object)
                .map(Received::Status)
                .map_err(WatchError::Parse)
        }
        other => return Err(WatchError::UnknownEvent(other.to_owned())),
    };
    Ok(Received::Event {
        event,
        resource_version,
    })
}

enum StreamEnd {
    Stopped,
    Closed,
    TimedOut,
    Failed,
}

pub(super) fn spawn<K, F>(
    endpoint: Arc<ApiEndpoint>,
    construct: Constructor<K>,
    options: WatchOptions,
    callback: F,
) -> WatchHandle
where
    K: Send + 'static,
    F: FnMut(Result<WatchEvent<K>, WatchError>) + Send + 'static,
{
    let id = endpoint.next_watch_id();
    let cancel = options
        .cancel
        .as_ref()
        .map_or_else(CancellationToken::new, CancellationToken::child_token);
    let task = tokio::spawn(run(
        endpoint,
        construct,
        options,
        id.clone(),
        cancel.clone(),
        callback,
    ));
    WatchHandle { id, cancel, task }
}

async fn run<K, F>(
    endpoint: Arc<ApiEndpoint>,
    construct: Constructor<K>,
    options: WatchOptions,
    id: String,
    cancel: CancellationToken,
    mut callback: F,
) where
    F: FnMut(Result<WatchEvent<K>, WatchError>),
{
    tokio::select! {
        _ = cancel.cancelled() => {
            info!("[KUBE-API] watch ({id}) aborted before it started");
            return;
        }
        _ = endpoint.ensure_resolved() => {}
    }

    let namespace = if options.all_namespaces || !endpoint.is_namespaced() {
        None
    } else {
        Some(super::namespace_or_default(options.namespace.as_deref()).to_owned())
    };
    let mut resource_version = options
        .resource_version
        .or_else(|| endpoint.listed_resource_version(namespace.as_deref().unwrap_or_default()))
        .unwrap_or_default();
    let timeout = options.timeout_seconds;
    let path = endpoint.collection_path(namespace.as_deref());
    let mut retried = false;

    loop {
        let request_cancel = cancel.child_token();
        let mut init = RequestInit::new()
            .query("watch", 1)
            .query("resourceVersion", &resource_version)
            .cancel(request_cancel.clone());
        if let Some(seconds) = timeout {
            init = init.query("timeoutSeconds", seconds);
        }
        let url_for_log = endpoint.json().url(&path, &init.query);
        let state = if retried { "retried" } else { "started" };
        info!("[KUBE-API] watch ({id}) {state} {url_for_log}");

        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            response = endpoint.json().stream(&path, init) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!("[KUBE-API] watch ({id}) failed {url_for_log}: {err}");
                callback(Err(WatchError::Request(err)));
                break;
            }
        };

        let mut lines = response.lines();
        let guard = async {
            match timeout {
                // The server is asked to close after `timeout`; force it slightly later.
                Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds).mul_f64(1.1)).await,
                None => pending().await,
            }
        };
        tokio::pin!(guard);

        let end = loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break StreamEnd::Stopped,
                _ = &mut guard => break StreamEnd::TimedOut,
                line = lines.next() => line,
            };
            let line = match line {
                None => break StreamEnd::Closed,
                Some(Err(err)) => {
                    warn!("[KUBE-API] watch ({id}) stream interrupted {url_for_log}: {err}");
                    break StreamEnd::Closed;
                }
                Some(Ok(line)) => line,
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match parse_line(&line, construct) {
                Ok(Received::Event {
                    event,
                    resource_version: seen,
                }) => {
                    if let Some(seen) = seen {
                        resource_version = seen;
                    }
                    callback(Ok(event));
                }
                Ok(Received::Status(status)) => {
                    warn!("[KUBE-API] watch ({id}) error event {url_for_log}: {status}");
                    callback(Err(WatchError::Status(status)));
                    break StreamEnd::Failed;
                }
                Err(err) => callback(Err(err)),
            }
        };

        request_cancel.cancel();
        drop(lines);

        match end {
            StreamEnd::Stopped => break,
            StreamEnd::Failed => return,
            StreamEnd::Closed | StreamEnd::TimedOut => retried = true,
        }
    }

    if cancel.is_cancelled() {
        info!("[KUBE-API] watch ({id}) aborted");
    }
}
