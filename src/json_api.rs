//! JSON-over-HTTP client used by every resource client.
//!
//! [`JsonApi`] composes URLs from its [`JsonApiConfig`], serializes request
//! bodies, and turns responses into a [`ResponseBody`] or a [`RequestError`].
//! How error payloads become human-readable messages is decided by an
//! [`ErrorFormatter`]; [`KubeJsonApi`] plugs in the Kubernetes `Status` rules.

use std::sync::Arc;

use http::{
    header::{HeaderName, CONTENT_TYPE},
    HeaderMap, HeaderValue, Method, StatusCode,
};
use log::debug;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

mod kube;
pub use kube::{KubeClientTransport, KubeErrorFormatter, KubeJsonApi};
mod transport;
pub use transport::{Transport, TransportError, TransportRequest, TransportResponse};

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Characters left unescaped in query keys and values.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Where requests go and how they are decorated.
#[derive(Debug, Clone, Default)]
pub struct JsonApiConfig {
    /// Scheme and authority, e.g. `http://127.0.0.1:8001`. Empty when the
    /// transport already knows the server.
    pub server_address: String,
    /// Path prepended to every request path.
    pub api_base: String,
    /// Log every request/response pair at debug level.
    pub debug: bool,
    /// Sent with every request.
    pub headers: HeaderMap,
}

impl JsonApiConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Self::default()
        }
    }

    pub fn with_server_address(mut self, server_address: impl Into<String>) -> Self {
        self.server_address = server_address.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// A parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// The server sent nothing.
    NoContent,
    Json(Value),
    /// The body was not valid JSON.
    Text(String),
}

impl ResponseBody {
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Self::NoContent;
        }
        match serde_json::from_slice(bytes) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// A non-2xx response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", .messages.join("\n"))]
pub struct RequestError {
    pub messages: Vec<String>,
    pub status: StatusCode,
    pub payload: ResponseBody,
}

#[derive(Debug, thiserror::Error)]
pub enum JsonApiError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl JsonApiError {
    /// The HTTP status, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(err) => Some(err.status),
            _ => None,
        }
    }
}

/// Extracts human-readable messages from an error payload.
pub trait ErrorFormatter: Send + Sync {
    fn format(&self, payload: &ResponseBody, status: StatusCode) -> Vec<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorFormatter;

impl ErrorFormatter for DefaultErrorFormatter {
    fn format(&self, payload: &ResponseBody, status: StatusCode) -> Vec<String> {
        format_default_error(payload, status)
    }
}

/// The generic rules: a bare string, then `errors[].title`, then `message`,
/// then the status reason phrase.
pub fn format_default_error(payload: &ResponseBody, status: StatusCode) -> Vec<String> {
    match payload {
        ResponseBody::Text(text) => return vec![text.clone()],
        ResponseBody::Json(Value::String(text)) => return vec![text.clone()],
        ResponseBody::Json(Value::Object(error)) => {
            if let Some(Value::Array(errors)) = error.get("errors") {
                return errors
                    .iter()
                    .map(|error| {
                        error
                            .get("title")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned()
                    })
                    .collect();
            }
            if let Some(message) = error
                .get("message")
                .and_then(Value::as_str)
                .filter(|message| !message.is_empty())
            {
                return vec![message.to_owned()];
            }
        }
        _ => {}
    }
    vec![status.canonical_reason().unwrap_or("Error!").to_owned()]
}

/// Per-call request options.
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Defaults to `application/json` when a body is present.
    pub content_type: Option<&'static str>,
    pub cancel: Option<CancellationToken>,
}

impl RequestInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Encodes `query` as `k=v&k=v`, without the leading `?`.
pub fn encode_query(query: &[(String, String)]) -> String {
    query
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(key, QUERY_VALUE),
                utf8_percent_encode(value, QUERY_VALUE)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

pub struct JsonApi<F = DefaultErrorFormatter> {
    config: JsonApiConfig,
    transport: Arc<dyn Transport>,
    formatter: F,
}

impl<F: ErrorFormatter + Default> JsonApi<F> {
    pub fn new(config: JsonApiConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_formatter(config, transport, F::default())
    }
}

impl<F: ErrorFormatter> JsonApi<F> {
    pub fn with_formatter(config: JsonApiConfig, transport: Arc<dyn Transport>, formatter: F) -> Self {
        Self {
            config,
            transport,
            formatter,
        }
    }

    pub fn config(&self) -> &JsonApiConfig {
        &self.config
    }

    /// Full URL for `path`, with `query` appended if non-empty.
    pub fn url(&self, path: &str, query: &[(String, String)]) -> String {
        let mut url = format!("{}{}{}", self.config.server_address, self.config.api_base, path);
        if !query.is_empty() {
            url.push(if path.contains('?') { '&' } else { '?' });
            url.push_str(&encode_query(query));
        }
        url
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        init: RequestInit,
    ) -> Result<ResponseBody, JsonApiError> {
        let (url, response) = self.send(method.clone(), path, init).await?;
        let status = response.status;
        let payload = ResponseBody::parse(&response.bytes().await?);
        if self.config.debug {
            debug!("[JSON-API] response {method} {url}: {status} {payload:?}");
        }

        if status.is_success() {
            Ok(payload)
        } else {
            Err(self.request_error(status, payload).into())
        }
    }

    /// Issues a `GET` and hands back the body unread, for streaming consumers.
    pub async fn stream(
        &self,
        path: &str,
        init: RequestInit,
    ) -> Result<TransportResponse, JsonApiError> {
        let (url, response) = self.send(Method::GET, path, init).await?;
        if response.status.is_success() {
            return Ok(response);
        }

        let status = response.status;
        let payload = ResponseBody::parse(&response.bytes().await?);
        if self.config.debug {
            debug!("[JSON-API] stream rejected {url}: {status} {payload:?}");
        }
        Err(self.request_error(status, payload).into())
    }

    pub async fn get(&self, path: &str, init: RequestInit) -> Result<ResponseBody, JsonApiError> {
        self.request(Method::GET, path, init).await
    }

    pub async fn post(&self, path: &str, init: RequestInit) -> Result<ResponseBody, JsonApiError> {
        self.request(Method::POST, path, init).await
    }

    pub async fn put(&self, path: &str, init: RequestInit) -> Result<ResponseBody, JsonApiError> {
        self.request(Method::PUT, path, init).await
    }

    pub async fn patch(&self, path: &str, init: RequestInit) -> Result<ResponseBody, JsonApiError> {
        self.request(Method::PATCH, path, init).await
    }

    pub async fn del(&self, path: &str, init: RequestInit) -> Result<ResponseBody, JsonApiError> {
        self.request(Method::DELETE, path, init).await
    }

    fn request_error(&self, status: StatusCode, payload: ResponseBody) -> RequestError {
        RequestError {
            messages: self.formatter.format(&payload, status),
            status,
            payload,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        init: RequestInit,
    ) -> Result<(String, TransportResponse), JsonApiError> {
        let url = self.url(path, &init.query);
        let mut headers = self.config.headers.clone();
        let body = match &init.body {
            Some(body) => {
                let content_type = init.content_type.unwrap_or(CONTENT_TYPE_JSON);
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                Some(serde_json::to_vec(body)?)
            }
            None => None,
        };
        if self.config.debug {
            debug!("[JSON-API] request {method} {url} {:?}", init.body);
        }

        let request = TransportRequest {
            method,
            url: url.clone(),
            headers,
            body,
            cancel: init.cancel.unwrap_or_else(CancellationToken::new),
        };
        let response = self.transport.send(request).await?;
        Ok((url, response))
    }
}
