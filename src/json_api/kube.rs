use futures::{future::BoxFuture, FutureExt, StreamExt, TryStreamExt};
use http::StatusCode;
use http_body_util::BodyExt;
use kube_client::client::Body;
use serde_json::{Map, Value};

use super::{
    format_default_error, ErrorFormatter, JsonApi, ResponseBody, Transport, TransportError,
    TransportRequest, TransportResponse,
};

/// A [`JsonApi`] that understands the Kubernetes `Status` error envelope.
pub type KubeJsonApi = JsonApi<KubeErrorFormatter>;

/// Formats `{status, reason, message}` error bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeErrorFormatter;

impl ErrorFormatter for KubeErrorFormatter {
    fn format(&self, payload: &ResponseBody, status: StatusCode) -> Vec<String> {
        if let ResponseBody::Text(text) = payload {
            return vec![text.clone()];
        }

        if let Some(Value::Object(error)) = payload.as_json() {
            if let (Some(status), Some(reason)) =
                (str_field(error, "status"), str_field(error, "reason"))
            {
                let message = str_field(error, "message")
                    .map_or_else(|| format!("{status}: {reason}"), str::to_owned);
                return vec![message];
            }
        }

        format_default_error(payload, status)
    }
}

fn str_field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    object
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

/// Sends requests through a [`kube_client::Client`], which supplies the
/// cluster address, TLS and credentials from the kubeconfig.
///
/// Pair it with an empty [`JsonApiConfig::server_address`](super::JsonApiConfig).
#[derive(Clone)]
pub struct KubeClientTransport {
    client: kube_client::Client,
}

impl KubeClientTransport {
    pub fn new(client: kube_client::Client) -> Self {
        Self { client }
    }

    /// Builds a client from the environment's kubeconfig or in-cluster config.
    pub async fn infer() -> Result<Self, kube_client::Error> {
        Ok(Self::new(kube_client::Client::try_default().await?))
    }
}

impl Transport for KubeClientTransport {
    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        send_with_client(self.client.clone(), request).boxed()
    }
}

async fn send_with_client(
    client: kube_client::Client,
    request: TransportRequest,
) -> Result<TransportResponse, TransportError> {
    let TransportRequest {
        method,
        url,
        headers,
        body,
        cancel,
    } = request;

    let mut builder = http::Request::builder().method(method).uri(url);
    if let Some(request_headers) = builder.headers_mut() {
        request_headers.extend(headers);
    }
    let request = builder.body(Body::from(body.unwrap_or_default()))?;

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(TransportError::Aborted),
        response = client.send(request) => response?,
    };

    let status = response.status();
    let body = response
        .into_body()
        .into_data_stream()
        .map_err(|err| TransportError::Connection(err.to_string()))
        .take_until(cancel.cancelled_owned());
    Ok(TransportResponse::new(status, body))
}
