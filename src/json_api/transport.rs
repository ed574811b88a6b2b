use std::future::Future;

use bytes::{Bytes, BytesMut};
use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    Stream, StreamExt, TryStreamExt,
};
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;

/// One outbound HTTP call, as handed to a [`Transport`].
#[derive(Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Fires when the caller gives up on the request; the transport must
    /// drop the connection and end the body stream.
    pub cancel: CancellationToken,
}

/// A response whose body is delivered as a stream of chunks.
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl TransportResponse {
    pub fn new(
        status: StatusCode,
        body: impl Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
    ) -> Self {
        Self {
            status,
            body: body.boxed(),
        }
    }

    /// A response with the whole body available at once.
    pub fn full(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(status, futures::stream::once(async move { Ok(body) }))
    }

    /// Buffers the entire body.
    pub async fn bytes(self) -> Result<Vec<u8>, TransportError> {
        self.body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
    }

    /// Splits the body on `\n`; chunk boundaries may fall anywhere.
    ///
    /// Lines are raw bytes without the terminator, so one undecodable line
    /// does not affect the rest of the body. The stream ends after the first
    /// body error.
    pub fn lines(self) -> BoxStream<'static, Result<Bytes, TransportError>> {
        let state = LineSplitter {
            body: self.body,
            buffer: BytesMut::new(),
            done: false,
        };
        stream::unfold(state, |mut state| async move {
            let line = state.next_line().await?;
            Some((line, state))
        })
        .boxed()
    }
}

struct LineSplitter {
    body: BoxStream<'static, Result<Bytes, TransportError>>,
    buffer: BytesMut,
    done: bool,
}

impl LineSplitter {
    async fn next_line(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            if let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let mut line = self.buffer.split_to(end + 1);
                line.truncate(end);
                return Some(Ok(line.freeze()));
            }
            if self.done {
                if self.buffer.is_empty() {
                    return None;
                }
                return Some(Ok(self.buffer.split().freeze()));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    self.done = true;
                    self.buffer.clear();
                    return Some(Err(err));
                }
                None => self.done = true,
            }
        }
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("body", &"...")
            .finish()
    }
}

/// The sole I/O dependency of the JSON clients.
///
/// Any `Fn(TransportRequest) -> impl Future<Output = Result<TransportResponse, TransportError>>`
/// closure is a transport, which is how tests and embedders inject one.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>>;
}

impl<F, Fut> Transport for F
where
    F: Fn(TransportRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TransportResponse, TransportError>> + Send + 'static,
{
    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        Box::pin(self(request))
    }
}

/// Failures below the HTTP status level.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request was aborted")]
    Aborted,
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] http::Error),
    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube_client::Error),
    #[error("connection error: {0}")]
    Connection(String),
}
