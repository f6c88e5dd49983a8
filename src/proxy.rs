//! Reverse-proxy plumbing between the gateway and runner-local endpoints.
//!
//! Buffered requests are collected within the request timeout; streaming
//! responses are relayed frame-by-frame with the runner's [`RequestPermit`]
//! held by the response body, so in-flight accounting stays correct until the
//! client consumed (or abandoned) the stream.

use crate::runner::RequestPermit;
use axum::body::Body;
use bytes::Bytes;
use http_body::Frame;
use http_body_util::BodyExt;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("failed to read upstream body: {0}")]
    Body(String),
}

/// HTTP client for runner-local endpoints.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, Body>,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client }
    }
}

/// A fully buffered upstream reply.
#[derive(Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// POST `body` to the runner and await the complete response within
    /// `timeout`.
    pub async fn forward_buffered(
        &self,
        host: &str,
        port: u16,
        path: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<BufferedResponse, UpstreamError> {
        let request = build_post(host, port, path, body)?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| UpstreamError::Connect(e.to_string()))?;
            let (parts, body) = response.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| UpstreamError::Body(e.to_string()))?
                .to_bytes();
            Ok(BufferedResponse {
                status: parts.status,
                content_type: parts.headers.get(header::CONTENT_TYPE).cloned(),
                body: bytes,
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout),
        }
    }

    /// POST `body` to the runner and relay the response as-is, frame by
    /// frame. The permit rides inside the response body and is released when
    /// the body is fully consumed or dropped; a client disconnect therefore
    /// aborts the upstream call and decrements in-flight promptly.
    ///
    /// `stream_timeout` bounds the whole exchange (None = unbounded).
    pub async fn forward_streaming(
        &self,
        host: &str,
        port: u16,
        path: &str,
        body: Bytes,
        permit: RequestPermit,
        stream_timeout: Option<Duration>,
    ) -> Result<Response<Body>, UpstreamError> {
        let request = build_post(host, port, path, body)?;

        let response_fut = self.client.request(request);
        let response = match stream_timeout {
            Some(limit) => tokio::time::timeout(limit, response_fut)
                .await
                .map_err(|_| UpstreamError::Timeout)?,
            None => response_fut.await,
        }
        .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let (parts, upstream) = response.into_parts();
        let guarded = PermitBody::new(Body::new(upstream), permit, stream_timeout);
        Ok(Response::from_parts(parts, Body::new(guarded)))
    }
}

fn build_post(host: &str, port: u16, path: &str, body: Bytes) -> Result<Request<Body>, UpstreamError> {
    let uri: Uri = format!("http://{host}:{port}{path}")
        .parse()
        .map_err(|e| UpstreamError::Connect(format!("invalid upstream url: {e}")))?;

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| UpstreamError::Connect(e.to_string()))
}

/// Response body that owns the runner permit (and an optional stream
/// deadline) until the body finishes.
struct PermitBody {
    inner: Body,
    _permit: Option<RequestPermit>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl PermitBody {
    fn new(inner: Body, permit: RequestPermit, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            _permit: Some(permit),
            deadline: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
        }
    }
}

impl http_body::Body for PermitBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(deadline) = this.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            return Poll::Ready(Some(Err(axum::Error::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "streaming timeout exceeded",
            )))));
        }

        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use tokio::net::TcpListener;

    async fn spawn_echo_server() -> u16 {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                Json(serde_json::json!({"echo": body}))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn buffered_forward_round_trip() {
        let port = spawn_echo_server().await;
        let client = UpstreamClient::new();

        let response = client
            .forward_buffered(
                "127.0.0.1",
                port,
                "/v1/chat/completions",
                Bytes::from(r#"{"model":"m1"}"#),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(json["echo"]["model"], "m1");
    }

    #[tokio::test]
    async fn buffered_forward_times_out() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "late"
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = UpstreamClient::new();
        let err = client
            .forward_buffered(
                "127.0.0.1",
                port,
                "/v1/chat/completions",
                Bytes::from("{}"),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout));
    }

    #[tokio::test]
    async fn connect_error_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = UpstreamClient::new();
        let err = client
            .forward_buffered(
                "127.0.0.1",
                port,
                "/v1/chat/completions",
                Bytes::from("{}"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Connect(_)));
    }
}
