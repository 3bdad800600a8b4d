use std::future::Future;
use std::pin::Pin;

use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use snafu::ResultExt;

use crate::error::{HttpSnafu, LlmResult, StreamReadSnafu};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
/// Raw response body chunks as they come off the wire.
pub type ByteStream = Pin<Box<dyn Stream<Item = LlmResult<Vec<u8>>> + Send>>;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub body: ByteStream,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: ByteStream) -> Self {
        Self { status, body }
    }

    /// Canonical reason phrase for the status, or the empty string for unknown codes.
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or_default()
    }

    /// Buffers the whole body.
    pub async fn bytes(self) -> LlmResult<Vec<u8>> {
        self.body
            .try_fold(Vec::new(), |mut collected, chunk| async move {
                collected.extend_from_slice(&chunk);
                Ok(collected)
            })
            .await
    }
}

/// One HTTP round-trip. The body is returned unread so callers can stream it.
pub trait HttpTransport: Send + Sync {
    fn send<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, LlmResult<HttpResponse>>;
}

/// Production transport over a shared `reqwest` connection pool.
///
/// No request timeout is configured; a hung stream is ended by cancellation.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> LlmResult<Self> {
        let client = reqwest::Client::builder().build().context(HttpSnafu {
            stage: "build-http-client",
        })?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpTransport for ReqwestTransport {
    fn send<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, LlmResult<HttpResponse>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method, request.url.as_str())
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.context(HttpSnafu {
                stage: "send-request",
            })?;
            let status = response.status();
            let body = response.bytes_stream().map(|chunk| {
                chunk.map(|bytes| bytes.to_vec()).map_err(|error| {
                    StreamReadSnafu {
                        stage: "read-response-chunk",
                        message: error.to_string(),
                    }
                    .build()
                })
            });

            Ok(HttpResponse::new(status, Box::pin(body)))
        })
    }
}
