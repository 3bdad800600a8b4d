//! Scripted in-memory transport for exercising the client without a network.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use futures::stream;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tokio::sync::mpsc;

use crate::error::{LlmError, LlmResult};
use crate::transport::{BoxFuture, ByteStream, HttpRequest, HttpResponse, HttpTransport};

/// Formats one streamed delta record.
pub fn delta_record(content: &str) -> String {
    format!(
        "data: {}\n",
        serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
    )
}

pub fn done_record() -> String {
    "data: [DONE]\n".to_string()
}

/// Request as observed by the scripted transport.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    pub fn body_json(&self) -> serde_json::Value {
        self.body
            .as_deref()
            .and_then(|body| serde_json::from_slice(body).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

enum ScriptedBody {
    Chunks(Vec<Vec<u8>>),
    Live(mpsc::UnboundedReceiver<LlmResult<Vec<u8>>>),
}

pub struct ScriptedResponse {
    status: StatusCode,
    body: ScriptedBody,
}

impl ScriptedResponse {
    pub fn chunks(status: u16, chunks: Vec<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: ScriptedBody::Chunks(chunks.into_iter().map(String::into_bytes).collect()),
        }
    }

    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::chunks(status, vec![value.to_string()])
    }

    /// A 200 event stream carrying one record per delta followed by the sentinel.
    pub fn deltas(deltas: &[&str]) -> Self {
        let mut chunks = deltas
            .iter()
            .map(|delta| delta_record(delta))
            .collect::<Vec<_>>();
        chunks.push(done_record());
        Self::chunks(200, chunks)
    }

    /// A response whose body is fed chunk by chunk through the returned handle.
    pub fn live(status: u16) -> (Self, LiveBody) {
        let (tx, rx) = mpsc::unbounded_channel();
        let response = Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: ScriptedBody::Live(rx),
        };
        (response, LiveBody { tx })
    }

    fn into_response(self) -> HttpResponse {
        let body: ByteStream = match self.body {
            ScriptedBody::Chunks(chunks) => Box::pin(stream::iter(chunks.into_iter().map(Ok))),
            ScriptedBody::Live(rx) => Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })),
        };
        HttpResponse::new(self.status, body)
    }
}

/// Sender side of a live scripted body. Dropping it closes the body.
#[derive(Clone)]
pub struct LiveBody {
    tx: mpsc::UnboundedSender<LlmResult<Vec<u8>>>,
}

impl LiveBody {
    pub fn send_raw(&self, chunk: impl Into<String>) -> bool {
        self.tx.send(Ok(chunk.into().into_bytes())).is_ok()
    }

    pub fn send_delta(&self, content: &str) -> bool {
        self.send_raw(delta_record(content))
    }

    pub fn send_done(&self) -> bool {
        self.send_raw(done_record())
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.tx
            .send(Err(LlmError::StreamRead {
                stage: "scripted-body",
                message: message.into(),
            }))
            .is_ok()
    }
}

/// Replays queued responses in order and records every request it receives.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        let transport = Self::new();
        for response in responses {
            transport.push(response);
        }
        transport
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests().pop()
    }
}

impl HttpTransport for ScriptedTransport {
    fn send<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, LlmResult<HttpResponse>> {
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(RecordedRequest {
                    method: request.method,
                    url: request.url,
                    headers: request.headers,
                    body: request.body,
                });

            let next = self
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();

            match next {
                Some(response) => Ok(response.into_response()),
                None => Err(LlmError::StreamRead {
                    stage: "scripted-transport",
                    message: "no scripted response left".to_string(),
                }),
            }
        })
    }
}
