use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::decoder::{StreamDecoder, StreamOutcome};
use crate::error::{
    DecodeResponseSnafu, EncodeRequestSnafu, InvalidApiKeySnafu, LlmError, LlmResult,
    MissingApiKeySnafu,
};
use crate::metrics::{MetricsAccumulator, NetworkMetrics};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::types::{ChatMessage, ChatOptions, CompletionRequestBody, CompletionResponse};

pub const DEFAULT_BASE_URL: &str = "https://api.fireworks.ai/inference/v1";

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
const APPLICATION_JSON: &str = "application/json";
const EVENT_STREAM: &str = "text/event-stream";
const MODEL_NOT_FOUND_MARKER: &str = "model not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: String,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim();
        if !base_url.is_empty() {
            self.base_url = base_url.to_string();
        }
        self
    }
}

/// One streaming request, owned so it can move into a worker task.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: ChatOptions,
}

impl StreamRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: ChatOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }
}

/// Events published by a stream worker. Nothing is published once its scope is cancelled.
#[derive(Debug)]
pub enum StreamEvent {
    Delta(String),
    Finished,
    Failed(LlmError),
}

pub type StreamWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receiving side of a worker's event channel.
pub struct DeltaStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancelToken,
}

impl DeltaStream {
    /// Next event, or `None` once the worker is gone or the scope was cancelled.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let event = self.events.recv().await?;
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(event)
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.events.try_recv().ok()
    }
}

/// A stream ready to run: the caller spawns `worker` and pumps `stream`.
pub struct StreamHandle {
    pub stream: DeltaStream,
    pub worker: StreamWorker,
}

/// Chat-completion client for an OpenAI-compatible inference endpoint.
pub struct CompletionClient {
    endpoint: String,
    authorization: HeaderValue,
    transport: Arc<dyn HttpTransport>,
    metrics: Arc<MetricsAccumulator>,
}

impl CompletionClient {
    /// Builds a client on the default `reqwest` transport.
    ///
    /// Fails before any network setup when the API key is missing.
    pub fn new(config: ClientConfig) -> LlmResult<Self> {
        ensure!(
            !config.api_key.trim().is_empty(),
            MissingApiKeySnafu {
                stage: "client-new"
            }
        );
        let transport = ReqwestTransport::new()?;
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> LlmResult<Self> {
        let api_key = config.api_key.trim();
        ensure!(
            !api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "client-with-transport"
            }
        );

        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {api_key}")).context(InvalidApiKeySnafu {
                stage: "build-authorization-header",
            })?;
        authorization.set_sensitive(true);

        let endpoint = format!(
            "{}/{CHAT_COMPLETIONS_PATH}",
            config.base_url.trim_end_matches('/')
        );

        Ok(Self {
            endpoint,
            authorization,
            transport,
            metrics: Arc::new(MetricsAccumulator::new()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        Arc::clone(&self.transport)
    }

    /// Snapshot of the last completed request's metrics.
    pub fn metrics(&self) -> NetworkMetrics {
        self.metrics.snapshot()
    }

    pub fn metrics_accumulator(&self) -> Arc<MetricsAccumulator> {
        Arc::clone(&self.metrics)
    }

    fn create_headers(&self, streaming: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(if streaming {
                EVENT_STREAM
            } else {
                APPLICATION_JSON
            }),
        );
        headers
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> LlmResult<HttpRequest> {
        let body = CompletionRequestBody::new(model, messages, options, stream);
        let body = serde_json::to_vec(&body).context(EncodeRequestSnafu {
            stage: "encode-completion-request",
        })?;

        Ok(HttpRequest {
            method: Method::POST,
            url: self.endpoint.clone(),
            headers: self.create_headers(stream),
            body: Some(body),
        })
    }

    /// Non-streaming completion.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> LlmResult<CompletionResponse> {
        let started_at = Instant::now();
        let request = self.build_request(model, messages, options, false)?;

        tracing::debug!(
            model_id = %model,
            message_count = messages.len(),
            "sending completion request"
        );
        let response = self.transport.send(request).await?;
        if !response.status.is_success() {
            return Err(api_error(response, "completion-status").await);
        }

        let payload = response.bytes().await?;
        let completion: CompletionResponse =
            serde_json::from_slice(&payload).context(DecodeResponseSnafu {
                stage: "decode-completion-response",
            })?;

        let request_duration = started_at.elapsed();
        if let Some(usage) = completion.usage
            && let Some(metrics) = NetworkMetrics::from_request(
                request_duration,
                usage.total_tokens,
                usage.completion_tokens,
                request_duration,
            )
        {
            self.metrics.merge(metrics);
        }

        Ok(completion)
    }

    /// Streaming completion; `on_delta` receives each incremental fragment in order.
    ///
    /// Returns once the sentinel is seen or the body closes. Cancellation is a silent
    /// early return, and metrics are only published while `cancel` is still live.
    pub async fn stream_complete<F>(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancelToken,
        on_delta: F,
    ) -> LlmResult<()>
    where
        F: FnMut(&str),
    {
        let started_at = Instant::now();
        let request = self.build_request(model, messages, options, true)?;

        tracing::debug!(
            model_id = %model,
            message_count = messages.len(),
            "opening completion stream"
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(model_id = %model, "stream cancelled before response");
                return Ok(());
            }
            response = self.transport.send(request) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(error) => return Err(error),
        };

        if cancel.is_cancelled() {
            return Ok(());
        }
        if !response.status.is_success() {
            return Err(api_error(response, "stream-status").await);
        }

        let outcome = match StreamDecoder::new(started_at)
            .run(response.body, cancel, on_delta)
            .await
        {
            Ok(outcome) => outcome,
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(error) => return Err(error),
        };

        match outcome {
            StreamOutcome::Completed(Some(metrics)) if !cancel.is_cancelled() => {
                tracing::debug!(
                    model_id = %model,
                    total_tokens = ?metrics.total_tokens,
                    request_duration_ms = ?metrics.request_duration,
                    "completion stream finished"
                );
                self.metrics.merge(metrics);
            }
            StreamOutcome::Completed(_) | StreamOutcome::Cancelled => {}
        }

        Ok(())
    }

    /// Sends `message` after `history` and returns the first choice's content.
    pub async fn send_message(
        &self,
        model: &str,
        message: &str,
        history: &[ChatMessage],
        options: &ChatOptions,
    ) -> LlmResult<String> {
        let messages = with_user_message(history, message);
        let response = self.complete(model, &messages, options).await?;
        Ok(response.first_content().to_string())
    }

    pub async fn send_streaming_message<F>(
        &self,
        model: &str,
        message: &str,
        history: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancelToken,
        on_delta: F,
    ) -> LlmResult<()>
    where
        F: FnMut(&str),
    {
        let messages = with_user_message(history, message);
        self.stream_complete(model, &messages, options, cancel, on_delta)
            .await
    }

    /// Prepares a streaming request as a worker future plus its event stream.
    pub fn open_stream(
        self: &Arc<Self>,
        request: StreamRequest,
        cancel: CancelToken,
    ) -> StreamHandle {
        let (event_tx, events) = mpsc::unbounded_channel();
        let worker: StreamWorker = Box::pin(Self::run_stream_worker(
            Arc::clone(self),
            request,
            event_tx,
            cancel.clone(),
        ));

        StreamHandle {
            stream: DeltaStream { events, cancel },
            worker,
        }
    }

    async fn run_stream_worker(
        client: Arc<Self>,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: CancelToken,
    ) {
        let result = client
            .stream_complete(
                &request.model,
                &request.messages,
                &request.options,
                &cancel,
                |delta| {
                    let _ = event_tx.send(StreamEvent::Delta(delta.to_string()));
                },
            )
            .await;

        if cancel.is_cancelled() {
            tracing::debug!(model_id = %request.model, "stream worker stopped by cancellation");
            return;
        }

        let terminal = match result {
            Ok(()) => StreamEvent::Finished,
            Err(error) => {
                tracing::error!(
                    model_id = %request.model,
                    status = ?error.status(),
                    error = %error,
                    "completion stream failed"
                );
                StreamEvent::Failed(error)
            }
        };
        let _ = event_tx.send(terminal);
    }
}

fn with_user_message(history: &[ChatMessage], message: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.extend_from_slice(history);
    messages.push(ChatMessage::user(message));
    messages
}

/// Translates a non-success response into a typed error.
///
/// Prefers the upstream `error.message` and falls back to the status reason phrase.
async fn api_error(response: HttpResponse, stage: &'static str) -> LlmError {
    let status = response.status;
    let status_text = response.status_text();
    let payload = response.bytes().await.unwrap_or_default();

    let upstream = serde_json::from_slice::<serde_json::Value>(&payload)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .filter(|message| !message.trim().is_empty());
    let message = upstream.unwrap_or_else(|| status_text.to_string());

    if status == StatusCode::NOT_FOUND
        && message.to_ascii_lowercase().contains(MODEL_NOT_FOUND_MARKER)
    {
        tracing::warn!(status = status.as_u16(), upstream = %message, "requested model is not served");
        return LlmError::ModelUnavailable {
            stage,
            status: status.as_u16(),
            upstream: message,
        };
    }

    tracing::warn!(status = status.as_u16(), message = %message, "inference API returned an error");
    LlmError::Api {
        stage,
        status: status.as_u16(),
        message,
    }
}
