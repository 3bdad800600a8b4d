use std::time::Instant;

use futures::StreamExt;
use serde::Deserialize;

use crate::cancel::CancelToken;
use crate::error::LlmResult;
use crate::metrics::NetworkMetrics;
use crate::transport::ByteStream;

/// Record prefix for server-sent-event payload lines.
pub const DATA_PREFIX: &str = "data: ";
/// Terminal payload that ends a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const TOKENS_PER_WORD: f64 = 1.3;

/// Coarse display-only token estimate: `ceil(words * 1.3)`, words split on single spaces.
pub fn estimate_tokens(delta: &str) -> u64 {
    (delta.split(' ').count() as f64 * TOKENS_PER_WORD).ceil() as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Delta(String),
    Done,
}

/// How a decoded stream ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamOutcome {
    /// Sentinel observed or body closed. Metrics are absent for degenerate streams.
    Completed(Option<NetworkMetrics>),
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Incremental `data:` line decoder that also tracks per-request timing.
///
/// Partial lines are buffered across chunks, so a record split by the transport is
/// decoded once its newline arrives.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    started_at: Instant,
    first_delta_at: Option<Instant>,
    estimated_tokens: u64,
    finished: bool,
}

impl StreamDecoder {
    pub fn new(started_at: Instant) -> Self {
        Self {
            buffer: Vec::new(),
            started_at,
            first_delta_at: None,
            estimated_tokens: 0,
            finished: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedEvent> {
        self.push_at(chunk, Instant::now())
    }

    /// Feeds one raw chunk received at `now` and returns the events it completed.
    pub fn push_at(&mut self, chunk: &[u8], now: Instant) -> Vec<DecodedEvent> {
        if self.finished {
            return Vec::new();
        }

        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            if let Some(event) = self.decode_line(&line[..newline], now) {
                let done = event == DecodedEvent::Done;
                events.push(event);
                if done {
                    self.buffer.clear();
                    break;
                }
            }
        }
        events
    }

    /// Decodes whatever unterminated line remains once the body has closed.
    pub fn finish_at(&mut self, now: Instant) -> Vec<DecodedEvent> {
        if self.finished || self.buffer.is_empty() {
            return Vec::new();
        }

        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line, now).into_iter().collect()
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }

    pub fn first_delta_at(&self) -> Option<Instant> {
        self.first_delta_at
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Metrics for the stream as observed up to `now`.
    ///
    /// Time-to-first-token equals the whole duration when no delta ever arrived.
    pub fn metrics_at(&self, now: Instant) -> Option<NetworkMetrics> {
        let request_duration = now.saturating_duration_since(self.started_at);
        let time_to_first_token = self
            .first_delta_at
            .map(|first| first.saturating_duration_since(self.started_at))
            .unwrap_or(request_duration);

        NetworkMetrics::from_request(
            request_duration,
            self.estimated_tokens,
            self.estimated_tokens,
            time_to_first_token,
        )
    }

    fn decode_line(&mut self, raw: &[u8], now: Instant) -> Option<DecodedEvent> {
        let line = String::from_utf8_lossy(raw);
        let line = line.strip_suffix('\r').unwrap_or(&line);

        // Keep-alives, comments and blank separators carry no payload.
        let payload = line.strip_prefix(DATA_PREFIX)?;

        if payload == DONE_SENTINEL {
            self.finished = true;
            return Some(DecodedEvent::Done);
        }

        let chunk = match serde_json::from_str::<StreamChunk>(payload) {
            Ok(chunk) => chunk,
            Err(error) => {
                tracing::trace!(error = %error, "skipping malformed stream record");
                return None;
            }
        };

        let content = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|content| !content.is_empty())?;

        self.first_delta_at.get_or_insert(now);
        self.estimated_tokens += estimate_tokens(&content);
        Some(DecodedEvent::Delta(content))
    }

    /// Drains `body`, invoking `on_delta` once per delta in arrival order.
    ///
    /// Cancellation is raced against every read; once observed the body is dropped and
    /// neither `on_delta` nor metrics are touched again.
    pub async fn run<F>(
        mut self,
        mut body: ByteStream,
        cancel: &CancelToken,
        mut on_delta: F,
    ) -> LlmResult<StreamOutcome>
    where
        F: FnMut(&str),
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("stream decoding cancelled");
                    return Ok(StreamOutcome::Cancelled);
                }
                next = body.next() => next,
            };

            let now = Instant::now();
            let (events, closed) = match next {
                Some(chunk) => (self.push_at(&chunk?, now), false),
                None => (self.finish_at(now), true),
            };

            for event in events {
                if cancel.is_cancelled() {
                    return Ok(StreamOutcome::Cancelled);
                }
                match event {
                    DecodedEvent::Delta(text) => on_delta(&text),
                    DecodedEvent::Done => {
                        return Ok(StreamOutcome::Completed(self.metrics_at(Instant::now())));
                    }
                }
            }

            if closed {
                tracing::debug!(
                    estimated_tokens = self.estimated_tokens,
                    "stream closed without terminal sentinel"
                );
                return Ok(StreamOutcome::Completed(self.metrics_at(Instant::now())));
            }
        }
    }
}
