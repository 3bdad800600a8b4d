use std::sync::Arc;

use kindle_llm::{
    CancelHandle, ChatMessage, ChatOptions, CompletionClient, DeltaStream, NetworkMetrics,
    StreamHandle, StreamRequest,
};

use crate::events::{ChatStreamEvent, ChatStreamPayload};
use crate::ids::{StreamSessionId, StreamTarget};
use crate::message::Message;
use crate::state::{ChatTransition, ConversationState};
use crate::usage::UsageTracker;

pub const SELECT_MODEL_MESSAGE: &str = "Please select a model first";
pub const STREAM_CLOSED_MESSAGE: &str = "stream ended before a terminal event";

/// Event stream of one request, tagged with its target.
pub struct ChatStream {
    target: StreamTarget,
    events: DeltaStream,
}

impl ChatStream {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Next event, or `None` once the request finished or was cancelled.
    pub async fn recv(&mut self) -> Option<ChatStreamEvent> {
        let event = self.events.recv().await?;
        Some(ChatStreamEvent::from_stream_event(self.target, event))
    }

    pub fn try_recv(&mut self) -> Option<ChatStreamEvent> {
        let event = self.events.try_recv()?;
        Some(ChatStreamEvent::from_stream_event(self.target, event))
    }
}

/// Owns the conversation and drives one request at a time through the client.
///
/// All mutation happens on the owning task; the client's worker only talks back
/// through the [`ChatStream`] returned by [`ConversationController::send`].
pub struct ConversationController {
    client: Arc<CompletionClient>,
    usage: Arc<dyn UsageTracker>,
    options: ChatOptions,
    messages: Vec<Message>,
    state: ConversationState,
    input: String,
    error: Option<String>,
    active_model: Option<String>,
    cancel: Option<CancelHandle>,
    next_session_id: u64,
}

impl ConversationController {
    pub fn new(client: Arc<CompletionClient>, usage: Arc<dyn UsageTracker>) -> Self {
        Self {
            client,
            usage,
            options: ChatOptions::default(),
            messages: Vec::new(),
            state: ConversationState::Idle,
            input: String::new(),
            error: None,
            active_model: None,
            cancel: None,
            next_session_id: 1,
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> ChatOptions {
        self.options
    }

    pub fn set_options(&mut self, options: ChatOptions) {
        self.options = options;
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn phase(&self) -> ConversationState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_busy()
    }

    pub fn is_streaming_started(&self) -> bool {
        self.state.is_streaming()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    /// Latest completed-request metrics reported by the client.
    pub fn metrics(&self) -> NetworkMetrics {
        self.client.metrics()
    }

    /// Sends the pending input with `model`.
    ///
    /// Returns `None` without side effects for blank input or while a request is in
    /// flight. The worker is spawned on the current tokio runtime.
    pub fn send(&mut self, model: Option<&str>) -> Option<ChatStream> {
        let content = self.input.trim().to_string();
        if content.is_empty() || self.state.is_busy() {
            return None;
        }

        let Some(model) = model.map(str::trim).filter(|model| !model.is_empty()) else {
            self.error = Some(SELECT_MODEL_MESSAGE.to_string());
            return None;
        };

        let target = self.alloc_target();
        let next_state = match self.state.apply(ChatTransition::Start(target)) {
            Ok(state) => state,
            Err(rejection) => {
                tracing::debug!(?rejection, "send rejected by conversation state");
                return None;
            }
        };

        let (handle, token) = CancelHandle::new();
        if let Some(previous) = self.cancel.replace(handle) {
            previous.cancel();
        }

        let mut request_messages = self
            .messages
            .iter()
            .filter(|message| message.belongs_to(model))
            .map(Message::to_chat_message)
            .collect::<Vec<_>>();
        request_messages.push(ChatMessage::user(content.clone()));

        self.messages.push(Message::user(content, model));
        self.input.clear();
        self.error = None;
        self.state = next_state;
        self.active_model = Some(model.to_string());
        self.usage.track_model_usage(model);

        tracing::debug!(
            model_id = %model,
            stream_target = %target,
            history_len = request_messages.len() - 1,
            "sending chat message"
        );

        let request = StreamRequest::new(model, request_messages).with_options(self.options);
        let StreamHandle { stream, worker } = self.client.open_stream(request, token);
        tokio::spawn(worker);

        Some(ChatStream {
            target,
            events: stream,
        })
    }

    /// Applies one stream event. Returns `false` when the event was stale and ignored.
    pub fn handle_stream_event(&mut self, event: ChatStreamEvent) -> bool {
        if !self.state.accepts_stream_event(event.target) {
            tracing::trace!(stream_target = %event.target, "ignoring stale stream event");
            return false;
        }

        match event.payload {
            ChatStreamPayload::Delta(text) => self.append_delta(event.target, &text),
            ChatStreamPayload::Finished => self.finish(event.target),
            ChatStreamPayload::Failed(message) => self.fail(event.target, message),
        }
        true
    }

    /// Called when the event stream for `target` closed.
    ///
    /// A still-live target never saw a terminal event and is failed.
    pub fn handle_stream_closed(&mut self, target: StreamTarget) {
        if self.state.accepts_stream_event(target) {
            self.fail(target, STREAM_CLOSED_MESSAGE.to_string());
        }
    }

    /// Cancels the in-flight request, keeping any partial reply. Idempotent.
    pub fn cancel(&mut self) -> bool {
        if let Some(handle) = self.cancel.take() {
            handle.cancel();
        }

        let Some(target) = self.state.active_target() else {
            return false;
        };
        self.transition(ChatTransition::Cancel(target));
        self.active_model = None;
        tracing::debug!(stream_target = %target, "chat request cancelled");
        true
    }

    pub fn clear_history(&mut self) {
        self.cancel();
        self.messages.clear();
        self.error = None;
    }

    fn alloc_target(&mut self) -> StreamTarget {
        let target = StreamTarget::new(StreamSessionId::new(self.next_session_id));
        self.next_session_id = self.next_session_id.saturating_add(1);
        target
    }

    fn transition(&mut self, transition: ChatTransition) -> bool {
        match self.state.apply(transition) {
            Ok(state) => {
                self.state = state;
                true
            }
            Err(rejection) => {
                tracing::debug!(?rejection, "conversation transition rejected");
                false
            }
        }
    }

    fn append_delta(&mut self, target: StreamTarget, text: &str) {
        let assistant_id = match self.state.assistant_id() {
            Some(assistant_id) => assistant_id,
            None => {
                let placeholder =
                    Message::assistant_placeholder(self.active_model.clone().unwrap_or_default());
                let assistant_id = placeholder.id;
                if !self.transition(ChatTransition::FirstDelta {
                    target,
                    assistant_id,
                }) {
                    return;
                }
                self.messages.push(placeholder);
                assistant_id
            }
        };

        if let Some(message) = self
            .messages
            .iter_mut()
            .rev()
            .find(|message| message.id == assistant_id)
        {
            message.content.push_str(text);
        }
    }

    fn finish(&mut self, target: StreamTarget) {
        if self.transition(ChatTransition::Complete(target)) {
            self.cancel = None;
            self.active_model = None;
        }
    }

    fn fail(&mut self, target: StreamTarget, message: String) {
        let assistant_id = self.state.assistant_id();
        if !self.transition(ChatTransition::Fail(target)) {
            return;
        }

        if let Some(assistant_id) = assistant_id {
            self.messages.retain(|entry| entry.id != assistant_id);
        }
        tracing::warn!(stream_target = %target, error = %message, "chat request failed");
        self.error = Some(message);
        self.cancel = None;
        self.active_model = None;
    }
}

#[cfg(test)]
mod tests {
    use kindle_llm::testing::{ScriptedResponse, ScriptedTransport};
    use kindle_llm::{ClientConfig, HttpTransport, ModelInfo, Role};
    use serde_json::json;

    use super::*;
    use crate::usage::{NoopUsageTracker, RecentModels};

    fn controller_with(
        responses: impl IntoIterator<Item = ScriptedResponse>,
    ) -> (ConversationController, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::with_responses(responses));
        let client = CompletionClient::with_transport(
            ClientConfig::new("fw-test-key"),
            Arc::clone(&transport) as Arc<dyn HttpTransport>,
        )
        .expect("client builds");
        let controller = ConversationController::new(Arc::new(client), Arc::new(NoopUsageTracker));
        (controller, transport)
    }

    async fn drive(controller: &mut ConversationController, mut stream: ChatStream) {
        while let Some(event) = stream.recv().await {
            let terminal = event.terminal_transition().is_some();
            controller.handle_stream_event(event);
            if terminal {
                return;
            }
        }
        controller.handle_stream_closed(stream.target());
    }

    fn contents(controller: &ConversationController) -> Vec<(Role, &str)> {
        controller
            .messages()
            .iter()
            .map(|message| (message.role, message.content.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn streams_reply_into_assistant_message() {
        let (mut controller, _) = controller_with([ScriptedResponse::deltas(&["He", "llo"])]);
        controller.set_input("  Hi  ");

        let stream = controller.send(Some("model-a")).expect("request started");
        assert!(controller.is_loading());
        assert!(!controller.is_streaming_started());
        assert_eq!(controller.input(), "");
        drive(&mut controller, stream).await;

        assert_eq!(
            contents(&controller),
            vec![(Role::User, "Hi"), (Role::Assistant, "Hello")]
        );
        assert!(controller.messages().iter().all(|message| message.belongs_to("model-a")));
        assert_eq!(controller.phase(), ConversationState::Idle);
        assert!(controller.error().is_none());

        let metrics = controller.metrics();
        assert!(metrics.request_duration.is_some_and(|duration| duration > 0.0));
        assert_eq!(metrics.total_tokens, Some(4));
    }

    #[tokio::test]
    async fn blank_input_and_busy_state_are_no_ops() {
        let (response, _body) = ScriptedResponse::live(200);
        let (mut controller, transport) = controller_with([response]);

        controller.set_input("   ");
        assert!(controller.send(Some("model-a")).is_none());
        assert!(controller.messages().is_empty());

        controller.set_input("first");
        let _stream = controller.send(Some("model-a")).expect("request started");
        controller.set_input("second");
        assert!(controller.send(Some("model-a")).is_none());

        assert_eq!(controller.input(), "second");
        assert_eq!(contents(&controller), vec![(Role::User, "first")]);
        tokio::task::yield_now().await;
        assert!(transport.requests().len() <= 1);
    }

    #[tokio::test]
    async fn missing_model_sets_validation_message() {
        let (mut controller, transport) = controller_with([]);
        controller.set_input("hello");

        assert!(controller.send(None).is_none());
        assert!(controller.send(Some("  ")).is_none());

        assert_eq!(controller.error(), Some(SELECT_MODEL_MESSAGE));
        assert_eq!(controller.input(), "hello");
        assert!(controller.messages().is_empty());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn history_is_filtered_to_the_selected_model() {
        let (mut controller, transport) = controller_with([
            ScriptedResponse::deltas(&["from a"]),
            ScriptedResponse::deltas(&["from b"]),
            ScriptedResponse::deltas(&["again a"]),
        ]);

        for (model, text) in [("model-a", "to a"), ("model-b", "to b"), ("model-a", "next")] {
            controller.set_input(text);
            let stream = controller.send(Some(model)).expect("request started");
            drive(&mut controller, stream).await;
        }

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        let body = requests[2].body_json();
        assert_eq!(body["model"], "model-a");
        assert_eq!(
            body["messages"],
            json!([
                { "role": "user", "content": "to a" },
                { "role": "assistant", "content": "from a" },
                { "role": "user", "content": "next" }
            ])
        );
        assert_eq!(controller.messages().len(), 6);
    }

    #[tokio::test]
    async fn failure_before_first_delta_keeps_only_user_message() {
        let (mut controller, _) = controller_with([ScriptedResponse::json(
            500,
            json!({ "error": { "message": "boom" } }),
        )]);
        controller.set_input("hello");

        let stream = controller.send(Some("model-a")).expect("request started");
        drive(&mut controller, stream).await;

        assert_eq!(contents(&controller), vec![(Role::User, "hello")]);
        assert_eq!(controller.error(), Some("inference API error: 500 - boom"));
        assert_eq!(controller.phase(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn failure_mid_stream_removes_partial_reply() {
        let (response, body) = ScriptedResponse::live(200);
        let (mut controller, _) = controller_with([response]);
        controller.set_input("hello");

        let stream = controller.send(Some("model-a")).expect("request started");
        body.send_delta("partial");
        body.fail("connection reset");
        drive(&mut controller, stream).await;

        assert_eq!(contents(&controller), vec![(Role::User, "hello")]);
        let error = controller.error().expect("error surfaced");
        assert!(error.contains("connection reset"));
    }

    #[tokio::test]
    async fn model_not_found_surfaces_friendly_message() {
        let (mut controller, _) = controller_with([ScriptedResponse::json(
            404,
            json!({ "error": { "message": "Model not found, inaccessible, and/or not deployed" } }),
        )]);
        controller.set_input("hello");

        let stream = controller.send(Some("gone")).expect("request started");
        drive(&mut controller, stream).await;

        assert_eq!(controller.error(), Some(kindle_llm::MODEL_UNAVAILABLE_MESSAGE));
    }

    #[tokio::test]
    async fn cancel_keeps_partial_reply_and_silences_stream() {
        let (response, body) = ScriptedResponse::live(200);
        let (mut controller, _) = controller_with([response]);
        controller.set_input("hello");

        let mut stream = controller.send(Some("model-a")).expect("request started");
        body.send_delta("par");
        let event = stream.recv().await.expect("first delta arrives");
        assert!(controller.handle_stream_event(event));
        assert!(controller.is_streaming_started());

        assert!(controller.cancel());
        assert!(!controller.cancel());
        body.send_delta("late");
        body.send_done();

        assert!(stream.recv().await.is_none());
        controller.handle_stream_closed(stream.target());

        assert_eq!(
            contents(&controller),
            vec![(Role::User, "hello"), (Role::Assistant, "par")]
        );
        assert_eq!(controller.phase(), ConversationState::Idle);
        assert!(controller.error().is_none());
        assert!(controller.metrics().is_empty());
    }

    #[tokio::test]
    async fn superseded_request_events_are_rejected() {
        let (first, first_body) = ScriptedResponse::live(200);
        let (mut controller, transport) =
            controller_with([first, ScriptedResponse::deltas(&["fresh"])]);

        controller.set_input("one");
        let stale = controller.send(Some("model-a")).expect("first request");
        let stale_target = stale.target();
        // Let the first worker claim its response before it is superseded.
        while transport.requests().is_empty() {
            tokio::task::yield_now().await;
        }
        controller.cancel();

        controller.set_input("two");
        let fresh = controller.send(Some("model-a")).expect("second request");
        assert_ne!(fresh.target(), stale_target);

        first_body.send_delta("stale");
        assert!(!controller.handle_stream_event(ChatStreamEvent::new(
            stale_target,
            ChatStreamPayload::Delta("stale".to_string()),
        )));
        controller.handle_stream_closed(stale_target);
        drive(&mut controller, fresh).await;

        assert_eq!(
            contents(&controller),
            vec![
                (Role::User, "one"),
                (Role::User, "two"),
                (Role::Assistant, "fresh")
            ]
        );
        assert!(controller.error().is_none());
    }

    #[tokio::test]
    async fn closed_stream_without_terminal_event_fails() {
        let (response, _body) = ScriptedResponse::live(200);
        let (mut controller, _) = controller_with([response]);
        controller.set_input("hello");

        let stream = controller.send(Some("model-a")).expect("request started");
        controller.handle_stream_closed(stream.target());

        assert_eq!(controller.error(), Some(STREAM_CLOSED_MESSAGE));
        assert!(!controller.is_loading());
    }

    #[tokio::test]
    async fn clear_history_resets_conversation() {
        let (mut controller, _) = controller_with([ScriptedResponse::deltas(&["ok"])]);
        controller.set_input("hello");
        let stream = controller.send(Some("model-a")).expect("request started");
        drive(&mut controller, stream).await;
        controller.set_error(Some("stale".to_string()));

        controller.clear_history();

        assert!(controller.messages().is_empty());
        assert!(controller.error().is_none());
        assert_eq!(controller.phase(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn usage_is_tracked_when_a_message_is_sent() {
        let transport = Arc::new(ScriptedTransport::with_responses([
            ScriptedResponse::deltas(&["a"]),
            ScriptedResponse::deltas(&["b"]),
        ]));
        let client = CompletionClient::with_transport(ClientConfig::new("k"), transport)
            .expect("client builds");
        let recent = Arc::new(RecentModels::new(vec![
            ModelInfo::new("model-a", "A", "Fireworks"),
            ModelInfo::new("model-b", "B", "Fireworks"),
        ]));
        let mut controller = ConversationController::new(
            Arc::new(client),
            Arc::clone(&recent) as Arc<dyn UsageTracker>,
        );

        for model in ["model-a", "model-b"] {
            controller.set_input("hi");
            let stream = controller.send(Some(model)).expect("request started");
            drive(&mut controller, stream).await;
        }

        let (current, previous) = recent.last_two().expect("two models used");
        assert_eq!(current.id, "model-b");
        assert_eq!(previous.id, "model-a");
    }

    #[tokio::test]
    async fn options_are_forwarded_with_each_request() {
        let (controller, transport) = controller_with([ScriptedResponse::deltas(&["ok"])]);
        let mut controller =
            controller.with_options(ChatOptions::default().with_temperature(0.1).with_max_tokens(64));
        controller.set_input("hello");

        let stream = controller.send(Some("model-a")).expect("request started");
        drive(&mut controller, stream).await;

        let body = transport.last_request().expect("request recorded").body_json();
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], true);
    }
}
