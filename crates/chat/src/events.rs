use kindle_llm::StreamEvent;

use crate::ids::StreamTarget;
use crate::state::ChatTransition;

/// Stream payload mapped into chat language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatStreamPayload {
    Delta(String),
    Finished,
    Failed(String),
}

/// One stream event tagged with the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatStreamEvent {
    pub target: StreamTarget,
    pub payload: ChatStreamPayload,
}

impl ChatStreamEvent {
    pub fn new(target: StreamTarget, payload: ChatStreamPayload) -> Self {
        Self { target, payload }
    }

    pub fn from_stream_event(target: StreamTarget, event: StreamEvent) -> Self {
        let payload = match event {
            StreamEvent::Delta(text) => ChatStreamPayload::Delta(text),
            StreamEvent::Finished => ChatStreamPayload::Finished,
            StreamEvent::Failed(error) => ChatStreamPayload::Failed(error.to_string()),
        };
        Self::new(target, payload)
    }

    /// Maps terminal payloads to lifecycle transitions.
    ///
    /// Deltas return `None`: they grow message content, the first one aside.
    pub fn terminal_transition(&self) -> Option<ChatTransition> {
        match self.payload {
            ChatStreamPayload::Delta(_) => None,
            ChatStreamPayload::Finished => Some(ChatTransition::Complete(self.target)),
            ChatStreamPayload::Failed(_) => Some(ChatTransition::Fail(self.target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use kindle_llm::LlmError;

    use super::*;
    use crate::ids::StreamSessionId;

    #[test]
    fn failures_carry_display_message() {
        let target = StreamTarget::new(StreamSessionId::new(4));
        let event = ChatStreamEvent::from_stream_event(
            target,
            StreamEvent::Failed(LlmError::Api {
                stage: "test",
                status: 500,
                message: "boom".to_string(),
            }),
        );

        assert_eq!(
            event.payload,
            ChatStreamPayload::Failed("inference API error: 500 - boom".to_string())
        );
        assert_eq!(event.terminal_transition(), Some(ChatTransition::Fail(target)));
    }
}
