use std::time::{SystemTime, UNIX_EPOCH};

use kindle_llm::{ChatMessage, Role};

use crate::ids::MessageId;

/// One conversation entry.
///
/// Only `content` changes after creation, and only by appending while the message is
/// the open assistant reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at_unix_millis: i64,
    pub model_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, model_id: Option<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            created_at_unix_millis: now_unix_millis(),
            model_id,
        }
    }

    pub fn user(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self::new(Role::User, content, Some(model_id.into()))
    }

    /// Empty assistant reply inserted when the first delta arrives.
    pub fn assistant_placeholder(model_id: impl Into<String>) -> Self {
        Self::new(Role::Assistant, String::new(), Some(model_id.into()))
    }

    pub fn belongs_to(&self, model_id: &str) -> bool {
        self.model_id.as_deref() == Some(model_id)
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}
