use crate::ids::{MessageId, StreamTarget};

/// Request lifecycle for the conversation.
///
/// `Sending` waits for the first delta; `Streaming` owns the open assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    #[default]
    Idle,
    Sending(StreamTarget),
    Streaming {
        target: StreamTarget,
        assistant_id: MessageId,
    },
}

/// State transition input for the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTransition {
    Start(StreamTarget),
    FirstDelta {
        target: StreamTarget,
        assistant_id: MessageId,
    },
    Complete(StreamTarget),
    Fail(StreamTarget),
    Cancel(StreamTarget),
    Reset,
}

/// Rejection reason for stale or illegal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTransitionRejection {
    AlreadyBusy {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveRequest,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type ChatTransitionResult = Result<ConversationState, ChatTransitionRejection>;

impl ConversationState {
    /// Target of the in-flight request, if any.
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Idle => None,
            Self::Sending(target) | Self::Streaming { target, .. } => Some(*target),
        }
    }

    /// Open assistant message, present only while streaming.
    pub fn assistant_id(&self) -> Option<MessageId> {
        match self {
            Self::Streaming { assistant_id, .. } => Some(*assistant_id),
            Self::Idle | Self::Sending(_) => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    /// Returns true when an event tagged with `target` belongs to the live request.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        self.active_target() == Some(target)
    }

    /// Applies one transition deterministically.
    ///
    /// Only `Idle` may start a request. Every other transition must name the live target.
    pub fn apply(&self, transition: ChatTransition) -> ChatTransitionResult {
        match transition {
            ChatTransition::Start(target) => self.apply_start(target),
            ChatTransition::FirstDelta {
                target,
                assistant_id,
            } => self.apply_first_delta(target, assistant_id),
            ChatTransition::Complete(target)
            | ChatTransition::Fail(target)
            | ChatTransition::Cancel(target) => self.apply_terminal(target),
            ChatTransition::Reset => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, target: StreamTarget) -> ChatTransitionResult {
        match self.active_target() {
            Some(active) if active == target => Ok(*self),
            Some(active) => Err(ChatTransitionRejection::AlreadyBusy {
                active,
                attempted: target,
            }),
            None => Ok(Self::Sending(target)),
        }
    }

    fn apply_first_delta(
        &self,
        target: StreamTarget,
        assistant_id: MessageId,
    ) -> ChatTransitionResult {
        match self {
            Self::Sending(active) if *active == target => Ok(Self::Streaming {
                target,
                assistant_id,
            }),
            Self::Streaming { target: active, .. } if *active == target => Ok(*self),
            Self::Sending(active) | Self::Streaming { target: active, .. } => {
                Err(ChatTransitionRejection::SessionMismatch {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Idle => Err(ChatTransitionRejection::NoActiveRequest),
        }
    }

    fn apply_terminal(&self, target: StreamTarget) -> ChatTransitionResult {
        match self.active_target() {
            Some(active) if active == target => Ok(Self::Idle),
            Some(active) => Err(ChatTransitionRejection::SessionMismatch {
                active,
                attempted: target,
            }),
            None => Err(ChatTransitionRejection::NoActiveRequest),
        }
    }
}
