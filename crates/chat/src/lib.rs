pub mod compare;
pub mod controller;
pub mod events;
pub mod ids;
pub mod message;
pub mod state;
pub mod usage;

pub use compare::{ChangeKind, ModelComparison, ModelSummary, insufficient_models_message};
pub use controller::{
    ChatStream, ConversationController, SELECT_MODEL_MESSAGE, STREAM_CLOSED_MESSAGE,
};
pub use events::{ChatStreamEvent, ChatStreamPayload};
pub use ids::{MessageId, StreamSessionId, StreamTarget};
pub use message::Message;
pub use state::{ChatTransition, ChatTransitionRejection, ConversationState};
pub use usage::{NoopUsageTracker, RecentModels, UsageTracker};
