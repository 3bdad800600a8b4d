pub mod cancel;
pub mod catalog;
pub mod client;
pub mod decoder;
pub mod error;
pub mod metrics;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod types;

pub use cancel::{CancelHandle, CancelToken};
pub use catalog::{
    MODELS_API_URL, ModelCatalog, ModelCatalogSource, ModelCost, ModelInfo, fallback_models,
    fetch_models,
};
pub use client::{
    ClientConfig, CompletionClient, DEFAULT_BASE_URL, DeltaStream, StreamEvent, StreamHandle,
    StreamRequest, StreamWorker,
};
pub use decoder::{StreamDecoder, StreamOutcome, estimate_tokens};
pub use error::{LlmError, LlmResult, MODEL_UNAVAILABLE_MESSAGE};
pub use metrics::{MetricsAccumulator, NetworkMetrics};
pub use transport::{
    BoxFuture, ByteStream, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport,
};
pub use types::{
    ChatMessage, ChatOptions, CompletionResponse, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
    DEFAULT_TOP_P, ResolvedOptions, Role, Usage,
};
