use snafu::Snafu;

/// Display text for a model the inference API does not serve.
pub const MODEL_UNAVAILABLE_MESSAGE: &str =
    "Model is not available or deployed. Please select a different model.";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LlmError {
    #[snafu(display("inference API key is required"))]
    MissingApiKey { stage: &'static str },
    #[snafu(display("inference API key cannot be sent as a header value"))]
    InvalidApiKey {
        stage: &'static str,
        source: reqwest::header::InvalidHeaderValue,
    },
    #[snafu(display("inference API error: {status} - {message}"))]
    Api {
        stage: &'static str,
        status: u16,
        message: String,
    },
    #[snafu(display("{}", MODEL_UNAVAILABLE_MESSAGE))]
    ModelUnavailable {
        stage: &'static str,
        status: u16,
        upstream: String,
    },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to encode request body on `{stage}`: {source}"))]
    EncodeRequest {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode response body on `{stage}`: {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("model catalog endpoint returned status {status}"))]
    ModelFetchStatus { stage: &'static str, status: u16 },
    #[snafu(display("failed to parse model catalog: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("response stream failed on `{stage}`: {message}"))]
    StreamRead {
        stage: &'static str,
        message: String,
    },
}

impl LlmError {
    /// Upstream HTTP status for errors that came from a non-success response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::ModelUnavailable { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Configuration errors are fatal for the client and are never retried.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::MissingApiKey { .. } | Self::InvalidApiKey { .. })
    }
}

pub type LlmResult<T> = Result<T, LlmError>;
