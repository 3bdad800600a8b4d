use snafu::Snafu;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("settings update failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to start inference client on `{stage}`: {source}"))]
    Client {
        stage: &'static str,
        source: kindle_llm::LlmError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

impl AppError {
    /// Missing or unusable API key, which the user has to fix in configuration.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Client { source, .. } if source.is_config())
    }
}

pub type AppResult<T> = Result<T, AppError>;
