use std::process::ExitCode;
use std::sync::Arc;

use kindle::SettingsStore;
use kindle::app::run;
use kindle::settings::API_KEY_ENV;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries streamed replies, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let settings = Arc::new(SettingsStore::load());
    match run(Arc::clone(&settings)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) if error.is_config() => {
            eprintln!("Configuration error: {error}");
            eprintln!(
                "Set {API_KEY_ENV} or add \"api_key\" to {} and restart.",
                settings.config_path().display()
            );
            ExitCode::FAILURE
        }
        Err(error) => {
            tracing::error!(error = %error, "kindle stopped");
            ExitCode::FAILURE
        }
    }
}
