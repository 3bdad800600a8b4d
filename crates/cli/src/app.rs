use std::sync::Arc;

use kindle_chat::{ConversationController, RecentModels, UsageTracker};
use kindle_llm::{CompletionClient, fetch_models};
use snafu::ResultExt;

use crate::error::{AppResult, ClientSnafu};
use crate::settings::SettingsStore;
use crate::shell::Shell;

/// Builds the client from `settings`, loads the catalog and runs the shell to completion.
pub async fn run(settings: Arc<SettingsStore>) -> AppResult<()> {
    let current = settings.settings();
    let client = CompletionClient::new(current.client_config()).context(ClientSnafu {
        stage: "build-completion-client",
    })?;
    let client = Arc::new(client);

    let catalog = fetch_models(client.transport().as_ref(), &current.models_url).await;
    let selected_model = current
        .default_model
        .clone()
        .or_else(|| catalog.first().map(|model| model.id.clone()));
    tracing::info!(
        model_count = catalog.models.len(),
        fallback = catalog.is_fallback(),
        selected_model = ?selected_model,
        "model catalog ready"
    );

    let recent = Arc::new(RecentModels::new(catalog.models.clone()));
    let controller =
        ConversationController::new(client, Arc::clone(&recent) as Arc<dyn UsageTracker>)
            .with_options(current.chat_options());

    Shell::new(
        controller,
        catalog,
        recent,
        settings,
        selected_model,
        std::io::stdout(),
    )
    .run()
    .await
}
