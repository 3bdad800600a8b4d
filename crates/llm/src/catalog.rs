use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use crate::error::{
    DecodeResponseSnafu, LlmResult, ModelFetchStatusSnafu, ModelPayloadParseSnafu,
};
use crate::transport::{HttpRequest, HttpTransport};

pub const MODELS_API_URL: &str = "https://app.fireworks.ai/api/models/mini-playground";

const DEFAULT_PROVIDER: &str = "Fireworks";

/// Per-million-token prices as published by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCost {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_token_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_token_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_price: Option<f64>,
}

impl ModelCost {
    /// Flat token price when set and non-zero, otherwise the input price.
    pub fn headline_price(&self) -> Option<f64> {
        self.token_price
            .filter(|price| *price != 0.0)
            .or(self.input_token_price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<ModelCost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serverless: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_image_input: Option<bool>,
}

impl ModelInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: provider.into(),
            description: None,
            context_length: None,
            tags: Vec::new(),
            cost: None,
            serverless: None,
            supports_image_input: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_context_length(mut self, context_length: u64) -> Self {
        self.context_length = Some(context_length);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost(mut self, cost: ModelCost) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_serverless(mut self, serverless: bool) -> Self {
        self.serverless = Some(serverless);
        self
    }

    /// Display name, falling back to the id when the catalog had no title.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCatalogSource {
    ProviderApi,
    StaticFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    pub models: Vec<ModelInfo>,
    pub source: ModelCatalogSource,
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn from_provider_api(models: Vec<ModelInfo>) -> Self {
        Self {
            models,
            source: ModelCatalogSource::ProviderApi,
            warning: None,
        }
    }

    pub fn from_static_fallback(warning: String) -> Self {
        Self {
            models: fallback_models(),
            source: ModelCatalogSource::StaticFallback,
            warning: Some(warning),
        }
    }

    pub fn find(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|model| model.id == model_id)
    }

    pub fn first(&self) -> Option<&ModelInfo> {
        self.models.first()
    }

    pub fn is_fallback(&self) -> bool {
        self.source == ModelCatalogSource::StaticFallback
    }
}

/// Serverless models offered when the catalog endpoint cannot be used.
pub fn fallback_models() -> Vec<ModelInfo> {
    let serverless = |id: &str, name: &str, provider: &str, description: &str, context: u64| {
        ModelInfo::new(id, name, provider)
            .with_description(description)
            .with_context_length(context)
            .with_tags(["LLM", "Serverless"])
            .with_serverless(true)
    };

    vec![
        serverless(
            "accounts/fireworks/models/llama-v3p1-405b-instruct",
            "Llama 3.1 405B Instruct",
            "Meta",
            "Most capable Llama model",
            128_000,
        ),
        serverless(
            "accounts/fireworks/models/llama-v3p1-70b-instruct",
            "Llama 3.1 70B Instruct",
            "Meta",
            "Balanced performance and speed",
            128_000,
        ),
        serverless(
            "accounts/fireworks/models/llama-v3p1-8b-instruct",
            "Llama 3.1 8B Instruct",
            "Meta",
            "Fast and efficient",
            128_000,
        ),
        serverless(
            "accounts/fireworks/models/mixtral-8x7b-instruct",
            "Mixtral 8x7B Instruct",
            "Mistral",
            "Mixture of experts model",
            32_000,
        ),
        serverless(
            "accounts/fireworks/models/qwen2p5-72b-instruct",
            "Qwen 2.5 72B Instruct",
            "Qwen",
            "Advanced reasoning capabilities",
            32_000,
        ),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogPayload {
    List(Vec<RawModel>),
    Wrapped {
        #[serde(default)]
        models: Vec<RawModel>,
    },
}

impl CatalogPayload {
    fn into_models(self) -> Vec<RawModel> {
        match self {
            Self::List(models) | Self::Wrapped { models } => models,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProvider {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawModel {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    provider: Option<RawProvider>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    context_length: Option<u64>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    cost: Option<ModelCost>,
    #[serde(default)]
    serverless: Option<bool>,
    #[serde(default)]
    supports_image_input: Option<bool>,
}

impl RawModel {
    /// Entries without a model name cannot be requested and are dropped.
    fn into_model_info(self) -> Option<ModelInfo> {
        let id = self.name.filter(|name| !name.trim().is_empty())?;
        let name = self
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        let provider = self
            .provider
            .and_then(|provider| provider.name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

        Some(ModelInfo {
            id,
            name,
            provider,
            description: Some(self.description.unwrap_or_default()),
            context_length: self.context_length,
            tags: self.tags.unwrap_or_default(),
            cost: self.cost,
            serverless: self.serverless,
            supports_image_input: self.supports_image_input,
        })
    }
}

fn parse_catalog(payload: &[u8]) -> LlmResult<Vec<ModelInfo>> {
    let payload: CatalogPayload = serde_json::from_slice(payload).context(DecodeResponseSnafu {
        stage: "decode-model-catalog",
    })?;
    let models = payload
        .into_models()
        .into_iter()
        .filter_map(RawModel::into_model_info)
        .collect::<Vec<_>>();

    ensure!(
        !models.is_empty(),
        ModelPayloadParseSnafu {
            stage: "validate-model-catalog",
            details: "no valid models found in API response",
        }
    );
    Ok(models)
}

async fn request_catalog(transport: &dyn HttpTransport, url: &str) -> LlmResult<Vec<ModelInfo>> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let response = transport
        .send(HttpRequest {
            method: Method::GET,
            url: url.to_string(),
            headers,
            body: None,
        })
        .await?;

    ensure!(
        response.status.is_success(),
        ModelFetchStatusSnafu {
            stage: "model-catalog-status",
            status: response.status.as_u16(),
        }
    );

    let payload = response.bytes().await?;
    parse_catalog(&payload)
}

/// Loads the model catalog, degrading to [`fallback_models`] on any failure.
pub async fn fetch_models(transport: &dyn HttpTransport, url: &str) -> ModelCatalog {
    match request_catalog(transport, url).await {
        Ok(models) => {
            tracing::debug!(model_count = models.len(), "loaded model catalog");
            ModelCatalog::from_provider_api(models)
        }
        Err(error) => {
            tracing::warn!(url = %url, error = %error, "failed to fetch models, using fallback list");
            ModelCatalog::from_static_fallback(format!("Failed to fetch models: {error}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{ScriptedResponse, ScriptedTransport};

    #[tokio::test]
    async fn maps_wrapped_payload_fields() {
        let transport = ScriptedTransport::with_responses([ScriptedResponse::json(
            200,
            json!({
                "models": [{
                    "name": "accounts/fireworks/models/deepseek-v3",
                    "title": "DeepSeek V3",
                    "provider": { "name": "DeepSeek" },
                    "contextLength": 131072,
                    "tags": ["LLM", "Serverless"],
                    "cost": { "inputTokenPrice": 0.9, "outputTokenPrice": 0.9 },
                    "serverless": true,
                    "supportsImageInput": false,
                    "unrelated": 1
                }]
            }),
        )]);

        let catalog = fetch_models(&transport, MODELS_API_URL).await;

        assert_eq!(catalog.source, ModelCatalogSource::ProviderApi);
        assert!(catalog.warning.is_none());
        let model = catalog
            .find("accounts/fireworks/models/deepseek-v3")
            .expect("model mapped");
        assert_eq!(model.name, "DeepSeek V3");
        assert_eq!(model.provider, "DeepSeek");
        assert_eq!(model.description.as_deref(), Some(""));
        assert_eq!(model.context_length, Some(131_072));
        assert_eq!(model.cost.and_then(|cost| cost.headline_price()), Some(0.9));
        assert_eq!(model.supports_image_input, Some(false));

        let request = transport.last_request().expect("request recorded");
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url, MODELS_API_URL);
    }

    #[tokio::test]
    async fn accepts_bare_array_and_fills_defaults() {
        let transport = ScriptedTransport::with_responses([ScriptedResponse::json(
            200,
            json!([{ "name": "accounts/x/models/tiny" }, { "title": "nameless" }]),
        )]);

        let catalog = fetch_models(&transport, MODELS_API_URL).await;

        assert_eq!(catalog.models.len(), 1);
        let model = catalog.first().expect("one model");
        assert_eq!(model.name, "accounts/x/models/tiny");
        assert_eq!(model.provider, "Fireworks");
        assert!(model.tags.is_empty());
    }

    #[tokio::test]
    async fn falls_back_on_failure() {
        let transport = ScriptedTransport::with_responses([
            ScriptedResponse::json(500, json!({ "error": "down" })),
            ScriptedResponse::chunks(200, vec!["<html>".to_string()]),
            ScriptedResponse::json(200, json!({ "models": [] })),
        ]);

        for _ in 0..3 {
            let catalog = fetch_models(&transport, MODELS_API_URL).await;
            assert!(catalog.is_fallback());
            assert!(catalog.warning.is_some());
            assert_eq!(catalog.models, fallback_models());
        }

        // Transport failure: the scripted queue is now empty.
        let catalog = fetch_models(&transport, MODELS_API_URL).await;
        assert!(catalog.is_fallback());
    }

    #[test]
    fn fallback_list_has_five_serverless_models() {
        let models = fallback_models();
        assert_eq!(models.len(), 5);
        assert!(models.iter().all(|model| model.serverless == Some(true)));
        assert_eq!(models[0].id, "accounts/fireworks/models/llama-v3p1-405b-instruct");
        assert_eq!(models[3].context_length, Some(32_000));
    }

    #[test]
    fn headline_price_prefers_non_zero_token_price() {
        let flat = ModelCost {
            token_price: Some(0.2),
            input_token_price: Some(0.5),
            ..ModelCost::default()
        };
        let zero_flat = ModelCost {
            token_price: Some(0.0),
            input_token_price: Some(0.5),
            ..ModelCost::default()
        };

        assert_eq!(flat.headline_price(), Some(0.2));
        assert_eq!(zero_flat.headline_price(), Some(0.5));
        assert_eq!(ModelCost::default().headline_price(), None);
    }
}
