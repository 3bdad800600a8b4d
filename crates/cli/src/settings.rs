use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use kindle_llm::{ChatOptions, ClientConfig, DEFAULT_BASE_URL, MODELS_API_URL};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "kindle";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "KINDLE_";
pub const API_KEY_ENV: &str = "FIREWORKS_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_models_url")]
    pub models_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            models_url: default_models_url(),
            default_model: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }
}

impl Settings {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.api_key.clone()).with_base_url(self.base_url.clone())
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
        }
    }

    pub fn normalized(mut self) -> Self {
        self.api_key = self.api_key.trim().to_string();
        self.base_url = non_blank(&self.base_url).unwrap_or_else(default_base_url);
        self.models_url = non_blank(&self.models_url).unwrap_or_else(default_models_url);
        self.default_model = self.default_model.as_deref().and_then(non_blank);
        self
    }
}

/// Layered settings: defaults, then the JSON file, then the environment.
///
/// Only the defaults-plus-file layer is ever written back, so secrets supplied
/// through the environment never end up on disk.
pub struct SettingsStore {
    persisted: ArcSwap<Settings>,
    effective: ArcSwap<Settings>,
    config_path: PathBuf,
    read_environment: bool,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".kindle"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self::build(config_path, true)
    }

    /// Store that ignores `KINDLE_*` and `FIREWORKS_API_KEY`.
    pub fn without_environment(config_path: PathBuf) -> Self {
        Self::build(config_path, false)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    fn build(config_path: PathBuf, read_environment: bool) -> Self {
        let persisted = Self::load_from_disk(&config_path);
        let effective = layer_environment(&persisted, read_environment);
        Self {
            persisted: ArcSwap::from_pointee(persisted),
            effective: ArcSwap::from_pointee(effective),
            config_path,
            read_environment,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Effective settings, environment included.
    pub fn settings(&self) -> Arc<Settings> {
        self.effective.load_full()
    }

    /// Normalizes and persists `settings` as the file layer.
    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        let effective = layer_environment(&normalized_settings, self.read_environment);
        self.persisted.store(Arc::new(normalized_settings));
        self.effective.store(Arc::new(effective));
        Ok(())
    }

    pub fn set_default_model(&self, model_id: &str) -> Result<(), SettingsError> {
        let mut settings = self.persisted.load().as_ref().clone();
        settings.default_model = Some(model_id.to_string());
        self.update(settings)
    }

    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
            return Settings::default();
        }

        let figment = Figment::from(Serialized::defaults(Settings::default())).merge(Json::file(path));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

fn layer_environment(base: &Settings, read_environment: bool) -> Settings {
    if !read_environment {
        return base.clone();
    }

    let figment = Figment::from(Serialized::defaults(base.clone()))
        .merge(Env::raw().only(&[API_KEY_ENV]).map(|_| "api_key".into()))
        .merge(Env::prefixed(ENV_PREFIX));

    match figment.extract::<Settings>() {
        Ok(settings) => settings.normalized(),
        Err(error) => {
            tracing::warn!(error = %error, "ignoring invalid settings from environment");
            base.clone()
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_models_url() -> String {
    MODELS_API_URL.to_string()
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("kindle-settings-{}", uuid::Uuid::now_v7()))
            .join(SETTINGS_FILE_NAME)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::without_environment(scratch_path());
        let settings = store.settings();

        assert_eq!(*settings, Settings::default());
        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert!(!settings.has_api_key());
    }

    #[test]
    fn file_values_override_defaults() {
        let path = scratch_path();
        std::fs::create_dir_all(path.parent().expect("scratch dir")).expect("create dir");
        std::fs::write(
            &path,
            r#"{ "api_key": "  fw-key  ", "default_model": "accounts/x/models/y", "max_tokens": 256 }"#,
        )
        .expect("write settings");

        let settings = SettingsStore::without_environment(path).settings();

        assert_eq!(settings.api_key, "fw-key");
        assert_eq!(settings.default_model.as_deref(), Some("accounts/x/models/y"));
        assert_eq!(settings.models_url, MODELS_API_URL);
        assert_eq!(settings.chat_options().max_tokens, Some(256));
        assert_eq!(settings.chat_options().temperature, None);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let path = scratch_path();
        std::fs::create_dir_all(path.parent().expect("scratch dir")).expect("create dir");
        std::fs::write(&path, "{ not json").expect("write settings");

        let settings = SettingsStore::without_environment(path).settings();

        assert_eq!(*settings, Settings::default());
    }

    #[test]
    fn default_model_is_persisted_atomically() {
        let path = scratch_path();
        let store = SettingsStore::without_environment(path.clone());

        store
            .set_default_model("accounts/fireworks/models/mixtral-8x7b-instruct")
            .expect("settings persist");

        assert!(!path.with_extension("json.tmp").exists());
        let reloaded = SettingsStore::without_environment(path).settings();
        assert_eq!(
            reloaded.default_model.as_deref(),
            Some("accounts/fireworks/models/mixtral-8x7b-instruct")
        );
        assert_eq!(
            store.settings().default_model,
            reloaded.default_model
        );
    }

    #[test]
    fn environment_layers_over_file_without_being_persisted() {
        figment::Jail::expect_with(|jail| {
            let path = jail.directory().join(SETTINGS_FILE_NAME);
            jail.create_file(&path, r#"{ "max_tokens": 256, "top_p": 0.5 }"#)?;
            jail.set_env(API_KEY_ENV, "fw-from-env");
            jail.set_env("KINDLE_MAX_TOKENS", "77");

            let store = SettingsStore::new(path.clone());
            let settings = store.settings();
            assert_eq!(settings.api_key, "fw-from-env");
            assert_eq!(settings.max_tokens, Some(77));
            assert_eq!(settings.top_p, Some(0.5));

            store
                .set_default_model("accounts/fireworks/models/llama-v3p1-8b-instruct")
                .expect("settings persist");

            let written = std::fs::read_to_string(&path).expect("read settings");
            assert!(!written.contains("fw-from-env"));
            assert!(!written.contains("api_key"));
            assert!(written.contains("\"max_tokens\": 256"));

            let effective = store.settings();
            assert_eq!(effective.api_key, "fw-from-env");
            assert_eq!(effective.max_tokens, Some(77));
            assert_eq!(
                effective.default_model.as_deref(),
                Some("accounts/fireworks/models/llama-v3p1-8b-instruct")
            );
            Ok(())
        });
    }

    #[test]
    fn empty_api_key_is_not_written() {
        let path = scratch_path();
        let store = SettingsStore::without_environment(path.clone());

        store.set_default_model("model-a").expect("settings persist");

        let written = std::fs::read_to_string(&path).expect("read settings");
        assert!(!written.contains("api_key"));
        let reloaded = SettingsStore::without_environment(path).settings();
        assert_eq!(reloaded.api_key, "");
        assert_eq!(reloaded.default_model.as_deref(), Some("model-a"));
    }

    #[test]
    fn normalization_restores_blank_urls() {
        let settings = Settings {
            base_url: "   ".to_string(),
            models_url: String::new(),
            default_model: Some(" ".to_string()),
            ..Settings::default()
        }
        .normalized();

        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert_eq!(settings.models_url, MODELS_API_URL);
        assert_eq!(settings.default_model, None);
    }
}
