//! Orchestrator configuration
//!
//! Loaded from TOML; every field has a default, so an empty file (or no file
//! at all) yields the built-in setup: a local Ollama provider plus the
//! Anthropic API as remote fallback.
//!
//! ```toml
//! default_provider = "ollama"
//! default_model = "qwen2.5-coder:1.5b"
//!
//! [[providers]]
//! id = "ollama"
//! kind = "local"
//! endpoint = "http://localhost:11434"
//!
//! [health]
//! failure_threshold = 3
//! restore_blacklist = true
//!
//! [fallback]
//! priority = [{ model = "qwen2.5-coder:1.5b" }, { provider = "anthropic", model = "claude-3-haiku-20240307" }]
//!
//! [timeouts]
//! inference_first_token = 90
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{HealthPolicy, PriorityEntry};
use crate::manager::ManagerSettings;
use crate::provider::{ProviderConfig, RemoteApi};
use crate::registry::RegistryError;
use crate::secrets::{expand_home, SecretsResolver, STORE_PATH_ENV};
use crate::session::{AutosaveConfig, DEFAULT_SESSION_PATH};
use crate::timeouts::TimeoutPolicy;

pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Whether recovery keeps blacklisted models blacklisted.
    pub restore_blacklist: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_base_ms: 2000,
            backoff_max_ms: 60_000,
            restore_blacklist: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub priority: Vec<PriorityEntry>,
    /// Models that are blacklisted as soon as they are discovered.
    pub known_incompatible: Vec<String>,
    /// Pull a missing priority model onto a local provider when nothing
    /// catalogued can be selected.
    pub auto_pull: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            priority: ["qwen2.5-coder:1.5b", "deepseek-r1:1.5b", "phi:latest", "gemma2:latest"]
                .into_iter()
                .map(PriorityEntry::model)
                .collect(),
            known_incompatible: vec!["qwen2.5-coder:0.5b".to_string(), "llama3.2:1b".to_string()],
            auto_pull: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub path: PathBuf,
    pub autosave_interval_secs: u64,
    pub debounce_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SESSION_PATH),
            autosave_interval_secs: 60,
            debounce_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Store file; `~/` is expanded. `SQL_AGENT_SECRETS_FILE` wins over it.
    pub path: Option<String>,
}

// ============================================================================
// Top level
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub default_provider: String,
    pub default_model: String,
    pub default_database: String,
    pub providers: Vec<ProviderConfig>,
    pub health: HealthConfig,
    pub fallback: FallbackConfig,
    pub session: SessionConfig,
    pub secrets: SecretsConfig,
    /// Category name to whole seconds; environment overrides win.
    pub timeouts: BTreeMap<String, toml::Value>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_provider: "ollama".to_string(),
            default_model: "qwen2.5-coder:1.5b".to_string(),
            default_database: String::new(),
            providers: default_providers(),
            health: HealthConfig::default(),
            fallback: FallbackConfig::default(),
            session: SessionConfig::default(),
            secrets: SecretsConfig::default(),
            timeouts: BTreeMap::new(),
        }
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    // OLLAMA_HOST: Ollama server address, with or without scheme
    let ollama = std::env::var("OLLAMA_HOST")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(|s| normalize_endpoint(&s))
        .unwrap_or_else(|| DEFAULT_OLLAMA_ENDPOINT.to_string());

    vec![
        ProviderConfig::local("ollama", ollama),
        ProviderConfig::remote("anthropic", DEFAULT_ANTHROPIC_ENDPOINT)
            .with_credential_ref("ANTHROPIC_API_KEY")
            .with_api(RemoteApi::Anthropic)
            .with_models(["claude-3-haiku-20240307"]),
    ]
}

fn normalize_endpoint(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    }
}

impl OrchestratorConfig {
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` if given, else the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ConfigError::Invalid("provider with empty id".to_string()));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.health.backoff_base_ms == 0 || self.health.backoff_max_ms < self.health.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "health backoff requires 0 < backoff_base_ms <= backoff_max_ms".to_string(),
            ));
        }
        if self.session.autosave_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.autosave_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Compiled defaults, then `[timeouts]`, then `OLLAMA_TIMEOUT_*`.
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        let file_layer = self.timeouts.iter().map(|(name, value)| {
            let raw = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (name.clone(), raw)
        });
        TimeoutPolicy::from_overrides(file_layer).with_env(|var| std::env::var(var).ok())
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: self.health.failure_threshold,
            backoff_base: Duration::from_millis(self.health.backoff_base_ms),
            backoff_max: Duration::from_millis(self.health.backoff_max_ms),
            restore_blacklist: self.health.restore_blacklist,
        }
    }

    pub fn secrets_resolver(&self) -> SecretsResolver {
        let from_env = std::env::var(STORE_PATH_ENV).ok().filter(|s| !s.is_empty());
        match (from_env, self.secrets.path.as_deref()) {
            (Some(_), _) | (None, None) => SecretsResolver::new(SecretsResolver::default_path()),
            (None, Some(path)) => SecretsResolver::new(expand_home(path)),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            default_provider: self.default_provider.clone(),
            default_model: self.default_model.clone(),
            default_database: self.default_database.clone(),
            priority: self.fallback.priority.clone(),
            known_incompatible: self.fallback.known_incompatible.clone(),
            auto_pull: self.fallback.auto_pull,
            health: self.health_policy(),
        }
    }

    pub fn autosave_config(&self) -> AutosaveConfig {
        AutosaveConfig {
            interval: Duration::from_secs(self.session.autosave_interval_secs),
            debounce: Duration::from_millis(self.session.debounce_ms),
        }
    }

    pub fn session_path(&self) -> &Path {
        &self.session.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use crate::timeouts::OperationCategory;

    #[test]
    fn test_defaults_validate() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].kind, ProviderKind::Local);
        assert_eq!(config.providers[1].credential_key(), "ANTHROPIC_API_KEY");
        assert_eq!(config.fallback.priority[0].model, "qwen2.5-coder:1.5b");
        assert_eq!(config.health_policy(), HealthPolicy::default());
        assert!(config.manager_settings().auto_pull);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = OrchestratorConfig::from_toml("").unwrap();
        assert_eq!(config.default_model, "qwen2.5-coder:1.5b");
        assert_eq!(config.session.path, PathBuf::from(DEFAULT_SESSION_PATH));
    }

    #[test]
    fn test_full_toml() {
        let config = OrchestratorConfig::from_toml(
            r#"
            default_provider = "local-a"
            default_model = "m1"

            [[providers]]
            id = "local-a"
            kind = "local"
            endpoint = "http://127.0.0.1:11434"

            [[providers]]
            id = "remote-b"
            kind = "remote"
            endpoint = "https://llm.example.com/v1"
            api = "openai"
            models = ["gpt-4o-mini"]

            [health]
            failure_threshold = 5
            restore_blacklist = false

            [fallback]
            priority = [{ provider = "remote-b", model = "gpt-4o-mini" }, { model = "m1" }]
            known_incompatible = []
            auto_pull = false

            [session]
            path = "/tmp/state.json"
            debounce_ms = 100

            [timeouts]
            api_calls = 12
            inference_first_token = "45"
            "#,
        )
        .unwrap();

        assert_eq!(config.providers[1].api, RemoteApi::OpenAi);
        assert_eq!(config.providers[1].credential_key(), "remote-b");
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.backoff_base_ms, 2000);
        assert!(!config.health_policy().restore_blacklist);
        assert!(!config.manager_settings().auto_pull);
        assert_eq!(config.fallback.priority[0], PriorityEntry::pinned("remote-b", "gpt-4o-mini"));
        assert_eq!(config.autosave_config().debounce, Duration::from_millis(100));
        assert_eq!(config.autosave_config().interval, Duration::from_secs(60));

        let file_only = TimeoutPolicy::from_overrides(
            config
                .timeouts
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))),
        );
        assert_eq!(file_only.get(OperationCategory::ApiCalls), Duration::from_secs(12));
        assert_eq!(
            file_only.get(OperationCategory::InferenceFirstToken),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let err = OrchestratorConfig::from_toml(
            r#"
            [[providers]]
            id = "a"
            kind = "local"
            endpoint = "http://localhost:1"

            [[providers]]
            id = "a"
            kind = "remote"
            endpoint = "https://x"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = OrchestratorConfig::from_toml("[health]\nfailure_threshold = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            OrchestratorConfig::from_toml("default_model = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("0.0.0.0:11434"), "http://0.0.0.0:11434");
        assert_eq!(normalize_endpoint("https://gpu-box:11434/"), "https://gpu-box:11434");
    }
}
