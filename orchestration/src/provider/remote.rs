//! Hosted API provider
//!
//! The credential is resolved through [`SecretsResolver`] before every
//! request, so a key added with `set-key` or exported in the environment
//! takes effect on the next call. Each request runs under a single
//! `api_calls` deadline.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::debug;

use super::{
    classify_transport, extract_error_message, join_url, Completion, Provider, ProviderConfig,
    ProviderError, ProviderResult, RemoteApi, RequestBudget,
};
use crate::catalog::ModelDescriptor;
use crate::secrets::{Credential, SecretsError, SecretsResolver};
use crate::timeouts::{OperationCategory, TimeoutPolicy};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 2048;

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    completion_tokens: Option<u32>,
}

/// Hosted inference API.
pub struct RemoteProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    secrets: SecretsResolver,
}

impl RemoteProvider {
    pub fn new(
        config: ProviderConfig,
        timeouts: &TimeoutPolicy,
        secrets: SecretsResolver,
    ) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.get(OperationCategory::ConnectionCheck))
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;
        Ok(Self {
            config,
            client,
            secrets,
        })
    }

    async fn credential(&self) -> ProviderResult<Credential> {
        let key = self.config.credential_key();
        self.secrets.get_key_async(key).await.map_err(|e| match e {
            SecretsError::Io { .. } => ProviderError::CredentialStore(e.to_string()),
            SecretsError::CredentialNotFound { .. } | SecretsError::InvalidKey(_) => {
                ProviderError::CredentialNotFound(key.to_string())
            }
        })
    }

    fn build_request(
        &self,
        model_id: &str,
        prompt: &str,
        credential: &Credential,
    ) -> reqwest::RequestBuilder {
        match self.config.api {
            RemoteApi::Anthropic => {
                let body = serde_json::json!({
                    "model": model_id,
                    "max_tokens": MAX_OUTPUT_TOKENS,
                    "messages": [{ "role": "user", "content": prompt }],
                });
                self.client
                    .post(&self.config.endpoint)
                    .header("x-api-key", credential.expose())
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body)
            }
            RemoteApi::OpenAi => {
                let body = serde_json::json!({
                    "model": model_id,
                    "max_tokens": MAX_OUTPUT_TOKENS,
                    "messages": [{ "role": "user", "content": prompt }],
                });
                self.client
                    .post(chat_completions_url(&self.config.endpoint))
                    .bearer_auth(credential.expose())
                    .json(&body)
            }
        }
    }

    async fn send(
        &self,
        model_id: &str,
        prompt: &str,
        credential: Credential,
    ) -> ProviderResult<Completion> {
        let resp = self
            .build_request(model_id, prompt, &credential)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &text));
        }

        match self.config.api {
            RemoteApi::Anthropic => {
                let parsed: AnthropicResponse = resp.json().await.map_err(classify_transport)?;
                let text: String = parsed
                    .content
                    .into_iter()
                    .filter_map(|b| b.text)
                    .collect::<Vec<_>>()
                    .join("");
                Ok(Completion {
                    text,
                    tokens: parsed.usage.and_then(|u| u.output_tokens),
                    model: model_id.to_string(),
                })
            }
            RemoteApi::OpenAi => {
                let parsed: ChatResponse = resp.json().await.map_err(classify_transport)?;
                let text = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| ProviderError::InvalidResponse("no choices returned".into()))?;
                Ok(Completion {
                    text,
                    tokens: parsed.usage.and_then(|u| u.completion_tokens),
                    model: model_id.to_string(),
                })
            }
        }
    }
}

fn chat_completions_url(endpoint: &str) -> String {
    if endpoint.trim_end_matches('/').ends_with("/chat/completions") {
        endpoint.to_string()
    } else {
        join_url(endpoint, "chat/completions")
    }
}

/// Non-success status from a hosted API.
fn status_error(status: u16, body: &str) -> ProviderError {
    match status {
        401 | 403 => ProviderError::CredentialRejected(status),
        404 => ProviderError::IncompatibleModel(extract_error_message(body)),
        _ => ProviderError::Backend {
            status: Some(status),
            message: extract_error_message(body),
        },
    }
}

#[async_trait]
impl Provider for RemoteProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn list_models(&self, _timeouts: &TimeoutPolicy) -> ProviderResult<Vec<ModelDescriptor>> {
        Ok(self
            .config
            .models
            .iter()
            .map(|m| ModelDescriptor::new(m.clone(), &self.config.id, self.config.kind, None))
            .collect())
    }

    async fn request(
        &self,
        model_id: &str,
        prompt: &str,
        budget: RequestBudget,
    ) -> ProviderResult<Completion> {
        let credential = self.credential().await?;
        debug!(provider = %self.config.id, model = %model_id, "Sending remote request");

        match timeout(budget.total, self.send(model_id, prompt, credential)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::RequestTimeout(budget.total)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(status_error(401, ""), ProviderError::CredentialRejected(401)));
        assert!(matches!(status_error(403, ""), ProviderError::CredentialRejected(403)));
        assert!(matches!(
            status_error(404, r#"{"error":{"message":"model: nope"}}"#),
            ProviderError::IncompatibleModel(m) if m == "model: nope"
        ));
        assert!(matches!(
            status_error(429, "slow down"),
            ProviderError::Backend { status: Some(429), .. }
        ));
        assert!(matches!(
            status_error(529, "overloaded"),
            ProviderError::Backend { status: Some(529), .. }
        ));
    }

    #[test]
    fn test_chat_completions_url() {
        assert_eq!(
            chat_completions_url("https://api.example.com/v1"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_static_model_list() {
        let config = ProviderConfig::remote("hosted", "https://api.example.com/v1/messages")
            .with_models(["claude-3-haiku-20240307", "claude-3-5-sonnet-latest"]);
        let provider =
            RemoteProvider::new(config, &TimeoutPolicy::defaults(), SecretsResolver::new("/nonexistent"))
                .unwrap();

        let models = provider.list_models(&TimeoutPolicy::defaults()).await.unwrap();
        assert_eq!(models.len(), 2);
        assert!(models.iter().all(|m| m.provider_id == "hosted"));
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_network() {
        let config = ProviderConfig::remote("unit-remote-nokey", "http://127.0.0.1:9/v1/messages");
        let provider = RemoteProvider::new(
            config,
            &TimeoutPolicy::defaults(),
            SecretsResolver::new("/nonexistent/secrets"),
        )
        .unwrap();

        let err = provider
            .request("m", "hi", RequestBudget::single(std::time::Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CredentialNotFound(k) if k == "unit-remote-nokey"));
    }

    #[tokio::test]
    async fn test_unreadable_store_is_not_reported_as_missing_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let config =
            ProviderConfig::remote("unit-remote-dirstore", "http://127.0.0.1:9/v1/messages");
        let secrets = SecretsResolver::new(dir.path());
        let provider = RemoteProvider::new(config, &TimeoutPolicy::defaults(), secrets).unwrap();

        let err = provider
            .request("m", "hi", RequestBudget::single(std::time::Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CredentialStore(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::CredentialNotFound);
    }
}
