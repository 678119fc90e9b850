//! Ollama-backed local provider
//!
//! - `GET  /api/tags`     model enumeration (under `api_calls`)
//! - `POST /api/generate` streamed NDJSON inference
//! - `GET  /api/version`  liveness ping (under `connection_check`)
//! - `POST /api/pull`     model download (under `model_download`)
//!
//! Streaming requests run under two deadlines measured from the request
//! start: the first chunk must arrive within `budget.first_token`, the whole
//! stream must finish within `budget.total`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use super::{
    classify_transport, extract_error_message, join_url, looks_incompatible, Completion,
    Provider, ProviderConfig, ProviderError, ProviderResult, RequestBudget,
};
use crate::catalog::ModelDescriptor;
use crate::timeouts::{OperationCategory, TimeoutPolicy};

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(default)]
    version: String,
}

/// One line of the `/api/generate` NDJSON stream.
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    eval_count: Option<u32>,
}

/// Locally hosted Ollama server.
pub struct LocalProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    ping_timeout: Duration,
}

impl LocalProvider {
    pub fn new(config: ProviderConfig, timeouts: &TimeoutPolicy) -> ProviderResult<Self> {
        let ping_timeout = timeouts.get(OperationCategory::ConnectionCheck);
        let client = reqwest::Client::builder()
            .connect_timeout(ping_timeout)
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;
        Ok(Self {
            config,
            client,
            ping_timeout,
        })
    }

    /// Server version from `/api/version`, under `connection_check`.
    pub async fn version(&self) -> ProviderResult<String> {
        let url = join_url(&self.config.endpoint, "api/version");
        let probe = async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(classify_transport)?;
            if !resp.status().is_success() {
                return Err(ProviderError::Backend {
                    status: Some(resp.status().as_u16()),
                    message: "version probe failed".to_string(),
                });
            }
            let version: VersionResponse = resp.json().await.map_err(classify_transport)?;
            Ok(version.version)
        };

        timeout(self.ping_timeout, probe)
            .await
            .map_err(|_| ProviderError::ConnectionUnavailable(format!("{} did not answer", url)))?
    }

    async fn stream_generate(
        &self,
        model_id: &str,
        prompt: &str,
        first_token_deadline: Instant,
        first_token_limit: Duration,
    ) -> ProviderResult<Completion> {
        let url = join_url(&self.config.endpoint, "api/generate");
        let body = serde_json::json!({
            "model": model_id,
            "prompt": prompt,
            "stream": true,
        });

        let send = self.client.post(&url).json(&body).send();
        let resp = timeout_at(first_token_deadline, send)
            .await
            .map_err(|_| ProviderError::FirstTokenTimeout(first_token_limit))?
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &text));
        }

        let mut stream = Box::pin(resp.bytes_stream());
        let mut pending: Vec<u8> = Vec::new();
        let mut output = StreamOutput::default();
        let mut seen_first = false;

        loop {
            let next = if seen_first {
                stream.next().await
            } else {
                timeout_at(first_token_deadline, stream.next())
                    .await
                    .map_err(|_| ProviderError::FirstTokenTimeout(first_token_limit))?
            };

            let chunk = match next {
                Some(chunk) => chunk.map_err(classify_transport)?,
                None => break,
            };
            seen_first = true;
            pending.extend_from_slice(&chunk);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if output.push_line(&line)? {
                    return Ok(output.finish(model_id));
                }
            }
        }

        // Stream ended without a trailing newline or without `done`.
        output.push_line(&pending)?;
        if !output.done {
            warn!(provider = %self.config.id, model = %model_id, "Stream ended without done marker");
        }
        Ok(output.finish(model_id))
    }
}

#[derive(Default)]
struct StreamOutput {
    text: String,
    tokens: Option<u32>,
    chunks: u32,
    done: bool,
}

impl StreamOutput {
    /// Consume one NDJSON line; returns `true` once the backend signals done.
    fn push_line(&mut self, line: &[u8]) -> ProviderResult<bool> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(false);
        }

        let chunk: GenerateChunk = serde_json::from_str(line)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        if let Some(error) = chunk.error {
            return Err(if looks_incompatible(&error) {
                ProviderError::IncompatibleModel(error)
            } else {
                ProviderError::Backend {
                    status: None,
                    message: error,
                }
            });
        }

        self.text.push_str(&chunk.response);
        self.chunks += 1;
        if chunk.done {
            self.done = true;
            self.tokens = chunk.eval_count.or(Some(self.chunks));
        }
        Ok(chunk.done)
    }

    fn finish(self, model_id: &str) -> Completion {
        Completion {
            text: self.text,
            tokens: self.tokens,
            model: model_id.to_string(),
        }
    }
}

/// Non-success status from Ollama.
///
/// A 404 means the server does not have the model; structural load failures
/// usually surface as 500 with a descriptive body.
fn status_error(status: u16, body: &str) -> ProviderError {
    let message = extract_error_message(body);
    if status == 404 || looks_incompatible(&message) {
        ProviderError::IncompatibleModel(message)
    } else {
        ProviderError::Backend {
            status: Some(status),
            message,
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn ping(&self) -> ProviderResult<Option<String>> {
        self.version().await.map(Some)
    }

    async fn list_models(&self, timeouts: &TimeoutPolicy) -> ProviderResult<Vec<ModelDescriptor>> {
        let url = join_url(&self.config.endpoint, "api/tags");
        let limit = timeouts.get(OperationCategory::ApiCalls);

        let fetch = async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(classify_transport)?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(ProviderError::Backend {
                    status: Some(status.as_u16()),
                    message: extract_error_message(&text),
                });
            }
            resp.json::<TagsResponse>().await.map_err(classify_transport)
        };

        let tags = timeout(limit, fetch)
            .await
            .map_err(|_| ProviderError::RequestTimeout(limit))??;

        debug!(provider = %self.config.id, count = tags.models.len(), "Listed local models");
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelDescriptor::new(m.name, &self.config.id, self.config.kind, m.size))
            .collect())
    }

    async fn pull(&self, model_id: &str, timeouts: &TimeoutPolicy) -> ProviderResult<()> {
        let url = join_url(&self.config.endpoint, "api/pull");
        let limit = timeouts.get(OperationCategory::ModelDownload);
        let body = serde_json::json!({ "model": model_id, "stream": false });

        let download = async {
            let resp = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(classify_transport)?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(ProviderError::Backend {
                    status: Some(status.as_u16()),
                    message: extract_error_message(&text),
                });
            }
            resp.json::<PullResponse>().await.map_err(classify_transport)
        };

        let outcome = timeout(limit, download)
            .await
            .map_err(|_| ProviderError::RequestTimeout(limit))??;
        match outcome.error {
            Some(message) => Err(ProviderError::Backend {
                status: None,
                message,
            }),
            None if outcome.status == "success" => {
                debug!(provider = %self.config.id, model = %model_id, "Model pulled");
                Ok(())
            }
            None => Err(ProviderError::InvalidResponse(format!(
                "unexpected pull status '{}'",
                outcome.status
            ))),
        }
    }

    async fn request(
        &self,
        model_id: &str,
        prompt: &str,
        budget: RequestBudget,
    ) -> ProviderResult<Completion> {
        let started = Instant::now();
        let first_token_limit = budget.first_token.unwrap_or(budget.total).min(budget.total);
        let first_token_deadline = started + first_token_limit;

        let generation = self.stream_generate(model_id, prompt, first_token_deadline, first_token_limit);
        match timeout(budget.total, generation).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::CompletionTimeout(budget.total)),
        }
    }
}
