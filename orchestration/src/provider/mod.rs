//! Inference providers
//!
//! A [`Provider`] is one inference backend: it can enumerate the models it
//! offers and run a single request against one of them within a
//! [`RequestBudget`]. Two closed variants exist:
//! - [`LocalProvider`]: a locally hosted Ollama server
//! - [`RemoteProvider`]: a hosted API (Anthropic messages or OpenAI-compatible)
//!
//! Other implementations (test doubles, in-process backends) plug in through
//! [`crate::ProviderRegistry::register_provider`].

pub mod local;
pub mod remote;

pub use local::LocalProvider;
pub use remote::RemoteProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::ModelDescriptor;
use crate::error::ErrorKind;
use crate::timeouts::{OperationCategory, TimeoutPolicy};

// ============================================================================
// Configuration
// ============================================================================

/// Where a provider (and therefore its models) runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Remote,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Wire flavour of a hosted API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteApi {
    /// Anthropic messages API (`x-api-key`).
    #[default]
    Anthropic,
    /// OpenAI-compatible chat completions (`Authorization: Bearer`).
    #[serde(rename = "openai")]
    OpenAi,
}

/// Static description of a provider. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    /// Name of the secret holding the API key. Defaults to the provider id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default)]
    pub api: RemoteApi,
    /// Models a hosted API offers; hosted APIs are not enumerated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

impl ProviderConfig {
    pub fn local(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ProviderKind::Local,
            endpoint: endpoint.into(),
            credential_ref: None,
            api: RemoteApi::default(),
            models: Vec::new(),
        }
    }

    pub fn remote(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            kind: ProviderKind::Remote,
            ..Self::local(id, endpoint)
        }
    }

    pub fn with_credential_ref(mut self, credential_ref: impl Into<String>) -> Self {
        self.credential_ref = Some(credential_ref.into());
        self
    }

    pub fn with_api(mut self, api: RemoteApi) -> Self {
        self.api = api;
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Secret name used to look up this provider's credential.
    pub fn credential_key(&self) -> &str {
        self.credential_ref.as_deref().unwrap_or(&self.id)
    }
}

// ============================================================================
// Request budget and result
// ============================================================================

/// Time allowed for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBudget {
    /// Deadline for the first streamed chunk, measured from the request start.
    pub first_token: Option<Duration>,
    /// Deadline for the whole request.
    pub total: Duration,
}

impl RequestBudget {
    pub fn streaming(first_token: Duration, total: Duration) -> Self {
        Self {
            first_token: Some(first_token.min(total)),
            total,
        }
    }

    pub fn single(total: Duration) -> Self {
        Self {
            first_token: None,
            total,
        }
    }

    /// Narrow the budget to a caller deadline.
    ///
    /// Returns the clamped budget and whether the caller's deadline became
    /// the binding limit.
    pub fn clamp(self, deadline: Option<Duration>) -> (Self, bool) {
        match deadline {
            Some(limit) if limit < self.total => {
                let first_token = self.first_token.map(|d| d.min(limit));
                (
                    Self {
                        first_token,
                        total: limit,
                    },
                    true,
                )
            }
            _ => (self, false),
        }
    }
}

/// Successful inference result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// Generated token count as reported by the backend.
    pub tokens: Option<u32>,
    pub model: String,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("backend unreachable: {0}")]
    ConnectionUnavailable(String),

    #[error("no first token within {}s", .0.as_secs_f64())]
    FirstTokenTimeout(Duration),

    #[error("completion not finished within {}s", .0.as_secs_f64())]
    CompletionTimeout(Duration),

    #[error("request not answered within {}s", .0.as_secs_f64())]
    RequestTimeout(Duration),

    #[error("caller deadline of {}s exceeded", .0.as_secs_f64())]
    DeadlineExceeded(Duration),

    #[error("model incompatible with backend: {0}")]
    IncompatibleModel(String),

    #[error("no credential configured under '{0}'")]
    CredentialNotFound(String),

    #[error("credential rejected (HTTP {0})")]
    CredentialRejected(u16),

    #[error("secrets store unreadable: {0}")]
    CredentialStore(String),

    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),

    #[error("backend error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Backend { status: Option<u16>, message: String },

    #[error("malformed backend response: {0}")]
    InvalidResponse(String),

    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionUnavailable(_) => ErrorKind::ConnectionUnavailable,
            Self::FirstTokenTimeout(_)
            | Self::CompletionTimeout(_)
            | Self::RequestTimeout(_)
            | Self::DeadlineExceeded(_) => ErrorKind::Timeout,
            Self::IncompatibleModel(_) => ErrorKind::IncompatibleModel,
            Self::CredentialNotFound(_) | Self::CredentialStore(_) => ErrorKind::CredentialNotFound,
            Self::CredentialRejected(_) => ErrorKind::CredentialRejected,
            Self::Backend { .. }
            | Self::InvalidResponse(_)
            | Self::Client(_)
            | Self::Unsupported(_) => ErrorKind::Backend,
        }
    }
}

/// Map a transport-level failure onto the provider taxonomy.
pub(crate) fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_connect() || err.is_timeout() {
        ProviderError::ConnectionUnavailable(err.to_string())
    } else if err.is_decode() || err.is_body() {
        ProviderError::InvalidResponse(err.to_string())
    } else {
        ProviderError::Backend {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Backend texts that name a structural defect of the model file.
const INCOMPATIBLE_MARKERS: &[&str] = &[
    "unknown model architecture",
    "failed to load model",
    "invalid file magic",
];

/// Whether a backend error message describes an unusable model.
pub(crate) fn looks_incompatible(message: &str) -> bool {
    let lower = message.to_lowercase();
    if INCOMPATIBLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    // "tensor 'blk.0.attn_q.weight' not found"
    match lower.find("tensor") {
        Some(pos) => lower[pos..].contains("not found"),
        None => false,
    }
}

/// Pull a human-readable message out of a JSON error body.
///
/// Handles `{"error": "..."}` (Ollama) and `{"error": {"message": "..."}}`
/// (hosted APIs); anything else is returned as-is.
pub(crate) fn extract_error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        let error = v.get("error")?;
        error
            .as_str()
            .map(str::to_string)
            .or_else(|| error.get("message")?.as_str().map(str::to_string))
    });
    message.unwrap_or_else(|| body.trim().to_string())
}

// ============================================================================
// Provider trait
// ============================================================================

/// One inference backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    fn id(&self) -> &str {
        &self.config().id
    }

    fn location(&self) -> ProviderKind {
        self.config().kind
    }

    /// Enumerate the models this backend currently offers.
    async fn list_models(&self, timeouts: &TimeoutPolicy) -> ProviderResult<Vec<ModelDescriptor>>;

    /// Run one prompt against `model_id` within `budget`.
    async fn request(
        &self,
        model_id: &str,
        prompt: &str,
        budget: RequestBudget,
    ) -> ProviderResult<Completion>;

    /// Download `model_id` onto the backend, under `model_download`.
    async fn pull(&self, _model_id: &str, _timeouts: &TimeoutPolicy) -> ProviderResult<()> {
        Err(ProviderError::Unsupported("model pull"))
    }

    /// Liveness probe. `Ok(None)` means the backend has no probe endpoint.
    async fn ping(&self) -> ProviderResult<Option<String>> {
        Ok(None)
    }

    /// Budget for one inference request under `timeouts`.
    fn budget(&self, timeouts: &TimeoutPolicy) -> RequestBudget {
        match self.location() {
            ProviderKind::Local => RequestBudget::streaming(
                timeouts.get(OperationCategory::InferenceFirstToken),
                timeouts.get(OperationCategory::InferenceCompletion),
            ),
            ProviderKind::Remote => {
                RequestBudget::single(timeouts.get(OperationCategory::ApiCalls))
            }
        }
    }
}

pub type SharedProvider = Arc<dyn Provider>;

/// Join an endpoint and a path without doubling slashes.
pub(crate) fn join_url(endpoint: &str, path: &str) -> String {
    format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
