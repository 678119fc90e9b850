//! Orchestration error kinds
//!
//! Component errors (`ProviderError`, `SecretsError`, `PersistenceFailure`, ...)
//! live next to the code that raises them. This module holds what they all
//! map onto: the [`ErrorKind`] taxonomy and the caller-facing
//! [`InferenceFailure`], which always names the last attempted model and the
//! error kind and never carries a raw backend dump.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::catalog::HealthTransition;

/// Maximum length of a backend message surfaced to callers.
const MAX_MESSAGE_CHARS: usize = 240;

/// Classification of every failure the orchestrator can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Backend unreachable. Retryable after backoff, never blacklists.
    ConnectionUnavailable,
    /// First-token, completion or caller deadline exceeded.
    Timeout,
    /// Backend reports a structural defect in the model itself.
    IncompatibleModel,
    /// No credential configured for a remote provider.
    CredentialNotFound,
    /// Remote provider refused the credential.
    CredentialRejected,
    /// Requested model is not eligible for selection.
    SelectionRejected,
    /// Snapshot write or read failed.
    PersistenceFailure,
    /// Any other backend failure (5xx, rate limiting, malformed response).
    Backend,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionUnavailable => "connection_unavailable",
            Self::Timeout => "timeout",
            Self::IncompatibleModel => "incompatible_model",
            Self::CredentialNotFound => "credential_not_found",
            Self::CredentialRejected => "credential_rejected",
            Self::SelectionRejected => "selection_rejected",
            Self::PersistenceFailure => "persistence_failure",
            Self::Backend => "backend",
        }
    }

    /// Whether repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable | Self::Timeout | Self::Backend
        )
    }

    /// Credential problems are configuration problems, not model problems.
    pub fn is_credential(&self) -> bool {
        matches!(self, Self::CredentialNotFound | Self::CredentialRejected)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a selection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// No provider registered under that id.
    ProviderNotFound,
    /// The provider does not offer that model.
    ModelNotFound,
    /// The model is blacklisted for the rest of the process lifetime.
    Blacklisted,
    /// `infer` was called before any model was selected.
    NoActiveModel,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProviderNotFound => write!(f, "provider not registered"),
            Self::ModelNotFound => write!(f, "model not offered by provider"),
            Self::Blacklisted => write!(f, "model is blacklisted"),
            Self::NoActiveModel => write!(f, "no active model selected"),
        }
    }
}

/// A `select` call that was refused. Session state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("selection of {provider_id}/{model_id} rejected: {reason}")]
pub struct SelectionRejected {
    pub provider_id: String,
    pub model_id: String,
    pub reason: RejectReason,
}

impl SelectionRejected {
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        reason: RejectReason,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            reason,
        }
    }
}

/// Caller-facing failure of an `infer` call.
///
/// Based on the structured error shape used for agent-facing tools: a
/// machine-readable kind, a short message, and whether retrying makes sense.
/// Health transitions that happened while serving the call ride along as
/// metadata.
///
/// # Example
/// ```json
/// {
///   "provider_id": "ollama",
///   "model_id": "qwen2.5-coder:1.5b",
///   "kind": "timeout",
///   "message": "no first token within 60s",
///   "retryable": true,
///   "retry_after_ms": null,
///   "transitions": []
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceFailure {
    /// Provider of the last attempted model.
    pub provider_id: String,
    /// Last attempted model.
    pub model_id: String,
    /// Error classification.
    pub kind: ErrorKind,
    /// Single-line sanitized description.
    pub message: String,
    /// Whether the caller may retry the same request.
    pub retryable: bool,
    /// Suggested wait before retrying (connection failures only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Health transitions recorded while serving this call.
    #[serde(default)]
    pub transitions: Vec<HealthTransition>,
}

impl InferenceFailure {
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        kind: ErrorKind,
        message: &str,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            kind,
            message: sanitize_message(message),
            retryable: kind.is_retryable(),
            retry_after_ms: None,
            transitions: Vec::new(),
        }
    }

    /// Attach a retry hint.
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after_ms = retry_after.map(|d| d.as_millis() as u64);
        self
    }

    /// Attach the health transitions recorded for this call.
    pub fn with_transitions(mut self, transitions: Vec<HealthTransition>) -> Self {
        self.transitions = transitions;
        self
    }

    /// Failure for an `infer` on an orchestrator with nothing selected.
    pub fn no_active_model() -> Self {
        Self::new(
            "",
            "",
            ErrorKind::SelectionRejected,
            &RejectReason::NoActiveModel.to_string(),
        )
    }
}

impl std::fmt::Display for InferenceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.model_id.is_empty() {
            write!(f, "[{}] {}", self.kind, self.message)
        } else {
            write!(
                f,
                "[{}] {}/{}: {}",
                self.kind, self.provider_id, self.model_id, self.message
            )
        }
    }
}

impl std::error::Error for InferenceFailure {}

/// Reduce a backend message to one readable line.
///
/// Takes the first non-empty line, collapses whitespace and truncates it, so
/// multi-line tracebacks and HTML error pages never reach the caller.
pub fn sanitize_message(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_MESSAGE_CHARS {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(MAX_MESSAGE_CHARS).collect();
    truncated.push_str("...");
    truncated
}
