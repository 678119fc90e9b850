//! Session state document and recovery report types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{ModelDescriptor, ModelKey};
use crate::provider::ProviderKind;

/// Current snapshot document version.
pub const SNAPSHOT_VERSION: u32 = 1;

fn snapshot_version() -> u32 {
    SNAPSHOT_VERSION
}

/// The recoverable state of one agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default = "snapshot_version")]
    pub version: u32,
    #[serde(default)]
    pub selected_database: String,
    #[serde(default)]
    pub selected_provider: String,
    #[serde(default)]
    pub selected_model: String,
    pub mode: ProviderKind,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub last_query: Option<String>,
    #[serde(default)]
    pub model_health_snapshot: Vec<ModelDescriptor>,
}

impl SessionState {
    pub fn new(
        selected_database: impl Into<String>,
        selected_provider: impl Into<String>,
        selected_model: impl Into<String>,
        mode: ProviderKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: SNAPSHOT_VERSION,
            selected_database: selected_database.into(),
            selected_provider: selected_provider.into(),
            selected_model: selected_model.into(),
            mode,
            started_at: now,
            last_updated: now,
            last_query: None,
            model_health_snapshot: Vec::new(),
        }
    }

    /// The selected `(provider, model)` pair, if both are set.
    pub fn selected_key(&self) -> Option<ModelKey> {
        if self.selected_provider.is_empty() || self.selected_model.is_empty() {
            return None;
        }
        Some(ModelKey::new(&self.selected_provider, &self.selected_model))
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Session fields that recovery either restores or resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionField {
    SelectedDatabase,
    SelectedProvider,
    SelectedModel,
    Mode,
    LastQuery,
    ModelHealth,
}

impl std::fmt::Display for SessionField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SelectedDatabase => "selected_database",
            Self::SelectedProvider => "selected_provider",
            Self::SelectedModel => "selected_model",
            Self::Mode => "mode",
            Self::LastQuery => "last_query",
            Self::ModelHealth => "model_health",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySource {
    /// State came from a persisted snapshot.
    Snapshot,
    /// No usable snapshot; the manager's defaults stand.
    Defaults,
}

/// What `recover` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub source: RecoverySource,
    /// Fields taken from the snapshot.
    pub recovered: Vec<SessionField>,
    /// Fields that failed re-validation and were reset to defaults.
    pub reset: Vec<SessionField>,
    /// Health records re-applied from the snapshot.
    pub restored_descriptors: usize,
}

impl RecoveryReport {
    pub fn defaults() -> Self {
        Self {
            source: RecoverySource::Defaults,
            recovered: Vec::new(),
            reset: Vec::new(),
            restored_descriptors: 0,
        }
    }
}
