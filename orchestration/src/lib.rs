//! Model Provider Orchestration
//!
//! This library routes inference requests for the SQL agent to one of several
//! interchangeable backends and keeps the selection healthy:
//! - [`timeouts`]: per-operation timeout policy (compiled defaults + overrides)
//! - [`secrets`]: layered credential resolution (environment, then on-disk store)
//! - [`provider`] / [`registry`]: local (Ollama) and remote (hosted API) providers
//! - [`catalog`]: model descriptors, health classification and fallback ordering
//! - [`manager`]: the orchestrator that selects, infers, demotes and falls back
//! - [`session`]: durable session snapshots, autosave and recovery
//!
//! # Usage
//!
//! ```rust,ignore
//! use orchestration::{ModelManager, OrchestratorConfig, SessionStateStore};
//!
//! let config = OrchestratorConfig::load_or_default(None)?;
//! let manager = ModelManager::from_config(&config)?.shared();
//! manager.refresh_catalog().await;
//! manager.ensure_selection().await?;
//!
//! let outcome = manager.infer("list all customers from Berlin", None).await?;
//! println!("{} answered: {}", outcome.model_id, outcome.text);
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod secrets;
pub mod session;
pub mod timeouts;

pub use catalog::{
    FailureEffect, HealthPolicy, HealthTransition, ModelCatalog, ModelDescriptor, ModelHealth,
    ModelKey, PriorityEntry,
};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{ErrorKind, InferenceFailure, RejectReason, SelectionRejected};
pub use manager::{
    CatalogRefresh, InferenceOutcome, ManagerSettings, ModelManager, ProbeReport,
    ProviderStatus, RefreshFailure, SelectionPhase, SharedModelManager,
};
pub use provider::{
    Completion, LocalProvider, Provider, ProviderConfig, ProviderError, ProviderKind,
    RemoteApi, RemoteProvider, RequestBudget, SharedProvider,
};
pub use registry::{ProviderRegistry, Registration, RegistryError};
pub use secrets::{Credential, SecretsError, SecretsResolver};
pub use session::{
    spawn_autosave, AutosaveConfig, AutosaveHandle, AutosaveStats, PersistenceFailure,
    RecoveryReport, RecoverySource, SessionField, SessionState, SessionStateStore,
    SharedSessionStore,
};
pub use timeouts::{OperationCategory, TimeoutPolicy, UnknownCategory};
