//! Model manager: selection, inference, demotion and fallback
//!
//! The manager is the only component that mutates model health and session
//! state. Everything it owns sits behind a single `tokio::sync::Mutex`:
//!
//! ```text
//! ┌───────────────────────────── ModelManager ─────────────────────────────┐
//! │ registry: RwLock<ProviderRegistry>   (cloned out, never held over I/O) │
//! │ inner:    Mutex<{ catalog, session, phase, provider_order }>           │
//! │ state_tx: watch::Sender<SessionState> ──▶ autosave task                │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Backend calls always run with no lock held, so two `infer` calls against
//! different providers proceed in parallel while each health update stays a
//! single linearizable read-modify-write.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{
    HealthPolicy, HealthTransition, ModelCatalog, ModelDescriptor, ModelHealth, ModelKey,
    PriorityEntry,
};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::error::{ErrorKind, InferenceFailure, RejectReason, SelectionRejected};
use crate::provider::{Completion, ProviderConfig, ProviderError, ProviderKind, SharedProvider};
use crate::registry::{ProviderRegistry, Registration, RegistryResult};
use crate::secrets::SecretsResult;
use crate::session::{RecoveryReport, RecoverySource, SessionField, SessionState};
use crate::timeouts::{OperationCategory, TimeoutPolicy};

// ============================================================================
// Settings and results
// ============================================================================

/// Defaults and policies the manager falls back to.
#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub default_provider: String,
    pub default_model: String,
    pub default_database: String,
    pub priority: Vec<PriorityEntry>,
    pub known_incompatible: Vec<String>,
    /// Let `ensure_selection` pull a missing priority model onto a local
    /// provider as a last resort.
    pub auto_pull: bool,
    pub health: HealthPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPhase {
    Unselected,
    Selecting,
    Active,
}

/// A provider whose model listing failed during a refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshFailure {
    pub provider_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of [`ModelManager::refresh_catalog`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogRefresh {
    /// Records added to the catalog by this refresh.
    pub discovered: usize,
    /// Records in the catalog after the refresh.
    pub total: usize,
    pub failures: Vec<RefreshFailure>,
}

/// Successful `infer` result.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceOutcome {
    pub text: String,
    pub provider_id: String,
    pub model_id: String,
    pub tokens: Option<u32>,
    pub latency_ms: u64,
    /// Set when the answer came from a fallback after the selected model failed.
    pub fell_back_from: Option<ModelKey>,
    pub transitions: Vec<HealthTransition>,
}

/// Result of [`ModelManager::probe_model`].
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub provider_id: String,
    pub model_id: String,
    pub health: ModelHealth,
    pub latency_ms: u64,
    pub transitions: Vec<HealthTransition>,
}

/// Liveness of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    pub reachable: bool,
    pub detail: Option<String>,
}

// ============================================================================
// Manager
// ============================================================================

struct Inner {
    catalog: ModelCatalog,
    session: SessionState,
    phase: SelectionPhase,
    provider_order: Vec<String>,
}

/// What a recorded failure asks the caller to do next.
struct FailureDecision {
    failure: InferenceFailure,
    retry_on: Option<ModelKey>,
}

pub struct ModelManager {
    registry: RwLock<ProviderRegistry>,
    inner: Mutex<Inner>,
    settings: ManagerSettings,
    state_tx: watch::Sender<SessionState>,
}

pub type SharedModelManager = Arc<ModelManager>;

impl ModelManager {
    pub fn new(registry: ProviderRegistry, settings: ManagerSettings) -> Self {
        let provider_order = registry.ids();
        let mode = default_mode(&registry, &settings.default_provider);
        let session = SessionState::new(
            &settings.default_database,
            &settings.default_provider,
            &settings.default_model,
            mode,
        );
        let (state_tx, _) = watch::channel(session.clone());

        Self {
            registry: RwLock::new(registry),
            inner: Mutex::new(Inner {
                catalog: ModelCatalog::new(settings.health),
                session,
                phase: SelectionPhase::Unselected,
                provider_order,
            }),
            settings,
            state_tx,
        }
    }

    /// Build the registry and manager described by `config`.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut registry = ProviderRegistry::new(config.timeout_policy(), config.secrets_resolver());
        for provider in &config.providers {
            registry.register(provider.clone())?;
        }
        Ok(Self::new(registry, config.manager_settings()))
    }

    pub fn shared(self) -> SharedModelManager {
        Arc::new(self)
    }

    pub async fn timeouts(&self) -> TimeoutPolicy {
        self.registry.read().await.timeouts().clone()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register a provider from config.
    pub async fn register(&self, config: ProviderConfig) -> RegistryResult<Registration> {
        let id = config.id.clone();
        let (registration, order) = {
            let mut registry = self.registry.write().await;
            let registration = registry.register(config)?;
            (registration, registry.ids())
        };
        self.after_registration(&id, registration, order).await;
        Ok(registration)
    }

    /// Register an already-built provider.
    pub async fn register_provider(&self, provider: SharedProvider) -> Registration {
        let id = provider.id().to_string();
        let (registration, order) = {
            let mut registry = self.registry.write().await;
            let registration = registry.register_provider(provider);
            (registration, registry.ids())
        };
        self.after_registration(&id, registration, order).await;
        registration
    }

    async fn after_registration(&self, id: &str, registration: Registration, order: Vec<String>) {
        let mut inner = self.inner.lock().await;
        inner.provider_order = order;
        if registration == Registration::Replaced {
            let reset = inner.catalog.reset_provider(id);
            debug!(provider = %id, reset = reset.len(), "Provider health reset after re-registration");
        }
        self.publish(&mut inner);
    }

    // ------------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------------

    /// Query every provider's model list concurrently and merge the results.
    ///
    /// Per-provider failures are reported, never fatal.
    pub async fn refresh_catalog(&self) -> CatalogRefresh {
        let (providers, timeouts) = {
            let registry = self.registry.read().await;
            (registry.providers(), registry.timeouts().clone())
        };

        let listings = join_all(providers.iter().map(|p| {
            let timeouts = &timeouts;
            async move { (p.id().to_string(), p.list_models(timeouts).await) }
        }))
        .await;

        let mut report = CatalogRefresh::default();
        let mut inner = self.inner.lock().await;
        for (provider_id, listing) in listings {
            match listing {
                Ok(models) => {
                    let count = models.len();
                    let (added, _) = inner
                        .catalog
                        .merge_listing(models, &self.settings.known_incompatible);
                    report.discovered += added;
                    debug!(provider = %provider_id, listed = count, added, "Catalog refreshed");
                }
                Err(e) => {
                    warn!(provider = %provider_id, error = %e, "Model listing failed");
                    report.failures.push(RefreshFailure {
                        provider_id,
                        kind: e.kind(),
                        message: crate::error::sanitize_message(&e.to_string()),
                    });
                }
            }
        }
        report.total = inner.catalog.len();
        if inner.catalog.is_empty() {
            warn!("No provider reported any model");
        }
        self.publish(&mut inner);

        info!(
            discovered = report.discovered,
            total = report.total,
            failed = report.failures.len(),
            "Model catalog refresh complete"
        );
        report
    }

    /// Every catalogued model, in registration order then model id.
    pub async fn list_models(&self) -> Vec<ModelDescriptor> {
        let inner = self.inner.lock().await;
        inner.catalog.ordered(&inner.provider_order)
    }

    /// Current fallback candidates, most preferred first.
    pub async fn fallback_order(&self) -> Vec<ModelKey> {
        let inner = self.inner.lock().await;
        inner
            .catalog
            .fallback_order(&inner.provider_order, &self.settings.priority)
    }

    /// Probe every provider's liveness endpoint.
    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let providers = self.registry.read().await.providers();
        join_all(providers.iter().map(|p| async move {
            let config = p.config();
            let (reachable, detail) = match p.ping().await {
                Ok(detail) => (true, detail),
                Err(e) => (false, Some(crate::error::sanitize_message(&e.to_string()))),
            };
            ProviderStatus {
                provider_id: config.id.clone(),
                kind: config.kind,
                endpoint: config.endpoint.clone(),
                reachable,
                detail,
            }
        }))
        .await
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    /// Make `(provider_id, model_id)` the active model.
    ///
    /// An uncatalogued model triggers one refresh of that provider. A
    /// rejected selection leaves the session untouched.
    pub async fn select(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<ModelDescriptor, SelectionRejected> {
        let provider = {
            let registry = self.registry.read().await;
            registry
                .get(provider_id)
                .map(|p| (p, registry.timeouts().clone()))
        };
        let (provider, timeouts) = provider.map_err(|_| {
            SelectionRejected::new(provider_id, model_id, RejectReason::ProviderNotFound)
        })?;
        let key = ModelKey::new(provider_id, model_id);

        let previous_phase = {
            let mut inner = self.inner.lock().await;
            if inner.catalog.contains(&key) {
                None
            } else {
                let previous = inner.phase;
                inner.phase = SelectionPhase::Selecting;
                Some(previous)
            }
        };

        let listing = match previous_phase {
            Some(_) => {
                debug!(provider = %provider_id, model = %model_id, "Model not catalogued; refreshing provider");
                Some(provider.list_models(&timeouts).await)
            }
            None => None,
        };

        let mut inner = self.inner.lock().await;
        if let Some(previous) = previous_phase {
            if inner.phase == SelectionPhase::Selecting {
                inner.phase = previous;
            }
        }
        match listing {
            Some(Ok(models)) => {
                inner
                    .catalog
                    .merge_listing(models, &self.settings.known_incompatible);
            }
            Some(Err(e)) => {
                warn!(provider = %provider_id, error = %e, "Provider refresh during selection failed");
            }
            None => {}
        }

        let descriptor = match inner.catalog.get(&key) {
            None => {
                return Err(SelectionRejected::new(
                    provider_id,
                    model_id,
                    RejectReason::ModelNotFound,
                ))
            }
            Some(d) if d.is_blacklisted() => {
                return Err(SelectionRejected::new(
                    provider_id,
                    model_id,
                    RejectReason::Blacklisted,
                ))
            }
            Some(d) => d.clone(),
        };

        apply_selection(&mut inner, &descriptor);
        self.publish(&mut inner);
        info!(provider = %provider_id, model = %model_id, "Model selected");
        Ok(descriptor)
    }

    /// Ensure some model is active: the current selection if still valid,
    /// else the session's selected model, else the first fallback candidate.
    pub async fn ensure_selection(&self) -> Result<ModelDescriptor, SelectionRejected> {
        let (preferred, candidates) = {
            let inner = self.inner.lock().await;
            if inner.phase == SelectionPhase::Active {
                if let Some(d) = inner
                    .session
                    .selected_key()
                    .and_then(|k| inner.catalog.get(&k))
                    .filter(|d| !d.is_blacklisted())
                {
                    return Ok(d.clone());
                }
            }
            (
                inner.session.selected_key(),
                inner
                    .catalog
                    .fallback_order(&inner.provider_order, &self.settings.priority),
            )
        };

        let mut last_rejection = None;
        if let Some(key) = preferred.as_ref() {
            match self.select(&key.provider_id, &key.model_id).await {
                Ok(d) => return Ok(d),
                Err(rejected) => {
                    info!(%key, reason = %rejected.reason, "Preferred model unavailable; trying fallbacks");
                    last_rejection = Some(rejected);
                }
            }
        }

        for key in candidates.iter().filter(|k| Some(*k) != preferred.as_ref()) {
            match self.select(&key.provider_id, &key.model_id).await {
                Ok(d) => return Ok(d),
                Err(rejected) => last_rejection = Some(rejected),
            }
        }

        if self.settings.auto_pull {
            if let Some(d) = self.pull_preferred().await {
                return Ok(d);
            }
        }

        Err(last_rejection.unwrap_or_else(|| {
            SelectionRejected::new(
                &self.settings.default_provider,
                &self.settings.default_model,
                RejectReason::NoActiveModel,
            )
        }))
    }

    // ------------------------------------------------------------------------
    // Inference
    // ------------------------------------------------------------------------

    /// Run `prompt` on the active model.
    ///
    /// `deadline` bounds the whole call, retries included. A failure that
    /// blacklists the active model re-selects the first fallback candidate
    /// and retries once; a connection failure retries once on another
    /// provider without changing the selection.
    pub async fn infer(
        &self,
        prompt: &str,
        deadline: Option<Duration>,
    ) -> Result<InferenceOutcome, InferenceFailure> {
        let started = Instant::now();
        let key = {
            let inner = self.inner.lock().await;
            match (inner.phase, inner.session.selected_key()) {
                (SelectionPhase::Active, Some(key)) => key,
                _ => return Err(InferenceFailure::no_active_model()),
            }
        };

        let mut transitions = Vec::new();
        let error = match self.attempt(&key, prompt, remaining(deadline, started)).await {
            Ok(completion) => {
                return Ok(self
                    .record_success(&key, prompt, completion, None, transitions, started)
                    .await)
            }
            Err(error) => error,
        };

        let decision = self.record_failure(&key, &error, &mut transitions, true).await;
        let Some(fallback) = decision.retry_on else {
            return Err(decision.failure.with_transitions(transitions));
        };

        let budget_left = remaining(deadline, started);
        if budget_left.is_some_and(|d| d.is_zero()) {
            return Err(decision.failure.with_transitions(transitions));
        }

        info!(from = %key, to = %fallback, kind = %error.kind(), "Retrying on fallback model");
        match self.attempt(&fallback, prompt, budget_left).await {
            Ok(completion) => Ok(self
                .record_success(&fallback, prompt, completion, Some(key), transitions, started)
                .await),
            Err(error) => {
                let decision = self
                    .record_failure(&fallback, &error, &mut transitions, false)
                    .await;
                Err(decision.failure.with_transitions(transitions))
            }
        }
    }

    /// One request against one model, with no lock held.
    async fn attempt(
        &self,
        key: &ModelKey,
        prompt: &str,
        deadline: Option<Duration>,
    ) -> Result<Completion, ProviderError> {
        let (provider, timeouts) = {
            let registry = self.registry.read().await;
            let provider = registry.get(&key.provider_id).map_err(|e| ProviderError::Backend {
                status: None,
                message: e.to_string(),
            })?;
            (provider, registry.timeouts().clone())
        };

        if let Some(limit) = deadline.filter(|d| d.is_zero()) {
            return Err(ProviderError::DeadlineExceeded(limit));
        }

        let (budget, caller_bound) = provider.budget(&timeouts).clamp(deadline);
        debug!(
            provider = %key.provider_id,
            model = %key.model_id,
            total_ms = budget.total.as_millis() as u64,
            caller_bound,
            "Dispatching inference"
        );

        let request = provider.request(&key.model_id, prompt, budget);
        match tokio::time::timeout(budget.total, request).await {
            Ok(Err(ProviderError::CompletionTimeout(d) | ProviderError::RequestTimeout(d)))
                if caller_bound =>
            {
                Err(ProviderError::DeadlineExceeded(d))
            }
            Ok(result) => result,
            Err(_) if caller_bound => Err(ProviderError::DeadlineExceeded(budget.total)),
            Err(_) => Err(ProviderError::CompletionTimeout(budget.total)),
        }
    }

    async fn record_success(
        &self,
        key: &ModelKey,
        prompt: &str,
        completion: Completion,
        fell_back_from: Option<ModelKey>,
        mut transitions: Vec<HealthTransition>,
        started: Instant,
    ) -> InferenceOutcome {
        let mut inner = self.inner.lock().await;
        transitions.extend(inner.catalog.record_success(key));
        inner.session.last_query = Some(prompt.to_string());
        self.publish(&mut inner);
        drop(inner);

        InferenceOutcome {
            text: completion.text,
            provider_id: key.provider_id.clone(),
            model_id: key.model_id.clone(),
            tokens: completion.tokens,
            latency_ms: started.elapsed().as_millis() as u64,
            fell_back_from,
            transitions,
        }
    }

    /// Classify a failed attempt, update health, and pick a retry target.
    ///
    /// `allow_retry` is false for the retry itself; a second failure is
    /// surfaced, though it may still move the selection off a model it
    /// just blacklisted.
    async fn record_failure(
        &self,
        key: &ModelKey,
        error: &ProviderError,
        transitions: &mut Vec<HealthTransition>,
        allow_retry: bool,
    ) -> FailureDecision {
        let kind = error.kind();
        let message = error.to_string();
        let mut inner = self.inner.lock().await;

        let effect = inner.catalog.record_failure(key, kind, &message);
        let newly_blacklisted = effect
            .transition
            .as_ref()
            .is_some_and(|t| t.to == crate::catalog::ModelHealth::Blacklisted);
        transitions.extend(effect.transition);

        let failure = InferenceFailure::new(&key.provider_id, &key.model_id, kind, &message)
            .with_retry_after(effect.retry_after);

        if kind.is_credential() {
            warn!(provider = %key.provider_id, kind = %kind, "Credential problem; not falling back");
            self.publish(&mut inner);
            return FailureDecision {
                failure,
                retry_on: None,
            };
        }

        let candidates = inner
            .catalog
            .fallback_order(&inner.provider_order, &self.settings.priority);
        let mut retry_on = None;

        if newly_blacklisted {
            let still_selected = inner.session.selected_key().as_ref() == Some(key);
            let next = candidates.into_iter().find(|k| k != key);
            if still_selected {
                let next_descriptor = next.as_ref().and_then(|k| inner.catalog.get(k).cloned());
                match next_descriptor {
                    Some(descriptor) => {
                        info!(from = %key, to = %descriptor.key(), "Selection moved to fallback model");
                        apply_selection(&mut inner, &descriptor);
                    }
                    None => {
                        warn!(model = %key, "No fallback candidate left; selection cleared");
                        inner.phase = SelectionPhase::Unselected;
                    }
                }
            }
            if allow_retry {
                retry_on = next;
            }
        } else if kind == ErrorKind::ConnectionUnavailable && allow_retry {
            retry_on = candidates
                .into_iter()
                .find(|k| k.provider_id != key.provider_id);
        }

        self.publish(&mut inner);
        FailureDecision { failure, retry_on }
    }

    // ------------------------------------------------------------------------
    // Model management
    // ------------------------------------------------------------------------

    /// Download a model onto a provider, then merge the provider's listing.
    ///
    /// A failed pull leaves model health untouched.
    pub async fn pull_model(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<ModelDescriptor, InferenceFailure> {
        let (provider, timeouts) = self.provider_for(provider_id, model_id).await?;
        let failed = |e: ProviderError| {
            InferenceFailure::new(provider_id, model_id, e.kind(), &e.to_string())
        };

        info!(
            provider = %provider_id,
            model = %model_id,
            limit_secs = timeouts.get(OperationCategory::ModelDownload).as_secs(),
            "Pulling model"
        );
        provider.pull(model_id, &timeouts).await.map_err(failed)?;
        let listing = provider.list_models(&timeouts).await.map_err(failed)?;

        let mut inner = self.inner.lock().await;
        inner
            .catalog
            .merge_listing(listing, &self.settings.known_incompatible);
        let descriptor = inner.catalog.get(&ModelKey::new(provider_id, model_id)).cloned();
        self.publish(&mut inner);
        drop(inner);

        match descriptor {
            Some(descriptor) => {
                info!(provider = %provider_id, model = %model_id, "Model pulled");
                Ok(descriptor)
            }
            None => Err(InferenceFailure::new(
                provider_id,
                model_id,
                ErrorKind::Backend,
                "model not listed after pull",
            )),
        }
    }

    /// Pull the first priority model that no local provider offers yet and
    /// select it.
    async fn pull_preferred(&self) -> Option<ModelDescriptor> {
        let local_ids: Vec<String> = self
            .registry
            .read()
            .await
            .providers()
            .iter()
            .filter(|p| p.location() == ProviderKind::Local)
            .map(|p| p.id().to_string())
            .collect();

        for entry in &self.settings.priority {
            if self.settings.known_incompatible.contains(&entry.model) {
                continue;
            }
            let target = match &entry.provider {
                Some(p) if local_ids.contains(p) => p.clone(),
                Some(_) => continue,
                None => local_ids.first()?.clone(),
            };
            let key = ModelKey::new(&target, &entry.model);
            if self.inner.lock().await.catalog.contains(&key) {
                continue;
            }

            match self.pull_model(&target, &entry.model).await {
                Ok(_) => match self.select(&target, &entry.model).await {
                    Ok(d) => return Some(d),
                    Err(rejection) => {
                        debug!(%key, reason = %rejection.reason, "Pulled model not selectable")
                    }
                },
                Err(failure) => {
                    info!(%key, kind = %failure.kind, error = %failure.message, "Pull of preferred model failed")
                }
            }
        }
        None
    }

    /// Send a short test prompt to one model and record the outcome.
    ///
    /// The whole probe runs under the `inference_first_token` timeout. A
    /// failure is classified like an `infer` failure, without a retry.
    pub async fn probe_model(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<ProbeReport, InferenceFailure> {
        const PROBE_PROMPT: &str = "Generate 'Hello World'";

        let (provider, timeouts) = self.provider_for(provider_id, model_id).await?;
        let key = ModelKey::new(provider_id, model_id);
        {
            let inner = self.inner.lock().await;
            let reason = match inner.catalog.get(&key) {
                None => Some(RejectReason::ModelNotFound),
                Some(d) if d.is_blacklisted() => Some(RejectReason::Blacklisted),
                Some(_) => None,
            };
            if let Some(reason) = reason {
                return Err(rejected(provider_id, model_id, reason));
            }
        }

        let limit = timeouts.get(OperationCategory::InferenceFirstToken);
        let (budget, _) = provider.budget(&timeouts).clamp(Some(limit));
        let started = Instant::now();
        let result = match tokio::time::timeout(
            budget.total,
            provider.request(model_id, PROBE_PROMPT, budget),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::RequestTimeout(budget.total)),
        };

        let mut transitions = Vec::new();
        match result {
            Ok(_) => {
                let mut inner = self.inner.lock().await;
                transitions.extend(inner.catalog.record_success(&key));
                let health = inner
                    .catalog
                    .get(&key)
                    .map(|d| d.health)
                    .unwrap_or(ModelHealth::Unknown);
                self.publish(&mut inner);
                debug!(%key, %health, "Probe succeeded");
                Ok(ProbeReport {
                    provider_id: provider_id.to_string(),
                    model_id: model_id.to_string(),
                    health,
                    latency_ms: started.elapsed().as_millis() as u64,
                    transitions,
                })
            }
            Err(error) => {
                let decision = self
                    .record_failure(&key, &error, &mut transitions, false)
                    .await;
                Err(decision.failure.with_transitions(transitions))
            }
        }
    }

    async fn provider_for(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<(SharedProvider, TimeoutPolicy), InferenceFailure> {
        let registry = self.registry.read().await;
        let provider = registry
            .get(provider_id)
            .map_err(|_| rejected(provider_id, model_id, RejectReason::ProviderNotFound))?;
        Ok((provider, registry.timeouts().clone()))
    }

    // ------------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------------

    pub async fn phase(&self) -> SelectionPhase {
        self.inner.lock().await.phase
    }

    /// Current session state with a fresh health snapshot.
    pub async fn current_state(&self) -> SessionState {
        let inner = self.inner.lock().await;
        let mut state = inner.session.clone();
        state.model_health_snapshot = inner.catalog.ordered(&inner.provider_order);
        state
    }

    pub async fn set_database(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        inner.session.selected_database = name.to_string();
        self.publish(&mut inner);
    }

    /// Store a credential for a provider in the secrets store.
    ///
    /// A registered provider's `credential_ref` names the key; otherwise
    /// the provider id does.
    pub async fn set_credential(&self, provider_id: &str, value: &str) -> SecretsResult<()> {
        let (key, secrets) = {
            let registry = self.registry.read().await;
            let key = registry
                .get(provider_id)
                .map(|p| p.config().credential_key().to_string())
                .unwrap_or_else(|_| provider_id.to_string());
            (key, registry.secrets().clone())
        };
        secrets.set_key_async(&key, value).await?;
        info!(provider = %provider_id, "Credential updated");
        Ok(())
    }

    /// Receiver of every published session state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Re-apply a loaded snapshot and re-validate it against live state.
    ///
    /// Health is restored only onto models the last refresh catalogued; the
    /// selection survives only if its provider is registered and its model is
    /// still listed and not blacklisted.
    pub async fn apply_recovered(&self, snapshot: Option<SessionState>) -> RecoveryReport {
        let Some(snapshot) = snapshot else {
            info!("No session snapshot; starting from defaults");
            return RecoveryReport::defaults();
        };

        let (registered, default_mode) = {
            let registry = self.registry.read().await;
            (
                registry.ids(),
                default_mode(&registry, &self.settings.default_provider),
            )
        };

        let mut inner = self.inner.lock().await;
        let mut report = RecoveryReport {
            source: RecoverySource::Snapshot,
            recovered: Vec::new(),
            reset: Vec::new(),
            restored_descriptors: 0,
        };

        for descriptor in snapshot.model_health_snapshot {
            let key = descriptor.key();
            if !registered.contains(&key.provider_id) {
                debug!(%key, "Dropping health record of unregistered provider");
            } else if inner.catalog.restore(descriptor) {
                report.restored_descriptors += 1;
            } else {
                debug!(%key, "Dropping health record of model no longer listed");
            }
        }
        if report.restored_descriptors > 0 {
            report.recovered.push(SessionField::ModelHealth);
        }

        inner.session.selected_database = snapshot.selected_database;
        inner.session.started_at = snapshot.started_at;
        report.recovered.push(SessionField::SelectedDatabase);
        if snapshot.last_query.is_some() {
            inner.session.last_query = snapshot.last_query;
            report.recovered.push(SessionField::LastQuery);
        }

        let provider_valid = registered.contains(&snapshot.selected_provider);
        let key = ModelKey::new(&snapshot.selected_provider, &snapshot.selected_model);
        let descriptor = inner
            .catalog
            .get(&key)
            .filter(|d| provider_valid && !d.is_blacklisted())
            .cloned();

        match descriptor {
            Some(descriptor) => {
                apply_selection(&mut inner, &descriptor);
                report.recovered.extend([
                    SessionField::SelectedProvider,
                    SessionField::SelectedModel,
                    SessionField::Mode,
                ]);
            }
            None => {
                if !provider_valid {
                    report.reset.push(SessionField::SelectedProvider);
                }
                report.reset.extend([SessionField::SelectedModel, SessionField::Mode]);
                inner.session.selected_provider = self.settings.default_provider.clone();
                inner.session.selected_model = self.settings.default_model.clone();
                inner.session.mode = default_mode;
                if inner.phase == SelectionPhase::Active {
                    inner.phase = SelectionPhase::Unselected;
                }
                warn!(
                    provider = %snapshot.selected_provider,
                    model = %snapshot.selected_model,
                    "Recovered selection is no longer valid; reset to defaults"
                );
            }
        }

        self.publish(&mut inner);
        info!(
            recovered = report.recovered.len(),
            reset = report.reset.len(),
            restored = report.restored_descriptors,
            "Session recovered from snapshot"
        );
        report
    }

    /// Push the current session to subscribers.
    fn publish(&self, inner: &mut Inner) {
        inner.session.model_health_snapshot = inner.catalog.ordered(&inner.provider_order);
        inner.session.touch();
        self.state_tx.send_replace(inner.session.clone());
    }
}

fn apply_selection(inner: &mut Inner, descriptor: &ModelDescriptor) {
    inner.session.selected_provider = descriptor.provider_id.clone();
    inner.session.selected_model = descriptor.id.clone();
    inner.session.mode = descriptor.location;
    inner.phase = SelectionPhase::Active;
}

fn rejected(provider_id: &str, model_id: &str, reason: RejectReason) -> InferenceFailure {
    InferenceFailure::new(
        provider_id,
        model_id,
        ErrorKind::SelectionRejected,
        &reason.to_string(),
    )
}

fn default_mode(registry: &ProviderRegistry, provider_id: &str) -> ProviderKind {
    registry
        .get(provider_id)
        .map(|p| p.location())
        .unwrap_or(ProviderKind::Local)
}

fn remaining(deadline: Option<Duration>, started: Instant) -> Option<Duration> {
    deadline.map(|d| d.saturating_sub(started.elapsed()))
}
