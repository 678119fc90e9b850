//! Model catalog, health classification and fallback ordering
//!
//! Every model any provider has ever reported is tracked as a
//! [`ModelDescriptor`] keyed by `(provider_id, model_id)`. Records are never
//! removed, only re-classified:
//!
//! ```text
//! Unknown ──success──▶ Healthy ◀──success── Degraded
//!    │                   │                    │
//!    └──timeout/backend──┴──────────▶ Degraded ──threshold──▶ Blacklisted
//!    └──incompatible─────────────────────────────────────────▶ Blacklisted
//! ```
//!
//! Blacklisted is terminal for the lifetime of the process. Connection
//! failures degrade a model without counting toward the threshold and carry
//! an exponential backoff hint instead.
//!
//! [`ModelCatalog::fallback_order`] is a pure function of catalog state and
//! the configured priority list, so two catalogs in the same state always
//! produce the same order.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{sanitize_message, ErrorKind};
use crate::provider::ProviderKind;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelHealth {
    Unknown,
    Healthy,
    Degraded,
    Blacklisted,
}

impl std::fmt::Display for ModelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Blacklisted => write!(f, "blacklisted"),
        }
    }
}

/// Identity of a model: the provider that serves it plus its id there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelKey {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/// One model offered by one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub provider_id: String,
    pub location: ProviderKind,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub health: ModelHealth,
    #[serde(default)]
    pub last_error: Option<String>,
    pub last_checked: DateTime<Utc>,
}

impl ModelDescriptor {
    pub fn new(
        id: impl Into<String>,
        provider_id: impl Into<String>,
        location: ProviderKind,
        size_bytes: Option<u64>,
    ) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            location,
            size_bytes,
            health: ModelHealth::Unknown,
            last_error: None,
            last_checked: Utc::now(),
        }
    }

    pub fn key(&self) -> ModelKey {
        ModelKey::new(&self.provider_id, &self.id)
    }

    pub fn is_blacklisted(&self) -> bool {
        self.health == ModelHealth::Blacklisted
    }
}

/// A recorded health change, returned alongside inference results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthTransition {
    pub key: ModelKey,
    pub from: ModelHealth,
    pub to: ModelHealth,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Demotion threshold and connection backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Consecutive timeout/backend failures that blacklist a model.
    pub failure_threshold: u32,
    /// Backoff after the first connection failure.
    pub backoff_base: Duration,
    /// Upper bound of the backoff curve.
    pub backoff_max: Duration,
    /// Keep a persisted blacklist when a snapshot is recovered. When false,
    /// recovered blacklisted models come back `Degraded`.
    pub restore_blacklist: bool,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_base: Duration::from_millis(2000),
            backoff_max: Duration::from_millis(60_000),
            restore_blacklist: true,
        }
    }
}

impl HealthPolicy {
    /// Backoff after `failures` consecutive connection failures:
    /// `base * 2^(failures - 1)`, capped at `backoff_max`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// One entry of the configured preference list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityEntry {
    /// Restrict the entry to one provider; `None` matches any provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub model: String,
}

impl PriorityEntry {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            provider: None,
            model: model.into(),
        }
    }

    pub fn pinned(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            model: model.into(),
        }
    }

    fn matches(&self, key: &ModelKey) -> bool {
        key.model_id == self.model
            && self
                .provider
                .as_deref()
                .map(|p| p == key.provider_id)
                .unwrap_or(true)
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureEffect {
    pub transition: Option<HealthTransition>,
    /// The model is blacklisted after this failure.
    pub blacklisted: bool,
    /// Suggested wait before retrying (connection failures).
    pub retry_after: Option<Duration>,
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone)]
struct CatalogEntry {
    descriptor: ModelDescriptor,
    consecutive_failures: u32,
    connection_failures: u32,
}

impl CatalogEntry {
    fn new(descriptor: ModelDescriptor) -> Self {
        Self {
            descriptor,
            consecutive_failures: 0,
            connection_failures: 0,
        }
    }

    fn set_health(&mut self, to: ModelHealth, reason: &str) -> Option<HealthTransition> {
        let from = self.descriptor.health;
        self.descriptor.health = to;
        self.descriptor.last_checked = Utc::now();
        if from == to {
            return None;
        }

        let key = self.descriptor.key();
        match to {
            ModelHealth::Blacklisted => {
                warn!(provider = %key.provider_id, model = %key.model_id, %from, reason, "Model blacklisted")
            }
            ModelHealth::Degraded => {
                warn!(provider = %key.provider_id, model = %key.model_id, %from, reason, "Model degraded")
            }
            _ => info!(provider = %key.provider_id, model = %key.model_id, %from, %to, "Model health changed"),
        }

        Some(HealthTransition {
            key,
            from,
            to,
            at: self.descriptor.last_checked,
            reason: reason.to_string(),
        })
    }
}

/// All known models and their health.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    entries: BTreeMap<ModelKey, CatalogEntry>,
    policy: HealthPolicy,
}

impl ModelCatalog {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge a provider's model listing.
    ///
    /// Existing records keep their health; new records start `Unknown`,
    /// except models named in `known_incompatible`, which start blacklisted.
    /// Returns the number of new records and any seeded transitions.
    pub fn merge_listing(
        &mut self,
        listing: Vec<ModelDescriptor>,
        known_incompatible: &[String],
    ) -> (usize, Vec<HealthTransition>) {
        let mut added = 0;
        let mut transitions = Vec::new();

        for listed in listing {
            let key = listed.key();
            match self.entries.get_mut(&key) {
                Some(entry) => {
                    entry.descriptor.size_bytes = listed.size_bytes.or(entry.descriptor.size_bytes);
                    entry.descriptor.location = listed.location;
                }
                None => {
                    let mut entry = CatalogEntry::new(listed);
                    entry.descriptor.health = ModelHealth::Unknown;
                    if known_incompatible.iter().any(|m| *m == key.model_id) {
                        entry.descriptor.last_error = Some("known incompatible model".to_string());
                        transitions.extend(entry.set_health(ModelHealth::Blacklisted, "known incompatible"));
                    }
                    self.entries.insert(key, entry);
                    added += 1;
                }
            }
        }

        (added, transitions)
    }

    /// Re-apply a persisted descriptor onto a model the provider still lists.
    ///
    /// Returns `false`, leaving the catalog untouched, when the model is not
    /// catalogued. A persisted blacklist is kept unless the policy says
    /// otherwise, in which case the model comes back `Degraded`.
    pub fn restore(&mut self, descriptor: ModelDescriptor) -> bool {
        let restore_blacklist = self.policy.restore_blacklist;
        let Some(entry) = self.entries.get_mut(&descriptor.key()) else {
            return false;
        };

        let size = entry.descriptor.size_bytes;
        let location = entry.descriptor.location;
        entry.descriptor = descriptor;
        entry.descriptor.size_bytes = entry.descriptor.size_bytes.or(size);
        entry.descriptor.location = location;
        entry.consecutive_failures = 0;
        entry.connection_failures = 0;
        if entry.descriptor.is_blacklisted() && !restore_blacklist {
            entry.descriptor.health = ModelHealth::Degraded;
        }
        true
    }

    pub fn get(&self, key: &ModelKey) -> Option<&ModelDescriptor> {
        self.entries.get(key).map(|e| &e.descriptor)
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn consecutive_failures(&self, key: &ModelKey) -> u32 {
        self.entries
            .get(key)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    /// Every descriptor of registered providers, ordered by provider
    /// registration position, then model id.
    pub fn ordered(&self, registration_order: &[String]) -> Vec<ModelDescriptor> {
        let mut descriptors: Vec<(usize, &ModelDescriptor)> = self
            .entries
            .values()
            .filter_map(|e| {
                registration_order
                    .iter()
                    .position(|p| *p == e.descriptor.provider_id)
                    .map(|pos| (pos, &e.descriptor))
            })
            .collect();
        descriptors.sort_by(|(pa, a), (pb, b)| pa.cmp(pb).then_with(|| a.id.cmp(&b.id)));
        descriptors.into_iter().map(|(_, d)| d.clone()).collect()
    }

    /// Record a successful request. Blacklisted models stay blacklisted.
    pub fn record_success(&mut self, key: &ModelKey) -> Option<HealthTransition> {
        let entry = self.entries.get_mut(key)?;
        if entry.descriptor.is_blacklisted() {
            return None;
        }
        entry.consecutive_failures = 0;
        entry.connection_failures = 0;
        entry.descriptor.last_error = None;
        entry.set_health(ModelHealth::Healthy, "request succeeded")
    }

    /// Record a failed request and re-classify the model.
    pub fn record_failure(&mut self, key: &ModelKey, kind: ErrorKind, message: &str) -> FailureEffect {
        let policy = self.policy;
        let Some(entry) = self.entries.get_mut(key) else {
            return FailureEffect::default();
        };
        if entry.descriptor.is_blacklisted() {
            return FailureEffect {
                blacklisted: true,
                ..FailureEffect::default()
            };
        }

        let reason = sanitize_message(message);
        match kind {
            ErrorKind::Timeout | ErrorKind::Backend => {
                entry.consecutive_failures += 1;
                entry.descriptor.last_error = Some(reason.clone());
                let to = if entry.consecutive_failures >= policy.failure_threshold {
                    ModelHealth::Blacklisted
                } else {
                    ModelHealth::Degraded
                };
                let reason = format!(
                    "{} ({}/{} consecutive failures)",
                    kind, entry.consecutive_failures, policy.failure_threshold
                );
                FailureEffect {
                    transition: entry.set_health(to, &reason),
                    blacklisted: to == ModelHealth::Blacklisted,
                    retry_after: None,
                }
            }
            ErrorKind::IncompatibleModel => {
                entry.descriptor.last_error = Some(reason.clone());
                FailureEffect {
                    transition: entry.set_health(ModelHealth::Blacklisted, &reason),
                    blacklisted: true,
                    retry_after: None,
                }
            }
            ErrorKind::ConnectionUnavailable => {
                entry.connection_failures += 1;
                entry.descriptor.last_error = Some(reason.clone());
                let retry_after = policy.backoff(entry.connection_failures);
                FailureEffect {
                    transition: entry.set_health(ModelHealth::Degraded, &reason),
                    blacklisted: false,
                    retry_after: Some(retry_after),
                }
            }
            // Configuration problems say nothing about the model.
            ErrorKind::CredentialNotFound
            | ErrorKind::CredentialRejected
            | ErrorKind::SelectionRejected
            | ErrorKind::PersistenceFailure => FailureEffect::default(),
        }
    }

    /// Forget the health of a re-registered provider's models.
    ///
    /// Blacklisted records survive; everything else returns to `Unknown`.
    pub fn reset_provider(&mut self, provider_id: &str) -> Vec<HealthTransition> {
        self.entries
            .values_mut()
            .filter(|e| e.descriptor.provider_id == provider_id && !e.descriptor.is_blacklisted())
            .filter_map(|e| {
                e.consecutive_failures = 0;
                e.connection_failures = 0;
                e.descriptor.last_error = None;
                e.set_health(ModelHealth::Unknown, "provider re-registered")
            })
            .collect()
    }

    /// Deterministic list of non-blacklisted candidates.
    ///
    /// Priority entries come first in listed order (an entry without a
    /// provider matches in registration order), then remaining local models,
    /// then remaining remote models. Ties break by provider registration
    /// position, then model id.
    pub fn fallback_order(
        &self,
        registration_order: &[String],
        priority: &[PriorityEntry],
    ) -> Vec<ModelKey> {
        let eligible: Vec<ModelDescriptor> = self
            .ordered(registration_order)
            .into_iter()
            .filter(|d| !d.is_blacklisted())
            .collect();

        let mut seen: HashSet<ModelKey> = HashSet::new();
        let mut order = Vec::with_capacity(eligible.len());

        for entry in priority {
            for descriptor in &eligible {
                let key = descriptor.key();
                if entry.matches(&key) && seen.insert(key.clone()) {
                    order.push(key);
                }
            }
        }

        for location in [ProviderKind::Local, ProviderKind::Remote] {
            for descriptor in eligible.iter().filter(|d| d.location == location) {
                let key = descriptor.key();
                if seen.insert(key.clone()) {
                    order.push(key);
                }
            }
        }

        order
    }
}
