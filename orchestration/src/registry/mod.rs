//! Provider registry: the set of configured inference backends
//!
//! Providers are kept in registration order; that order breaks ties in
//! fallback ordering. The registry is append-only: re-registering an id
//! replaces the provider in place and keeps its position.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::provider::{
    LocalProvider, ProviderConfig, ProviderError, ProviderKind, RemoteProvider, SharedProvider,
};
use crate::secrets::SecretsResolver;
use crate::timeouts::TimeoutPolicy;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider '{0}' is not registered")]
    ProviderNotFound(String),

    #[error("invalid provider config for '{id}': {reason}")]
    InvalidConfig { id: String, reason: String },

    #[error("failed to build provider '{id}': {source}")]
    Provider {
        id: String,
        #[source]
        source: ProviderError,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Whether a registration added a new provider or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    Replaced,
}

pub struct ProviderRegistry {
    entries: Vec<SharedProvider>,
    timeouts: TimeoutPolicy,
    secrets: SecretsResolver,
}

impl ProviderRegistry {
    pub fn new(timeouts: TimeoutPolicy, secrets: SecretsResolver) -> Self {
        Self {
            entries: Vec::new(),
            timeouts,
            secrets,
        }
    }

    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.timeouts
    }

    pub fn secrets(&self) -> &SecretsResolver {
        &self.secrets
    }

    /// Build and register the provider variant matching `config.kind`.
    pub fn register(&mut self, config: ProviderConfig) -> RegistryResult<Registration> {
        validate(&config)?;
        let id = config.id.clone();
        let provider: SharedProvider = match config.kind {
            ProviderKind::Local => Arc::new(
                LocalProvider::new(config, &self.timeouts)
                    .map_err(|source| RegistryError::Provider { id, source })?,
            ),
            ProviderKind::Remote => Arc::new(
                RemoteProvider::new(config, &self.timeouts, self.secrets.clone())
                    .map_err(|source| RegistryError::Provider { id, source })?,
            ),
        };
        Ok(self.register_provider(provider))
    }

    /// Register an already-built provider.
    pub fn register_provider(&mut self, provider: SharedProvider) -> Registration {
        let id = provider.id().to_string();
        let kind = provider.location();
        match self.entries.iter().position(|p| p.id() == id) {
            Some(pos) => {
                self.entries[pos] = provider;
                info!(provider = %id, %kind, "Provider re-registered");
                Registration::Replaced
            }
            None => {
                self.entries.push(provider);
                info!(provider = %id, %kind, "Provider registered");
                Registration::Added
            }
        }
    }

    pub fn get(&self, id: &str) -> RegistryResult<SharedProvider> {
        self.entries
            .iter()
            .find(|p| p.id() == id)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound(id.to_string()))
    }

    /// Provider ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|p| p.id().to_string()).collect()
    }

    /// Providers in registration order.
    pub fn providers(&self) -> Vec<SharedProvider> {
        self.entries.clone()
    }
}

fn validate(config: &ProviderConfig) -> RegistryResult<()> {
    let invalid = |reason: String| RegistryError::InvalidConfig {
        id: config.id.clone(),
        reason,
    };

    if config.id.trim().is_empty() {
        return Err(invalid("provider id is empty".to_string()));
    }
    let url = reqwest::Url::parse(&config.endpoint)
        .map_err(|e| invalid(format!("endpoint '{}': {}", config.endpoint, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(TimeoutPolicy::defaults(), SecretsResolver::new("/nonexistent"))
    }

    #[test]
    fn test_register_keeps_order() {
        let mut reg = registry();
        reg.register(ProviderConfig::local("local-a", "http://localhost:11434"))
            .unwrap();
        reg.register(ProviderConfig::remote("remote-b", "https://api.example.com/v1/messages"))
            .unwrap();
        assert_eq!(reg.ids(), vec!["local-a", "remote-b"]);
        assert_eq!(reg.get("remote-b").unwrap().location(), ProviderKind::Remote);
    }

    #[test]
    fn test_reregister_replaces_in_place() {
        let mut reg = registry();
        reg.register(ProviderConfig::local("a", "http://localhost:1")).unwrap();
        reg.register(ProviderConfig::local("b", "http://localhost:2")).unwrap();

        let outcome = reg.register(ProviderConfig::local("a", "http://localhost:3")).unwrap();
        assert_eq!(outcome, Registration::Replaced);
        assert_eq!(reg.ids(), vec!["a", "b"]);
        assert_eq!(reg.get("a").unwrap().config().endpoint, "http://localhost:3");
    }

    #[test]
    fn test_get_unknown_provider() {
        let reg = registry();
        assert!(matches!(reg.get("nope"), Err(RegistryError::ProviderNotFound(id)) if id == "nope"));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut reg = registry();
        assert!(matches!(
            reg.register(ProviderConfig::local("x", "not a url")),
            Err(RegistryError::InvalidConfig { .. })
        ));
        assert!(matches!(
            reg.register(ProviderConfig::local("x", "ftp://host")),
            Err(RegistryError::InvalidConfig { .. })
        ));
        assert!(reg.ids().is_empty());
    }
}
