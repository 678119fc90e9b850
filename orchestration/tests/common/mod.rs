//! Shared fixtures: a scripted in-memory provider and manager builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orchestration::provider::ProviderResult;
use orchestration::{
    Completion, ManagerSettings, ModelDescriptor, ModelManager, Provider, ProviderConfig,
    ProviderError, ProviderRegistry, RequestBudget, SecretsResolver, TimeoutPolicy,
};

/// What the next request returns.
#[derive(Debug, Clone)]
pub enum Step {
    Answer(String),
    Fail(ProviderError),
    /// Sleep, then answer.
    Stall(Duration),
    /// Sleep, then fail.
    FailAfter(Duration, ProviderError),
}

/// Provider whose responses are queued up front.
///
/// Requests pop the next step; an empty script answers `"ok from <model>"`.
/// Models named in `pullable` join the listing once pulled.
pub struct ScriptedProvider {
    config: ProviderConfig,
    models: Mutex<Vec<String>>,
    pullable: Vec<String>,
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn local(id: &str, models: &[&str]) -> Self {
        Self::with_config(ProviderConfig::local(id, "http://localhost:1"), models)
    }

    pub fn remote(id: &str, models: &[&str]) -> Self {
        Self::with_config(ProviderConfig::remote(id, "https://llm.invalid/v1"), models)
    }

    fn with_config(config: ProviderConfig, models: &[&str]) -> Self {
        Self {
            config,
            models: Mutex::new(models.iter().map(|m| m.to_string()).collect()),
            pullable: Vec::new(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_pullable(mut self, models: &[&str]) -> Self {
        self.pullable = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.push(step);
        self
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn list_models(&self, _: &TimeoutPolicy) -> ProviderResult<Vec<ModelDescriptor>> {
        Ok(self
            .models
            .lock()
            .unwrap()
            .iter()
            .map(|m| ModelDescriptor::new(m, &self.config.id, self.config.kind, None))
            .collect())
    }

    async fn pull(&self, model_id: &str, _: &TimeoutPolicy) -> ProviderResult<()> {
        if !self.pullable.iter().any(|m| m == model_id) {
            return Err(ProviderError::Backend {
                status: Some(500),
                message: "pull model manifest: file does not exist".to_string(),
            });
        }
        let mut models = self.models.lock().unwrap();
        if !models.iter().any(|m| m == model_id) {
            models.push(model_id.to_string());
        }
        Ok(())
    }

    async fn request(
        &self,
        model_id: &str,
        _prompt: &str,
        _budget: RequestBudget,
    ) -> ProviderResult<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        let text = match step {
            Some(Step::Answer(text)) => text,
            Some(Step::Fail(e)) => return Err(e),
            Some(Step::FailAfter(d, e)) => {
                tokio::time::sleep(d).await;
                return Err(e);
            }
            Some(Step::Stall(d)) => {
                tokio::time::sleep(d).await;
                format!("late answer from {}", model_id)
            }
            None => format!("ok from {}", model_id),
        };
        Ok(Completion {
            text,
            tokens: Some(3),
            model: model_id.to_string(),
        })
    }
}

pub fn settings() -> ManagerSettings {
    ManagerSettings {
        default_provider: "local-a".to_string(),
        default_model: "m1".to_string(),
        ..ManagerSettings::default()
    }
}

/// Manager over `providers`, registered in order, catalog refreshed.
pub async fn manager_with(
    providers: Vec<Arc<ScriptedProvider>>,
    settings: ManagerSettings,
) -> ModelManager {
    let registry = ProviderRegistry::new(
        TimeoutPolicy::defaults(),
        SecretsResolver::new("/nonexistent/sql_agent_secrets"),
    );
    let manager = ModelManager::new(registry, settings);
    for provider in providers {
        manager.register_provider(provider).await;
    }
    manager.refresh_catalog().await;
    manager
}

pub fn first_token_timeout() -> ProviderError {
    ProviderError::FirstTokenTimeout(Duration::from_secs(60))
}
