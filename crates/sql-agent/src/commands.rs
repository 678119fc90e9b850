//! Runtime wiring and subcommand handlers.
//!
//! Every invocation builds the manager from config, refreshes the catalog,
//! optionally recovers the last session, and runs the autosave task until
//! the command finishes. Shutdown flushes a final snapshot.

use std::io::BufRead;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use orchestration::{
    spawn_autosave, AutosaveHandle, AutosaveStats, ModelManager, OrchestratorConfig,
    RecoveryReport, SelectionPhase, SessionStateStore, SharedModelManager, SharedSessionStore,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

pub struct Runtime {
    pub config: OrchestratorConfig,
    pub manager: SharedModelManager,
    pub store: SharedSessionStore,
    pub recovery: Option<RecoveryReport>,
    autosave: AutosaveHandle,
}

impl Runtime {
    pub async fn start(config: OrchestratorConfig, recover: bool) -> Result<Self> {
        let manager = ModelManager::from_config(&config)
            .context("Failed to build model manager")?
            .shared();
        let store = SessionStateStore::new(config.session_path()).shared();

        let refresh = manager.refresh_catalog().await;
        for failure in &refresh.failures {
            warn!(
                provider = %failure.provider_id,
                kind = %failure.kind,
                error = %failure.message,
                "Provider listing failed"
            );
        }
        info!(
            discovered = refresh.discovered,
            total = refresh.total,
            "Catalog refreshed"
        );

        let recovery = if recover {
            Some(store.recover(&manager).await)
        } else {
            None
        };

        let autosave = spawn_autosave(store.clone(), manager.subscribe(), config.autosave_config());

        Ok(Self {
            config,
            manager,
            store,
            recovery,
            autosave,
        })
    }

    pub async fn shutdown(self) -> AutosaveStats {
        self.autosave.shutdown().await
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", out);
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn models(rt: &Runtime) -> Result<()> {
    print_json(&rt.manager.list_models().await)
}

pub async fn select(rt: &Runtime, provider: &str, model: &str) -> Result<()> {
    let descriptor = rt
        .manager
        .select(provider, model)
        .await
        .with_context(|| format!("Selection of {}/{} failed", provider, model))?;
    print_json(&descriptor)
}

pub async fn infer(rt: &Runtime, prompt: &str, deadline: Option<Duration>) -> Result<()> {
    if rt.manager.phase().await != SelectionPhase::Active {
        rt.manager
            .ensure_selection()
            .await
            .context("No usable model to run the prompt on")?;
    }

    match rt.manager.infer(prompt, deadline).await {
        Ok(outcome) => print_json(&outcome),
        Err(failure) => {
            print_json(&failure)?;
            bail!("Inference failed: {}", failure);
        }
    }
}

pub async fn status(rt: &Runtime) -> Result<()> {
    let state = rt.manager.current_state().await;
    let providers = rt.manager.provider_status().await;
    print_json(&json!({
        "phase": rt.manager.phase().await,
        "session": state,
        "providers": providers,
    }))
}

pub async fn fallback(rt: &Runtime) -> Result<()> {
    let order: Vec<String> = rt
        .manager
        .fallback_order()
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    print_json(&order)
}

pub async fn pull(rt: &Runtime, provider: &str, model: &str) -> Result<()> {
    match rt.manager.pull_model(provider, model).await {
        Ok(descriptor) => print_json(&descriptor),
        Err(failure) => {
            print_json(&failure)?;
            bail!("Pull of {}/{} failed: {}", provider, model, failure);
        }
    }
}

pub async fn probe(rt: &Runtime, provider: &str, model: &str) -> Result<()> {
    match rt.manager.probe_model(provider, model).await {
        Ok(report) => print_json(&report),
        Err(failure) => {
            print_json(&failure)?;
            bail!("Probe of {}/{} failed: {}", provider, model, failure);
        }
    }
}

pub async fn set_key(rt: &Runtime, provider: &str, value: Option<String>) -> Result<()> {
    let value = match value {
        Some(value) => value,
        None => read_secret_from_stdin()?,
    };
    if value.trim().is_empty() {
        bail!("Refusing to store an empty credential for '{}'", provider);
    }
    rt.manager
        .set_credential(provider, value.trim())
        .await
        .with_context(|| format!("Failed to store credential for '{}'", provider))?;
    print_json(&json!({ "provider": provider, "stored": true }))
}

pub async fn recover(rt: &Runtime) -> Result<()> {
    let report = match &rt.recovery {
        Some(report) => report.clone(),
        None => rt.store.recover(&rt.manager).await,
    };
    print_json(&report)
}

pub async fn timeouts(rt: &Runtime) -> Result<()> {
    let policy = rt.manager.timeouts().await;
    let rows: Vec<_> = policy
        .profile()
        .map(|(category, limit)| {
            json!({
                "category": category.name(),
                "seconds": limit.as_secs(),
                "env": category.env_var(),
                "overridden": policy.is_overridden(category),
            })
        })
        .collect();
    print_json(&rows)
}

fn read_secret_from_stdin() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read credential from stdin")?;
    Ok(line)
}
