//! Operator CLI for the SQL agent's model orchestration
//!
//! ```bash
//! # Discovered models with their health
//! sql-agent models
//!
//! # Pick a model and ask a question
//! sql-agent select ollama qwen2.5-coder:1.5b
//! sql-agent infer "how many orders shipped last week?" --deadline-ms 120000
//!
//! # Download a model onto Ollama, then check that it answers
//! sql-agent pull ollama phi:latest
//! sql-agent probe ollama phi:latest
//!
//! # Store the Anthropic key (prompted on stdin when the value is omitted)
//! sql-agent set-key anthropic
//!
//! # Custom configuration
//! OLLAMA_TIMEOUT_INFERENCE_FIRST_TOKEN=120 sql-agent --config ./agent.toml status
//! ```
//!
//! Results are printed to stdout as JSON; logs go to stderr.

mod commands;
mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use commands::Runtime;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file (defaults to ./sql-agent.toml when present)
    #[arg(long, env = "SQL_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Start from defaults instead of the last session snapshot
    #[arg(long, default_value_t = false)]
    no_recover: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every known model with its health
    Models,
    /// Make a model the active selection
    Select { provider: String, model: String },
    /// Run a prompt on the active model
    Infer {
        prompt: String,
        /// Upper bound for the whole call, fallbacks included
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
    /// Session state and provider liveness
    Status,
    /// Current fallback order
    Fallback,
    /// Download a model onto a local provider
    Pull { provider: String, model: String },
    /// Send a short test prompt to a model and record its health
    Probe { provider: String, model: String },
    /// Store a provider credential in the secrets file
    SetKey {
        provider: String,
        /// Read from stdin when omitted
        value: Option<String>,
    },
    /// Re-apply the last session snapshot and report what survived
    Recover,
    /// Effective timeout per operation category
    Timeouts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = config::load_config(cli.config.as_deref())?;
    let recover = !cli.no_recover || matches!(cli.command, Command::Recover);
    let rt = Runtime::start(config, recover).await?;
    info!(
        providers = rt.config.providers.len(),
        session = %rt.store.path().display(),
        "sql-agent ready"
    );

    let result = match &cli.command {
        Command::Models => commands::models(&rt).await,
        Command::Select { provider, model } => commands::select(&rt, provider, model).await,
        Command::Infer {
            prompt,
            deadline_ms,
        } => commands::infer(&rt, prompt, deadline_ms.map(Duration::from_millis)).await,
        Command::Status => commands::status(&rt).await,
        Command::Fallback => commands::fallback(&rt).await,
        Command::Pull { provider, model } => commands::pull(&rt, provider, model).await,
        Command::Probe { provider, model } => commands::probe(&rt, provider, model).await,
        Command::SetKey { provider, value } => {
            commands::set_key(&rt, provider, value.clone()).await
        }
        Command::Recover => commands::recover(&rt).await,
        Command::Timeouts => commands::timeouts(&rt).await,
    };

    // Flush the session even when the command failed.
    let stats = rt.shutdown().await;
    debug!(snapshots = stats.snapshots, failures = stats.failures, "Session flushed");

    result
}
