//! Locating and loading the orchestrator config file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use orchestration::OrchestratorConfig;
use tracing::{debug, info};

/// Picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "sql-agent.toml";

/// The config file to read, if any.
///
/// An explicit path (flag or `SQL_AGENT_CONFIG`) is always returned, even if
/// missing, so the load fails loudly; the working-directory default is only
/// used when it exists.
pub fn resolve_config_path(explicit: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let candidate = cwd.join(DEFAULT_CONFIG_FILE);
    candidate.is_file().then_some(candidate)
}

pub fn load_config(explicit: Option<&Path>) -> Result<OrchestratorConfig> {
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    match resolve_config_path(explicit, &cwd) {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            OrchestratorConfig::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))
        }
        None => {
            debug!("No config file; using built-in defaults");
            Ok(OrchestratorConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_path_wins() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "").unwrap();
        let explicit = dir.path().join("other.toml");

        assert_eq!(
            resolve_config_path(Some(&explicit), dir.path()),
            Some(explicit)
        );
    }

    #[test]
    fn test_cwd_default_only_when_present() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_config_path(None, dir.path()), None);

        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "").unwrap();
        assert_eq!(
            resolve_config_path(None, dir.path()),
            Some(dir.path().join(DEFAULT_CONFIG_FILE))
        );
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }

    #[test]
    fn test_explicit_file_is_parsed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "default_model = \"phi:latest\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.default_model, "phi:latest");
    }
}
