//! Layered credential resolution
//!
//! A key is resolved, first match wins, from:
//! 1. the environment variable named exactly like the key
//! 2. the environment variable named like the key in `UPPER_SNAKE` form
//! 3. the line-oriented store file (`KEY=value`, `#` comments)
//!
//! The store is read on every lookup, so a key written by another process is
//! picked up without a restart and a missing key is never cached. Async
//! callers go through the `*_async` variants, which do the file I/O on the
//! blocking pool.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Default store file name, placed in the user's home directory.
pub const DEFAULT_STORE_NAME: &str = ".sql_agent_secrets";

/// Environment variable that relocates the store file.
pub const STORE_PATH_ENV: &str = "SQL_AGENT_SECRETS_FILE";

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("no credential found for '{key}'")]
    CredentialNotFound { key: String },

    #[error("secrets store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid secret key '{0}'")]
    InvalidKey(String),
}

pub type SecretsResult<T> = Result<T, SecretsError>;

/// An opaque secret. Never printed, never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret, for placing into a request header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Resolves provider credentials from the environment and the store file.
#[derive(Debug, Clone)]
pub struct SecretsResolver {
    path: PathBuf,
}

impl Default for SecretsResolver {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl SecretsResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `SQL_AGENT_SECRETS_FILE` if set, else `~/.sql_agent_secrets`.
    pub fn default_path() -> PathBuf {
        std::env::var(STORE_PATH_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_home(&s))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(DEFAULT_STORE_NAME)
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a credential by key name.
    pub fn get_key(&self, key: &str) -> SecretsResult<Credential> {
        if let Some(value) = env_value(key) {
            debug!(key, source = "env", "Credential resolved");
            return Ok(Credential::new(value));
        }

        let normalized = normalize_key(key);
        if normalized != key {
            if let Some(value) = env_value(&normalized) {
                debug!(key, source = "env", "Credential resolved");
                return Ok(Credential::new(value));
            }
        }

        if let Some(value) = self.read_store_value(key)? {
            debug!(key, source = "store", "Credential resolved");
            return Ok(Credential::new(value));
        }

        Err(SecretsError::CredentialNotFound {
            key: key.to_string(),
        })
    }

    /// Write or replace a key in the store.
    ///
    /// The file is rewritten through a temp file and a rename; a new file is
    /// created with mode `0600`. Comments and other keys keep their order.
    pub fn set_key(&self, key: &str, value: &str) -> SecretsResult<()> {
        let key = key.trim();
        if key.is_empty() || key.contains('=') || key.contains('\n') || key.starts_with('#') {
            return Err(SecretsError::InvalidKey(key.to_string()));
        }
        let value = value.trim();
        if value.contains('\n') {
            return Err(SecretsError::InvalidKey(key.to_string()));
        }

        let existing = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut replaced = false;
        let mut lines: Vec<String> = Vec::new();
        for line in existing.lines() {
            match parse_line(line) {
                Some((k, _)) if k == key => {
                    // Later duplicates would shadow nothing; drop them.
                    if !replaced {
                        lines.push(format!("{}={}", key, value));
                        replaced = true;
                    }
                }
                _ => lines.push(line.to_string()),
            }
        }
        if !replaced {
            lines.push(format!("{}={}", key, value));
        }

        let mut content = lines.join("\n");
        content.push('\n');
        self.write_atomic(content.as_bytes())?;

        debug!(key, path = %self.path.display(), "Credential stored");
        Ok(())
    }

    /// Create an empty store with owner-only permissions if none exists.
    pub fn init_store(&self) -> SecretsResult<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.write_atomic(b"# sql-agent credentials (KEY=value)\n")
    }

    /// [`get_key`](Self::get_key) on the blocking pool.
    pub async fn get_key_async(&self, key: &str) -> SecretsResult<Credential> {
        let resolver = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolver.get_key(&key))
            .await
            .map_err(|e| self.io_error(std::io::Error::other(e)))?
    }

    /// [`set_key`](Self::set_key) on the blocking pool.
    pub async fn set_key_async(&self, key: &str, value: &str) -> SecretsResult<()> {
        let resolver = self.clone();
        let (key, value) = (key.to_string(), value.to_string());
        tokio::task::spawn_blocking(move || resolver.set_key(&key, &value))
            .await
            .map_err(|e| self.io_error(std::io::Error::other(e)))?
    }

    fn read_store_value(&self, key: &str) -> SecretsResult<Option<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Secrets store unreadable");
                return Err(self.io_error(e));
            }
        };
        self.check_permissions();

        Ok(content
            .lines()
            .filter_map(parse_line)
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
            .filter(|v| !v.is_empty()))
    }

    #[cfg(unix)]
    fn check_permissions(&self) {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(&self.path) {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                warn!(
                    path = %self.path.display(),
                    mode = %format!("{:o}", mode & 0o777),
                    "Secrets store is readable by other users; expected 0600"
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn check_permissions(&self) {}

    fn write_atomic(&self, content: &[u8]) -> SecretsResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let temp_path = temp_path_for(&self.path);
        // A leftover temp file would keep its old permissions.
        let _ = fs::remove_file(&temp_path);

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&temp_path).map_err(|e| self.io_error(e))?;
        file.write_all(content).map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> SecretsError {
        SecretsError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// `remote-b` → `REMOTE_B`.
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
