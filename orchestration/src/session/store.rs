//! Durable session snapshots
//!
//! A snapshot is written to `<path>.tmp` in the same directory, fsynced,
//! then renamed over `<path>`, so a crash mid-write leaves the previous
//! snapshot intact. Loading never fails the caller: a missing file means
//! "no snapshot", a malformed one is logged and ignored.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::types::{RecoveryReport, SessionState, SNAPSHOT_VERSION};
use crate::error::ErrorKind;
use crate::manager::ModelManager;

/// Snapshot location relative to the working directory.
pub const DEFAULT_SESSION_PATH: &str = "app/data/session_state.json";

#[derive(Debug, Error)]
pub enum PersistenceFailure {
    #[error("failed to serialize session state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("snapshot version {found} is newer than supported version {}", SNAPSHOT_VERSION)]
    UnsupportedVersion { found: u32 },
}

impl PersistenceFailure {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PersistenceFailure
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceFailure>;

#[derive(Debug, Clone)]
pub struct SessionStateStore {
    path: PathBuf,
}

pub type SharedSessionStore = Arc<SessionStateStore>;

impl Default for SessionStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_PATH)
    }
}

impl SessionStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn shared(self) -> SharedSessionStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the snapshot with `state`.
    pub fn snapshot(&self, state: &SessionState) -> PersistenceResult<()> {
        let json = serde_json::to_string_pretty(state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.write_error(e))?;
        }

        let temp_path = self.temp_path();
        let mut file = fs::File::create(&temp_path).map_err(|e| self.write_error(e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| self.write_error(e))?;
        file.sync_all().map_err(|e| self.write_error(e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| self.write_error(e))?;
        debug!(path = %self.path.display(), "Session snapshot written");
        Ok(())
    }

    /// Load the snapshot, distinguishing "absent" from "broken".
    pub fn try_load(&self) -> PersistenceResult<Option<SessionState>> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceFailure::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let state: SessionState =
            serde_json::from_str(&json).map_err(|e| PersistenceFailure::Malformed {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if state.version > SNAPSHOT_VERSION {
            return Err(PersistenceFailure::UnsupportedVersion {
                found: state.version,
            });
        }
        Ok(Some(state))
    }

    /// Load the snapshot; any problem is logged and treated as absent.
    pub fn load(&self) -> Option<SessionState> {
        match self.try_load() {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unusable session snapshot");
                None
            }
        }
    }

    /// Delete the snapshot if present.
    pub fn clear(&self) -> PersistenceResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.write_error(e)),
        }
    }

    /// Load the snapshot and re-apply it to `manager`.
    pub async fn recover(&self, manager: &ModelManager) -> RecoveryReport {
        let snapshot = self.load();
        manager.apply_recovered(snapshot).await
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_error(&self, source: std::io::Error) -> PersistenceFailure {
        PersistenceFailure::Write {
            path: self.path.clone(),
            source,
        }
    }
}
