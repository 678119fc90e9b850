//! Session state persistence
//!
//! - [`types`]: the persisted [`SessionState`] document and recovery report
//! - [`store`]: atomic snapshot writes, tolerant loads, recovery
//! - [`autosave`]: background task that snapshots published state

pub mod autosave;
pub mod store;
pub mod types;

pub use autosave::{spawn_autosave, AutosaveConfig, AutosaveHandle, AutosaveStats};
pub use store::{PersistenceFailure, SessionStateStore, SharedSessionStore, DEFAULT_SESSION_PATH};
pub use types::{RecoveryReport, RecoverySource, SessionField, SessionState, SNAPSHOT_VERSION};
