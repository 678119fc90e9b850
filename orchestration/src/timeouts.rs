//! Per-operation timeout policy
//!
//! Every backend interaction is bounded by the timeout of its
//! [`OperationCategory`]. The profile is a fixed table indexed by the enum, so
//! a category without a value cannot exist.
//!
//! Resolution order, highest first:
//! 1. `OLLAMA_TIMEOUT_<CATEGORY>` environment variables (whole seconds)
//! 2. the `[timeouts]` table of the config file
//! 3. compiled defaults
//!
//! A malformed override keeps the value of the layer below it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Prefix of the environment variables that override a category.
pub const ENV_PREFIX: &str = "OLLAMA_TIMEOUT_";

const CATEGORY_COUNT: usize = 7;

/// Closed set of timed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationCategory {
    ModelDownload,
    ModelFileOperations,
    ConnectionCheck,
    ApiCalls,
    InferenceFirstToken,
    InferenceCompletion,
    SystemCommands,
}

impl OperationCategory {
    pub const ALL: [OperationCategory; CATEGORY_COUNT] = [
        Self::ModelDownload,
        Self::ModelFileOperations,
        Self::ConnectionCheck,
        Self::ApiCalls,
        Self::InferenceFirstToken,
        Self::InferenceCompletion,
        Self::SystemCommands,
    ];

    /// Canonical snake_case name, as used in config files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModelDownload => "model_download",
            Self::ModelFileOperations => "model_file_operations",
            Self::ConnectionCheck => "connection_check",
            Self::ApiCalls => "api_calls",
            Self::InferenceFirstToken => "inference_first_token",
            Self::InferenceCompletion => "inference_completion",
            Self::SystemCommands => "system_commands",
        }
    }

    pub fn default_timeout(&self) -> Duration {
        let secs = match self {
            Self::ModelDownload => 1200,
            Self::ModelFileOperations => 600,
            Self::ConnectionCheck => 10,
            Self::ApiCalls => 30,
            Self::InferenceFirstToken => 60,
            Self::InferenceCompletion => 300,
            Self::SystemCommands => 10,
        };
        Duration::from_secs(secs)
    }

    /// Environment variable that overrides this category.
    pub fn env_var(&self) -> String {
        format!("{}{}", ENV_PREFIX, self.name().to_uppercase())
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A category name that is not part of the closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown timeout category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for OperationCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name() == normalized)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Complete mapping from category to timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutPolicy {
    profile: [Duration; CATEGORY_COUNT],
    overridden: [bool; CATEGORY_COUNT],
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::defaults()
    }
}

impl TimeoutPolicy {
    /// Compiled defaults only.
    pub fn defaults() -> Self {
        let mut profile = [Duration::ZERO; CATEGORY_COUNT];
        for category in OperationCategory::ALL {
            profile[category.index()] = category.default_timeout();
        }
        Self {
            profile,
            overridden: [false; CATEGORY_COUNT],
        }
    }

    /// Compiled defaults with process environment overrides applied.
    pub fn from_env() -> Self {
        Self::defaults().with_env(|var| std::env::var(var).ok())
    }

    /// Compiled defaults with the given `(name, seconds)` overrides applied.
    pub fn from_overrides<I, K, V>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::defaults().with_overrides(overrides)
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// `lookup` receives the variable name (`OLLAMA_TIMEOUT_API_CALLS`, ...).
    pub fn with_env<F>(self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let pairs: Vec<(&'static str, String)> = OperationCategory::ALL
            .iter()
            .filter_map(|c| lookup(&c.env_var()).map(|v| (c.name(), v)))
            .collect();
        self.with_overrides(pairs)
    }

    /// Apply `(name, seconds)` overrides on top of the current profile.
    ///
    /// Unknown names and malformed values are logged and skipped.
    pub fn with_overrides<I, K, V>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, raw) in overrides {
            let name = name.as_ref();
            let raw = raw.as_ref();

            let category = match name.parse::<OperationCategory>() {
                Ok(c) => c,
                Err(e) => {
                    warn!(override_name = name, "Ignoring timeout override: {}", e);
                    continue;
                }
            };

            match parse_seconds(raw) {
                Some(duration) => {
                    debug!(category = %category, secs = duration.as_secs(), "Timeout override applied");
                    self.profile[category.index()] = duration;
                    self.overridden[category.index()] = true;
                }
                None => {
                    warn!(
                        category = %category,
                        value = raw,
                        kept_secs = self.profile[category.index()].as_secs(),
                        "Malformed timeout override (expected positive whole seconds)"
                    );
                }
            }
        }
        self
    }

    /// Effective timeout for a category.
    pub fn get(&self, category: OperationCategory) -> Duration {
        self.profile[category.index()]
    }

    /// Effective timeout for a category given by name.
    ///
    /// # Panics
    /// On a name outside the closed category set.
    pub fn get_named(&self, name: &str) -> Duration {
        match name.parse::<OperationCategory>() {
            Ok(category) => self.get(category),
            Err(e) => panic!("{}", e),
        }
    }

    /// Whether the category's value came from an override layer.
    pub fn is_overridden(&self, category: OperationCategory) -> bool {
        self.overridden[category.index()]
    }

    /// Every category with its effective timeout, in declaration order.
    pub fn profile(&self) -> impl Iterator<Item = (OperationCategory, Duration)> + '_ {
        OperationCategory::ALL
            .iter()
            .map(move |c| (*c, self.profile[c.index()]))
    }
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    let secs: i64 = raw.trim().parse().ok()?;
    if secs <= 0 {
        return None;
    }
    Some(Duration::from_secs(secs as u64))
}
