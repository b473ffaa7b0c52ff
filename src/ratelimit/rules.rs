//! Rate limit rules configuration and lookup.
//!
//! Rules assign a [`LimitPolicy`] to each protected operation (for example
//! `click` or `chat`). Operations without an explicit entry use the default
//! policy. Operation names are case-insensitive and stored lowercase.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{GuardError, Result};

/// Whether rejected attempts still consume a slot in the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingPolicy {
    /// Only admitted attempts are counted; a reject leaves the record untouched
    #[default]
    AdmittedOnly,
    /// Every attempt is counted, including rejected ones
    EveryAttempt,
}

/// What the limiter decides when its window store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    FailOpen,
    /// Reject the request
    FailClosed,
}

/// A fixed-window limit for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitPolicy {
    /// Length of each fixed window in milliseconds
    #[serde(default = "default_window_length_ms")]
    pub window_length_ms: u64,
    /// Maximum admitted attempts per window per identity
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u64,
    /// Whether rejected attempts are counted
    #[serde(default)]
    pub counting: CountingPolicy,
    /// Decision to take when the store is unavailable
    #[serde(default)]
    pub on_store_error: FailurePolicy,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            window_length_ms: default_window_length_ms(),
            max_per_window: default_max_per_window(),
            counting: CountingPolicy::default(),
            on_store_error: FailurePolicy::default(),
        }
    }
}

/// Longest accepted window: one year.
pub const MAX_WINDOW_LENGTH_MS: u64 = 365 * 24 * 60 * 60 * 1_000;

fn default_window_length_ms() -> u64 {
    60_000
}

fn default_max_per_window() -> u64 {
    20
}

impl LimitPolicy {
    /// Create a policy with the given window and cap and default behaviors.
    pub fn new(window_length_ms: u64, max_per_window: u64) -> Self {
        Self {
            window_length_ms,
            max_per_window,
            ..Self::default()
        }
    }

    /// The window length as a chrono duration.
    pub fn window_length(&self) -> chrono::Duration {
        // Saturate instead of wrapping for absurdly long windows
        chrono::Duration::milliseconds(i64::try_from(self.window_length_ms).unwrap_or(i64::MAX / 1_000))
    }

    /// Check that the policy can admit anything at all.
    pub fn validate(&self) -> Result<()> {
        if self.window_length_ms == 0 {
            return Err(GuardError::Config("window_length_ms must be greater than zero".to_string()));
        }
        if self.window_length_ms > MAX_WINDOW_LENGTH_MS {
            return Err(GuardError::Config(format!(
                "window_length_ms must be at most {}",
                MAX_WINDOW_LENGTH_MS
            )));
        }
        if self.max_per_window == 0 {
            return Err(GuardError::Config("max_per_window must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Per-operation rate limit rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Policy for operations without an explicit entry
    #[serde(default)]
    pub default: LimitPolicy,
    /// Map of operation name to its policy
    #[serde(default)]
    pub operations: HashMap<String, LimitPolicy>,
}

impl RateLimitRules {
    /// Create rules holding only the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        let rules = rules.normalized()?;
        rules.validate()?;
        Ok(rules)
    }

    /// Lowercase every operation name.
    ///
    /// Layered configuration lowercases map keys, so rules from every source
    /// are brought to the same form. Two names differing only in case are
    /// rejected.
    pub fn normalized(self) -> Result<Self> {
        let mut operations = HashMap::with_capacity(self.operations.len());
        for (operation, policy) in self.operations {
            let name = operation.to_ascii_lowercase();
            if operations.insert(name.clone(), policy).is_some() {
                return Err(GuardError::Config(format!(
                    "operation '{}' is configured more than once",
                    name
                )));
            }
        }
        Ok(Self {
            default: self.default,
            operations,
        })
    }

    /// The policy that applies to an operation.
    pub fn policy_for(&self, operation: &str) -> &LimitPolicy {
        self.operations
            .get(operation.to_ascii_lowercase().as_str())
            .unwrap_or(&self.default)
    }

    /// Validate the default policy and every operation policy.
    pub fn validate(&self) -> Result<()> {
        self.default.validate()?;
        for (operation, policy) in &self.operations {
            policy
                .validate()
                .map_err(|e| GuardError::Config(format!("operation '{}': {}", operation, e)))?;
        }
        Ok(())
    }
}
