//! Per-task-type execution policy: retry classification, backoff, ack mode.
//!
//! Loaded from TOML:
//!
//! ```toml
//! [defaults]
//! max_retries = 3
//!
//! [tasks.visit]
//! retry_on = ["http"]
//! backoff_base_ms = 1000
//! backoff_max_ms = 600000
//! acks_late = true
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::handler::TaskError;
use crate::error::{Error, Result};

/// Execution knobs for one task type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Error kinds that schedule a retry. Anything else fails the task.
    pub retry_on: Vec<String>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Acknowledge only once the outcome is known. Turning this off acks on
    /// receipt, which loses crash redelivery and explicit rejection.
    pub acks_late: bool,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_on: Vec::new(),
            backoff_base_ms: 1_000,
            backoff_max_ms: 600_000,
            acks_late: true,
        }
    }
}

impl TaskPolicy {
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retry_on.push(kind.into());
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self.backoff_max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn acks_late(mut self, late: bool) -> Self {
        self.acks_late = late;
        self
    }

    pub fn is_retryable(&self, err: &TaskError) -> bool {
        match err {
            TaskError::Failed { kind, .. } => self.retry_on.iter().any(|k| k == kind),
            TaskError::Reject { .. } => false,
        }
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Top-level TOML layout.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    #[serde(default)]
    defaults: Option<TaskPolicy>,
    #[serde(default)]
    tasks: HashMap<String, TaskPolicy>,
}

/// Policies indexed by task name, with a fallback for unlisted types.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    default: TaskPolicy,
    policies: HashMap<String, TaskPolicy>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: PolicyFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad task policy config: {e}")))?;
        Ok(Self {
            default: file.defaults.unwrap_or_default(),
            policies: file.tasks,
        })
    }

    /// Load a policy file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read task policies {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn with_default(mut self, policy: TaskPolicy) -> Self {
        self.default = policy;
        self
    }

    pub fn with_policy(mut self, name: impl Into<String>, policy: TaskPolicy) -> Self {
        self.policies.insert(name.into(), policy);
        self
    }

    pub fn policy_for(&self, name: &str) -> &TaskPolicy {
        self.policies.get(name).unwrap_or(&self.default)
    }

    /// Retry budget of task types without a `[tasks.*]` entry.
    pub fn default_max_retries(&self) -> u32 {
        self.default.max_retries
    }

    /// Retry budgets of the explicitly configured task types.
    pub fn retry_limits(&self) -> HashMap<String, u32> {
        self.policies
            .iter()
            .map(|(name, p)| (name.clone(), p.max_retries))
            .collect()
    }
}
