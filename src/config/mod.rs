//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The broker URL carries credentials, so it is wrapped in
//! `secrecy::SecretString` to keep it out of logs.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

pub use secrecy::ExposeSecret;

use crate::error::{Error, Result};

const DEFAULT_TASK_QUEUE: &str = "tasks";
const DEFAULT_EVENT_QUEUE: &str = "task_events";
const DEFAULT_EVENT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug)]
pub struct Config {
    pub broker_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub task_queue: String,
    pub event_queue: String,
    /// How long the monitor waits for an event before reporting a quiet period.
    pub event_timeout: Duration,
    /// Optional TOML file with per-task retry policies.
    pub policy_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let event_timeout = match optional_var("EVENT_TIMEOUT_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                Error::Config(format!("EVENT_TIMEOUT_SECS must be whole seconds, got {raw:?}"))
            })?,
            None => DEFAULT_EVENT_TIMEOUT_SECS,
        };

        Ok(Self {
            broker_url: SecretString::from(required_var("BROKER_URL")?),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            task_queue: optional_var("TASK_QUEUE")
                .unwrap_or_else(|| DEFAULT_TASK_QUEUE.to_string()),
            event_queue: optional_var("EVENT_QUEUE")
                .unwrap_or_else(|| DEFAULT_EVENT_QUEUE.to_string()),
            event_timeout: Duration::from_secs(event_timeout),
            policy_file: optional_var("TASK_POLICIES").map(PathBuf::from),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty are treated the same.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
