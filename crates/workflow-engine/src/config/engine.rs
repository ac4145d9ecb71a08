//! Engine tuning knobs: completion deferral, named locks and messaging subjects.

use serde::Deserialize;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `NOETL_ENGINE_`:
/// - `NOETL_ENGINE_COMPLETION_DELAY_MS`: Deferral before async handlers run (default: 100)
/// - `NOETL_ENGINE_LOCK_TTL_SECS`: Named lock lease (default: 60)
/// - `NOETL_ENGINE_LOCK_RETRY_ATTEMPTS`: Acquire attempts before giving up (default: 50)
/// - `NOETL_ENGINE_LOCK_RETRY_INTERVAL_MS`: Pause between attempts (default: 50)
/// - `NOETL_ENGINE_DEFAULT_ACTION_TIMEOUT_SECS`: Action timeout when a task sets none (default: 3600)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Delay applied before every spawned completion handler
    #[serde(default = "default_completion_delay_ms")]
    pub completion_delay_ms: u64,

    /// Named lock lease in seconds; an expired lock may be taken over
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Number of acquire attempts for a held named lock
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,

    /// Pause between acquire attempts in milliseconds
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,

    /// Action timeout applied when the task spec has none
    #[serde(default = "default_action_timeout_secs")]
    pub default_action_timeout_secs: u64,

    /// JetStream subject for action requests
    #[serde(default = "default_actions_subject")]
    pub actions_subject: String,

    /// JetStream stream holding action requests
    #[serde(default = "default_actions_stream")]
    pub actions_stream: String,

    /// Subject for workflow/task state events
    #[serde(default = "default_events_subject")]
    pub events_subject: String,
}

fn default_completion_delay_ms() -> u64 {
    100
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_lock_retry_attempts() -> u32 {
    50
}

fn default_lock_retry_interval_ms() -> u64 {
    50
}

fn default_action_timeout_secs() -> u64 {
    3600
}

fn default_actions_subject() -> String {
    "noetl.actions".to_string()
}

fn default_actions_stream() -> String {
    "noetl_actions".to_string()
}

fn default_events_subject() -> String {
    "noetl.events".to_string()
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `NOETL_ENGINE_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("NOETL_ENGINE_").from_env::<EngineConfig>()
    }

    pub fn completion_delay(&self) -> Duration {
        Duration::from_millis(self.completion_delay_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    /// Timeout for a single action run.
    pub fn action_timeout(&self, task_timeout_secs: Option<u64>) -> Duration {
        Duration::from_secs(task_timeout_secs.unwrap_or(self.default_action_timeout_secs))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            completion_delay_ms: default_completion_delay_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            default_action_timeout_secs: default_action_timeout_secs(),
            actions_subject: default_actions_subject(),
            actions_stream: default_actions_stream(),
            events_subject: default_events_subject(),
        }
    }
}
