use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskforge_core::{TaskforgeError, TaskforgeResult};

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_bottleneck_threshold_ms() -> u64 {
    30_000
}

/// Engine tuning knobs.
///
/// Deserializable from TOML; every field has a default so a partial config
/// file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Process-wide bound on tasks in the running state.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Fallback dispatch tick; the dispatcher normally wakes on submission
    /// and completion events.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Fixed delay before a retried task re-enters the queue.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Deadline applied to tasks created without an explicit timeout.
    #[serde(default = "default_task_timeout_ms")]
    pub default_task_timeout_ms: u64,
    /// Average execution time above which an agent is flagged as a
    /// bottleneck.
    #[serde(default = "default_bottleneck_threshold_ms")]
    pub bottleneck_threshold_ms: u64,
    /// When true, workflow execution saves a best-effort checkpoint after
    /// every completed batch.
    #[serde(default)]
    pub autosave_checkpoints: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            default_task_timeout_ms: default_task_timeout_ms(),
            bottleneck_threshold_ms: default_bottleneck_threshold_ms(),
            autosave_checkpoints: false,
        }
    }
}

impl EngineConfig {
    /// Parse a config from a TOML document.
    pub fn from_toml_str(raw: &str) -> TaskforgeResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| TaskforgeError::Config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> TaskforgeResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(TaskforgeError::Config(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Fallback dispatch tick as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Default task deadline as a [`Duration`].
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }
}
