//! Sandbox configuration types
//!
//! Worker pool sizing, request timeout bounds and per-isolate limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Number of workers (maximum concurrent isolates)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Requests that may wait for a worker before submissions are rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Workers that create and discard an isolate at spawn
    #[serde(default)]
    pub prewarm_workers: Option<usize>,
    /// Timeout applied when a request does not carry one
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub default_timeout: Duration,
    /// Smallest accepted request timeout
    #[serde(with = "humantime_serde", default = "default_min_timeout")]
    pub min_timeout: Duration,
    /// Largest accepted request timeout
    #[serde(with = "humantime_serde", default = "default_max_timeout")]
    pub max_timeout: Duration,
    /// How long past its timeout a worker may take to report before it is replaced
    #[serde(with = "humantime_serde", default = "default_termination_grace")]
    pub termination_grace: Duration,
    /// How long shutdown waits for busy workers before forcing them
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    /// Maximum script body size in bytes
    #[serde(default = "default_max_script_bytes")]
    pub max_script_bytes: usize,
    /// Log buffer budget in bytes
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,
    /// V8 heap limit per isolate in bytes
    #[serde(default = "default_max_heap_bytes")]
    pub max_heap_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
            prewarm_workers: None,
            default_timeout: default_timeout(),
            min_timeout: default_min_timeout(),
            max_timeout: default_max_timeout(),
            termination_grace: default_termination_grace(),
            shutdown_grace: default_shutdown_grace(),
            max_script_bytes: default_max_script_bytes(),
            max_log_bytes: default_max_log_bytes(),
            max_heap_bytes: default_max_heap_bytes(),
        }
    }
}

impl SandboxConfig {
    /// Number of workers to pre-warm (defaults to the whole pool)
    pub fn prewarm_count(&self) -> usize {
        self.prewarm_workers
            .unwrap_or(self.pool_size)
            .min(self.pool_size)
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    16
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_min_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_max_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_termination_grace() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_max_script_bytes() -> usize {
    64 * 1024
}

fn default_max_log_bytes() -> usize {
    16 * 1024
}

fn default_max_heap_bytes() -> usize {
    64 * 1024 * 1024
}
