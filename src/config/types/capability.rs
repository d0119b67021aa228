//! Host capability configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Host capability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    /// Capabilities to register (all built-ins when unset)
    #[serde(default)]
    pub enabled: Option<Vec<String>>,
    /// Timeout for a single capability call
    #[serde(with = "humantime_serde", default = "default_call_timeout")]
    pub call_timeout: Duration,
    /// Maximum capability calls a single run may make
    #[serde(default = "default_max_calls")]
    pub max_calls_per_run: usize,
    /// Maximum serialized argument size for one call, in bytes
    #[serde(default = "default_max_args_bytes")]
    pub max_args_bytes: usize,
    /// httpCall configuration
    #[serde(default)]
    pub http: HttpCallConfig,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        CapabilitiesConfig {
            enabled: None,
            call_timeout: default_call_timeout(),
            max_calls_per_run: default_max_calls(),
            max_args_bytes: default_max_args_bytes(),
            http: HttpCallConfig::default(),
        }
    }
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_calls() -> usize {
    64
}

fn default_max_args_bytes() -> usize {
    64 * 1024
}

/// Configuration for the outbound HTTP capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCallConfig {
    /// Largest response body handed back to a script
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpCallConfig {
    fn default() -> Self {
        HttpCallConfig {
            max_response_bytes: default_max_response_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_max_response_bytes() -> usize {
    1024 * 1024
}

fn default_user_agent() -> String {
    format!("sandbox-engine/{}", env!("CARGO_PKG_VERSION"))
}
