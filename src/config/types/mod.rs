//! Configuration types module
//!
//! Re-exports all configuration types.

pub mod capability;
pub mod sandbox;

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool and isolate limits
    #[serde(default)]
    pub sandbox: sandbox::SandboxConfig,

    /// Host capability configuration
    #[serde(default)]
    pub capabilities: capability::CapabilitiesConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from the config file (if present) and environment
    ///
    /// Layering: defaults < config file < environment variables.
    pub fn from_env() -> crate::error::Result<Self> {
        crate::config::load_config()
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = json5::from_str(
            r#"{
                // only override what matters
                sandbox: { pool_size: 2 },
                server: { port: 9000 },
            }"#,
        )
        .unwrap();

        assert_eq!(config.sandbox.pool_size, 2);
        assert_eq!(config.sandbox.queue_capacity, 16);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "127.0.0.1");
    }
}
