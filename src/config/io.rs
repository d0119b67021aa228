//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file (json5 or toml) if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().map_or(false, |ext| ext == "json" || ext == "json5") {
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().map_or(false, |ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try JSON5 first, then TOML
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` first, then overlays any set variables. Env vars have the
/// highest precedence: defaults < file < env.
pub fn apply_env_overrides(config: &mut Config) {
    dotenvy::dotenv().ok();
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

fn apply_overrides_from<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let parse = |key: &str| -> Option<u64> { parse_var(&lookup, key) };

    if let Some(v) = parse_var::<usize, _>(&lookup, "SANDBOX_POOL_SIZE") {
        config.sandbox.pool_size = v;
    }
    if let Some(v) = parse_var::<usize, _>(&lookup, "SANDBOX_QUEUE_CAPACITY") {
        config.sandbox.queue_capacity = v;
    }
    if let Some(ms) = parse("SANDBOX_DEFAULT_TIMEOUT_MS") {
        config.sandbox.default_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = parse("SANDBOX_SHUTDOWN_GRACE_MS") {
        config.sandbox.shutdown_grace = Duration::from_millis(ms);
    }
    if let Some(v) = parse_var::<usize, _>(&lookup, "SANDBOX_MAX_LOG_BYTES") {
        config.sandbox.max_log_bytes = v;
    }
    if let Some(ms) = parse("SANDBOX_CAPABILITY_TIMEOUT_MS") {
        config.capabilities.call_timeout = Duration::from_millis(ms);
    }
    if let Some(bind) = lookup("SANDBOX_BIND") {
        config.server.bind = bind;
    }
    if let Some(port) = parse_var::<u16, _>(&lookup, "SANDBOX_PORT") {
        config.server.port = port;
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

/// Save configuration to a file
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().map_or(false, |ext| ext == "toml") {
        toml::to_string_pretty(config).map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config).map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_config.json");

        let mut config = Config::default();
        config.sandbox.pool_size = 7;
        save_config(&config, &path).unwrap();

        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.sandbox.pool_size, 7);
        assert_eq!(loaded.sandbox.default_timeout, config.sandbox.default_timeout);
    }

    #[test]
    fn test_save_and_load_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.capabilities.call_timeout = Duration::from_millis(1500);
        save_config(&config, &path).unwrap();

        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.capabilities.call_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ sandbox: ").unwrap();

        let err = load_config_from_path(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SANDBOX_POOL_SIZE", "3"),
            ("SANDBOX_DEFAULT_TIMEOUT_MS", "250"),
            ("SANDBOX_CAPABILITY_TIMEOUT_MS", "80"),
            ("SANDBOX_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_overrides_from(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.sandbox.pool_size, 3);
        assert_eq!(config.sandbox.default_timeout, Duration::from_millis(250));
        assert_eq!(config.capabilities.call_timeout, Duration::from_millis(80));
        // unparsable values leave the default in place
        assert_eq!(config.server.port, 8787);
    }
}
