//! Configuration validation
//!
//! Validates configuration and reports issues.

use super::types::Config;
use crate::capabilities::CapabilityId;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }

    /// Render all errors as a single message
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| format!("{}: {}", issue.path, issue.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_pool_config(config, result);
    result = validate_timeout_config(config, result);
    result = validate_capability_config(config, result);

    result
}

fn validate_pool_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let sandbox = &config.sandbox;

    if sandbox.pool_size == 0 {
        result = result.with_error(
            ValidationIssue::new("sandbox.pool_size", "Pool size must be at least 1")
                .with_suggestion("Set sandbox.pool_size to the number of concurrent scripts to allow"),
        );
    }

    if sandbox.queue_capacity == 0 {
        result = result.with_warning(
            ValidationIssue::new(
                "sandbox.queue_capacity",
                "Queue capacity is 0: submissions are rejected whenever every worker is busy",
            ),
        );
    }

    if sandbox.max_log_bytes == 0 {
        result = result.with_error(
            ValidationIssue::new("sandbox.max_log_bytes", "Log budget must be greater than 0"),
        );
    }

    if sandbox.max_script_bytes == 0 {
        result = result.with_error(
            ValidationIssue::new("sandbox.max_script_bytes", "Script size limit must be greater than 0"),
        );
    }

    result
}

fn validate_timeout_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let sandbox = &config.sandbox;

    if sandbox.min_timeout > sandbox.max_timeout {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.min_timeout",
                format!(
                    "min_timeout ({:?}) is greater than max_timeout ({:?})",
                    sandbox.min_timeout, sandbox.max_timeout
                ),
            ),
        );
    }

    if sandbox.default_timeout < sandbox.min_timeout || sandbox.default_timeout > sandbox.max_timeout {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.default_timeout",
                format!(
                    "default_timeout ({:?}) is outside [{:?}, {:?}]",
                    sandbox.default_timeout, sandbox.min_timeout, sandbox.max_timeout
                ),
            )
            .with_suggestion("Pick a default between min_timeout and max_timeout"),
        );
    }

    let call_timeout = config.capabilities.call_timeout;
    if call_timeout >= sandbox.default_timeout {
        result = result.with_error(
            ValidationIssue::new(
                "capabilities.call_timeout",
                format!(
                    "call_timeout ({:?}) must be shorter than default_timeout ({:?})",
                    call_timeout, sandbox.default_timeout
                ),
            )
            .with_suggestion("Lower capabilities.call_timeout or raise sandbox.default_timeout"),
        );
    } else if call_timeout >= sandbox.min_timeout {
        result = result.with_warning(ValidationIssue::new(
            "capabilities.call_timeout",
            format!(
                "call_timeout ({:?}) exceeds min_timeout ({:?}); short requests end before their capability calls do",
                call_timeout, sandbox.min_timeout
            ),
        ));
    }

    result
}

fn validate_capability_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let Some(enabled) = &config.capabilities.enabled else {
        return result;
    };

    for name in enabled {
        if name.parse::<CapabilityId>().is_err() {
            result = result.with_error(
                ValidationIssue::new(
                    "capabilities.enabled",
                    format!("Unknown capability: {}", name),
                )
                .with_suggestion(format!(
                    "Known capabilities: {}",
                    CapabilityId::ALL
                        .iter()
                        .map(|id| id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )),
            );
        }
    }

    if enabled.is_empty() {
        result = result.with_warning(ValidationIssue::new(
            "capabilities.enabled",
            "No capabilities enabled: scripts can only compute and log",
        ));
    }

    result
}
