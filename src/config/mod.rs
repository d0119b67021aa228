//! Configuration module
//!
//! Configuration is split into focused modules:
//! - types/mod.rs: Root `Config` and server settings
//! - types/sandbox.rs: Worker pool and isolate limits
//! - types/capability.rs: Host capability settings
//! - io.rs: Configuration loading and saving
//! - validation.rs: Configuration validation
//! - paths.rs: Configuration file paths

mod io;
mod paths;
mod types;
mod validation;

pub use types::{Config, ServerConfig};
pub use types::capability::{CapabilitiesConfig, HttpCallConfig};
pub use types::sandbox::SandboxConfig;

pub use io::{apply_env_overrides, load_config, load_config_from_path, save_config};
pub use paths::{config_dir, config_path};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
