//! # Sandbox Engine
//!
//! Isolated, time-bounded execution of untrusted scripts against a closed
//! host capability API.
//!
//! ## Features
//!
//! - **Fresh isolate per run:** No state leaks between executions
//! - **Closed capability surface:** Scripts reach the host only through registered capabilities
//! - **Bounded worker pool:** Fixed concurrency with a bounded wait queue and explicit backpressure
//! - **Hard timeouts:** Runaway scripts are terminated, including tight synchronous loops
//! - **Graceful shutdown:** In-flight work drains within a grace period, stragglers are force-terminated

pub mod api;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod pool;
pub mod queue;
pub mod sandbox;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};
pub use service::{initialize_sandbox_service, shutdown_sandbox_service, SandboxService};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
