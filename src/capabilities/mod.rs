//! Capabilities module - host functions exposed to sandboxed scripts
//!
//! Each capability is a self-contained module that implements the
//! `Capability` trait. Capabilities are registered into a closed
//! `CapabilityRegistry`; the isolate bridge only ever reaches a capability
//! through the registry.
//!
//! ## Built-in Capabilities
//!
//! - **addNumbers**: Add two numbers on the host
//! - **httpCall**: Outbound HTTP request (http/https only, size capped)
//!
//! ## Adding a New Capability
//!
//! 1. Add a variant to `CapabilityId` and bump `REGISTRY_VERSION`
//! 2. Create a new file in `src/capabilities/` implementing `Capability`
//! 3. Register it in `CapabilityRegistry::from_config`

mod add_numbers;
mod http_call;
mod registry;
mod traits;

// Core trait and types
pub use traits::{Capability, CapabilityEnvelope, CapabilityId, REGISTRY_VERSION};

// Registry
pub use registry::{CapabilityRegistry, CapabilityRegistryBuilder};

// Built-in capabilities
pub use add_numbers::AddNumbersCapability;
pub use http_call::HttpCallCapability;
