//! Capability registry - the closed set of host functions scripts may call

use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use super::traits::{Capability, CapabilityEnvelope, CapabilityId, REGISTRY_VERSION};
use super::{AddNumbersCapability, HttpCallCapability};
use crate::config::CapabilitiesConfig;
use crate::error::{Error, Result};

/// Builder for a [`CapabilityRegistry`]
#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    capabilities: BTreeMap<CapabilityId, Arc<dyn Capability>>,
}

impl CapabilityRegistryBuilder {
    /// Register a capability, replacing any earlier handler with the same id
    pub fn register<C: Capability + 'static>(mut self, capability: C) -> Self {
        self.capabilities.insert(capability.id(), Arc::new(capability));
        self
    }

    /// Close the registry
    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            capabilities: self.capabilities,
        }
    }
}

/// Registry of host capabilities
///
/// Immutable once built. Requests can narrow it with an allow-list but never
/// add to it.
pub struct CapabilityRegistry {
    capabilities: BTreeMap<CapabilityId, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Start building a registry
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::default()
    }

    /// Build the registry described by the `capabilities` config section
    pub fn from_config(config: &CapabilitiesConfig) -> Result<Self> {
        let enabled: BTreeSet<CapabilityId> = match &config.enabled {
            Some(names) => names
                .iter()
                .map(|name| name.parse())
                .collect::<Result<_>>()
                .map_err(|e| Error::Config(e.to_string()))?,
            None => CapabilityId::ALL.into_iter().collect(),
        };

        let mut builder = Self::builder();
        if enabled.contains(&CapabilityId::AddNumbers) {
            builder = builder.register(AddNumbersCapability);
        }
        if enabled.contains(&CapabilityId::HttpCall) {
            builder = builder.register(HttpCallCapability::new(config.http.clone())?);
        }

        let registry = builder.build();
        tracing::info!(
            version = REGISTRY_VERSION,
            capabilities = ?registry.ids(),
            "Capability registry built"
        );
        Ok(registry)
    }

    /// Check whether a capability is registered
    pub fn contains(&self, id: CapabilityId) -> bool {
        self.capabilities.contains_key(&id)
    }

    /// Registered capability ids, in stable order
    pub fn ids(&self) -> BTreeSet<CapabilityId> {
        self.capabilities.keys().copied().collect()
    }

    /// Get a capability's description
    pub fn description(&self, id: CapabilityId) -> Option<&str> {
        self.capabilities.get(&id).map(|c| c.description())
    }

    /// Get capability count
    pub fn count(&self) -> usize {
        self.capabilities.len()
    }

    /// Invoke a capability
    ///
    /// Never fails: unknown ids, handler errors, panics and timeouts all come
    /// back as failure envelopes.
    pub async fn invoke(&self, id: CapabilityId, args: Vec<Value>, call_timeout: Duration) -> CapabilityEnvelope {
        let Some(capability) = self.capabilities.get(&id).cloned() else {
            return CapabilityEnvelope::failure(format!("Capability '{}' is not registered", id));
        };

        let call = AssertUnwindSafe(capability.invoke(args)).catch_unwind();
        let envelope = match tokio::time::timeout(call_timeout, call).await {
            Ok(Ok(Ok(data))) => CapabilityEnvelope::success(data),
            Ok(Ok(Err(e))) => CapabilityEnvelope::failure(capability_message(e)),
            Ok(Err(_panic)) => CapabilityEnvelope::failure(format!("Capability '{}' failed unexpectedly", id)),
            Err(_) => CapabilityEnvelope::failure(format!(
                "Capability '{}' timed out after {}ms",
                id,
                call_timeout.as_millis()
            )),
        };

        if let Some(error) = &envelope.error {
            tracing::warn!(capability = %id, error = %error, "Capability call failed");
        }
        envelope
    }
}

/// Strip the crate error prefix for errors the capability raised itself
fn capability_message(error: Error) -> String {
    match error {
        Error::InvalidInput(msg) | Error::Capability(msg) => msg,
        other => other.to_string(),
    }
}
