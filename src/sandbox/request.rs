//! Execution request

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::capabilities::CapabilityId;

/// Request to execute a script
///
/// Fields are private: a request is built with the `with_*` methods and is
/// not modified after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    id: Uuid,
    script_body: String,
    submitted_at: DateTime<Utc>,
    /// Timeout in milliseconds (pool default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    /// Capability allow-list (all registered capabilities when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_capabilities: Option<BTreeSet<CapabilityId>>,
    /// JSON value exposed to the script as `context`
    #[serde(default)]
    context: Value,
}

impl ExecutionRequest {
    /// Create a new execution request for an async function body
    pub fn new(script_body: impl Into<String>) -> Self {
        ExecutionRequest {
            id: Uuid::new_v4(),
            script_body: script_body.into(),
            submitted_at: Utc::now(),
            timeout_ms: None,
            allowed_capabilities: None,
            context: Value::Null,
        }
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    /// Set timeout in milliseconds
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Restrict the capabilities injected into the isolate
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = CapabilityId>) -> Self {
        self.allowed_capabilities = Some(capabilities.into_iter().collect());
        self
    }

    /// Set the `context` global
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Request id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Script body
    pub fn script_body(&self) -> &str {
        &self.script_body
    }

    /// Submission time
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Requested timeout, if any
    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    /// Capability allow-list, if any
    pub fn allowed_capabilities(&self) -> Option<&BTreeSet<CapabilityId>> {
        self.allowed_capabilities.as_ref()
    }

    /// Context value
    pub fn context(&self) -> &Value {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execution_request() {
        let req = ExecutionRequest::new("return 1;")
            .with_timeout(Duration::from_millis(250))
            .with_capabilities([CapabilityId::AddNumbers])
            .with_context(json!({"user": 7}));

        assert_eq!(req.script_body(), "return 1;");
        assert_eq!(req.timeout_ms(), Some(250));
        assert!(req.allowed_capabilities().unwrap().contains(&CapabilityId::AddNumbers));
        assert_eq!(req.context()["user"], 7);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = ExecutionRequest::new("");
        let b = ExecutionRequest::new("");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let req = ExecutionRequest::new("return 2;").with_capabilities([CapabilityId::HttpCall]);
        let value = serde_json::to_value(&req).unwrap();

        assert_eq!(value["scriptBody"], "return 2;");
        assert_eq!(value["allowedCapabilities"], json!(["httpCall"]));
        assert!(value.get("timeoutMs").is_none());

        let back: ExecutionRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back.id(), req.id());
    }
}
