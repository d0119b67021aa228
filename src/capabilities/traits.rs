//! Core capability trait, identifiers and the result envelope

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Version of the built-in capability set
///
/// Bumped whenever a capability is added, removed or changes its argument
/// or data shape.
pub const REGISTRY_VERSION: u32 = 1;

/// Identifier of a host capability
///
/// The set is closed: scripts can only ever reach the functions listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CapabilityId {
    #[serde(rename = "addNumbers")]
    AddNumbers,
    #[serde(rename = "httpCall")]
    HttpCall,
}

impl CapabilityId {
    /// Every known capability, in registration order
    pub const ALL: [CapabilityId; 2] = [CapabilityId::AddNumbers, CapabilityId::HttpCall];

    /// Name of the global function exposed to scripts
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityId::AddNumbers => "addNumbers",
            CapabilityId::HttpCall => "httpCall",
        }
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CapabilityId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown capability: {}", s)))
    }
}

/// A host function that sandboxed scripts may call
///
/// Implementations receive the positional arguments the script passed.
/// Returning `Err` is fine: the registry turns it into a failure envelope
/// before it reaches the script.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Get the capability id
    fn id(&self) -> CapabilityId;

    /// Get a short human readable description
    fn description(&self) -> &str;

    /// Invoke the capability
    async fn invoke(&self, args: Vec<Value>) -> Result<Value>;
}

/// Result of a capability call as seen by the script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEnvelope {
    /// Whether the call succeeded
    pub success: bool,
    /// Returned data (for successful calls)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message (for failed calls)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CapabilityEnvelope {
    /// Create a successful envelope
    pub fn success(data: Value) -> Self {
        CapabilityEnvelope {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create a failed envelope
    pub fn failure(error: impl Into<String>) -> Self {
        CapabilityEnvelope {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Serialize for the isolate
    ///
    /// Falls back to a failure envelope so the script always gets valid JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"success":false,"error":{}}}"#,
                Value::String(format!("Failed to serialize capability result: {}", e))
            )
        })
    }
}

/// Read a required numeric argument
pub(crate) fn number_arg(args: &[Value], index: usize, name: &str) -> Result<f64> {
    match args.get(index) {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| Error::InvalidInput(format!("Argument '{}' is not a finite number", name))),
        Some(other) => Err(Error::InvalidInput(format!(
            "Argument '{}' must be a number, got {}",
            name,
            json_type(other)
        ))),
        None => Err(Error::InvalidInput(format!("Missing argument '{}'", name))),
    }
}

/// Read a required string argument
pub(crate) fn string_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(Error::InvalidInput(format!(
            "Argument '{}' must be a string, got {}",
            name,
            json_type(other)
        ))),
        None => Err(Error::InvalidInput(format!("Missing argument '{}'", name))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capability_id_round_trip() {
        for id in CapabilityId::ALL {
            assert_eq!(id.to_string().parse::<CapabilityId>().unwrap(), id);
        }
        assert!("readFile".parse::<CapabilityId>().is_err());
        assert_eq!(serde_json::to_value(CapabilityId::HttpCall).unwrap(), json!("httpCall"));
    }

    #[test]
    fn test_envelope_json() {
        let ok = CapabilityEnvelope::success(json!(3));
        assert_eq!(ok.to_json(), r#"{"success":true,"data":3}"#);

        let failed = CapabilityEnvelope::failure("nope");
        assert_eq!(failed.to_json(), r#"{"success":false,"error":"nope"}"#);
    }

    #[test]
    fn test_argument_helpers() {
        let args = vec![json!(1.5), json!("x")];
        assert_eq!(number_arg(&args, 0, "a").unwrap(), 1.5);
        assert!(number_arg(&args, 1, "b").unwrap_err().to_string().contains("must be a number"));
        assert!(string_arg(&args, 2, "c").unwrap_err().to_string().contains("Missing"));
    }
}
