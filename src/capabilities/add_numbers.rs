//! addNumbers capability
//!
//! Adds two numbers on the host. Mostly useful as a smoke test for the bridge.

use async_trait::async_trait;
use serde_json::{Number, Value};

use super::traits::{number_arg, Capability, CapabilityId};
use crate::error::{Error, Result};

/// `addNumbers(a, b)` returns `a + b`
pub struct AddNumbersCapability;

#[async_trait]
impl Capability for AddNumbersCapability {
    fn id(&self) -> CapabilityId {
        CapabilityId::AddNumbers
    }

    fn description(&self) -> &str {
        "Add two numbers: addNumbers(a, b)"
    }

    async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        let a = number_arg(&args, 0, "a")?;
        let b = number_arg(&args, 1, "b")?;

        Number::from_f64(a + b)
            .map(Value::Number)
            .ok_or_else(|| Error::InvalidInput("Sum is not a finite number".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_add_numbers() {
        let result = AddNumbersCapability.invoke(vec![json!(2), json!(40)]).await.unwrap();
        assert_eq!(result.as_f64(), Some(42.0));
    }

    #[tokio::test]
    async fn test_add_numbers_missing_argument() {
        let err = AddNumbersCapability.invoke(vec![json!(1)]).await.unwrap_err();
        assert!(err.to_string().contains("Missing argument 'b'"));
    }

    #[tokio::test]
    async fn test_add_numbers_overflow() {
        let err = AddNumbersCapability
            .invoke(vec![json!(f64::MAX), json!(f64::MAX)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("finite"));
    }
}
