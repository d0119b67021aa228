//! Execution outcome and result assembly

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Why a script failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The body failed to parse or compile
    Compile,
    /// Uncaught exception, memory limit, unsettled script or worker crash
    Runtime,
    /// Forced interrupt after the request timeout
    Timeout,
    /// Forced interrupt because the pool shut down
    Shutdown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Compile => write!(f, "compile"),
            ErrorKind::Runtime => write!(f, "runtime"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Outcome of a single isolate run
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The script returned a JSON-serializable value
    Success(Value),
    /// The script failed
    Failure { kind: ErrorKind, message: String },
}

impl ExecutionOutcome {
    /// Create a failure outcome
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    /// Timeout failure with the standard message
    pub fn timed_out(timeout_ms: u64) -> Self {
        Self::failure(
            ErrorKind::Timeout,
            format!("Script execution timed out after {}ms", timeout_ms),
        )
    }
}

/// Everything an isolate run produced
#[derive(Debug, Clone)]
pub struct IsolateRun {
    pub outcome: ExecutionOutcome,
    pub logs: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Result of a script execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Request this result answers
    pub request_id: Uuid,
    /// Whether the script returned normally
    pub success: bool,
    /// Returned value (successful runs only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Error message (failed runs only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure category (failed runs only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Captured console output
    pub logs: String,
    /// Wall-clock duration from compilation start to outcome
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Assemble a result from an isolate run
    pub fn from_run(request_id: Uuid, run: IsolateRun) -> Self {
        let duration_ms = (run.ended_at - run.started_at).num_milliseconds().max(0) as u64;
        let (success, value, error, error_kind) = match run.outcome {
            ExecutionOutcome::Success(value) => (true, Some(value), None, None),
            ExecutionOutcome::Failure { kind, message } => (false, None, Some(message), Some(kind)),
        };

        ExecutionResult {
            request_id,
            success,
            value,
            error,
            error_kind,
            logs: run.logs,
            duration_ms,
            started_at: run.started_at,
            ended_at: run.ended_at,
        }
    }

    /// Result for a run that never reported back (crashed or hung worker)
    pub fn failed(request_id: Uuid, kind: ErrorKind, message: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self::from_run(
            request_id,
            IsolateRun {
                outcome: ExecutionOutcome::failure(kind, message),
                logs: String::new(),
                started_at,
                ended_at: Utc::now(),
            },
        )
    }

    /// Whether the run timed out
    pub fn timed_out(&self) -> bool {
        self.error_kind == Some(ErrorKind::Timeout)
    }
}
