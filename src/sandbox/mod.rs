//! Sandbox module - Isolated script execution
//!
//! Scripts are async-function bodies executed in a fresh V8 isolate per
//! request:
//! - runtime.rs: Isolate lifecycle, forced interrupts, heap limit
//! - ops.rs: Host ops and the capability bridge
//! - collector.rs: Bounded console capture
//! - request.rs / result.rs: Request and result types

mod collector;
mod ops;
mod request;
mod result;
mod runtime;

pub use collector::{LogCollector, TRUNCATION_MARKER};
pub use request::ExecutionRequest;
pub use result::{ErrorKind, ExecutionOutcome, ExecutionResult, IsolateRun};
pub use runtime::{InterruptHandle, InterruptReason, IsolateLimits, IsolateRuntime, IsolateTask};
