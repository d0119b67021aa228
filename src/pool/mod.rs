//! Pool module - Bounded worker pool with backpressure
//!
//! - worker.rs: Dedicated worker threads, one isolate at a time
//! - manager.rs: Assignment, queueing, supervision and shutdown

mod manager;
mod worker;

pub use manager::{PoolSettings, PoolSnapshot, ShutdownReport, WorkerPool, WorkerSnapshot};
pub use worker::{WorkerId, WorkerState};
