//! Job queue - asynchronous submission path into the worker pool
//!
//! Producers enqueue `ExecutionJob`s; a `QueueConsumer` drains them into the
//! pool, retrying backpressure rejections, and publishes a `JobOutcome` per
//! job. Durability and redelivery are up to the `JobQueue` implementation;
//! the in-memory queue keeps neither.

mod consumer;
mod memory;

pub use consumer::{JobOutcome, QueueConsumer, RetryPolicy};
pub use memory::InMemoryJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::sandbox::ExecutionRequest;

/// A queued execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub job_id: Uuid,
    pub request: ExecutionRequest,
    pub enqueued_at: DateTime<Utc>,
}

impl ExecutionJob {
    /// Wrap a request in a new job
    pub fn new(request: ExecutionRequest) -> Self {
        ExecutionJob {
            job_id: Uuid::new_v4(),
            request,
            enqueued_at: Utc::now(),
        }
    }
}

/// Acknowledgement returned by `enqueue`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAck {
    pub job_id: Uuid,
    pub request_id: Uuid,
    /// Jobs ahead of this one when it was enqueued
    pub position: usize,
}

/// Enqueue/consume contract for execution jobs
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job
    async fn enqueue(&self, job: ExecutionJob) -> Result<JobAck>;

    /// Wait for the next job; `None` once the queue is closed and empty
    async fn consume(&self) -> Option<ExecutionJob>;

    /// Stop accepting jobs and wake idle consumers
    fn close(&self);

    /// Jobs waiting to be consumed
    fn len(&self) -> usize;

    /// Whether no jobs are waiting
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
