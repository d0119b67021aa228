//! Queue consumer - drains a `JobQueue` into the worker pool

use backoff::future::retry;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ExecutionJob, JobQueue};
use crate::error::{Error, Result};
use crate::pool::WorkerPool;
use crate::sandbox::ExecutionResult;

/// Retry policy for submissions rejected by backpressure
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up after this long (never when unset)
    pub max_elapsed_time: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(self.max_elapsed_time)
            .build()
    }
}

/// Final outcome of a consumed job
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub request_id: Uuid,
    /// Submissions attempted, including backpressure retries
    pub attempts: u32,
    pub result: Result<ExecutionResult>,
}

/// Background task feeding queued jobs to the pool
///
/// Keeps at most `concurrency` jobs in flight so queued work waits in the
/// queue rather than in the pool.
pub struct QueueConsumer {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl QueueConsumer {
    /// Start consuming; outcomes are published on the returned channel
    pub fn start(
        queue: Arc<dyn JobQueue>,
        pool: WorkerPool,
        policy: RetryPolicy,
        concurrency: usize,
    ) -> (Self, mpsc::Receiver<JobOutcome>) {
        let concurrency = concurrency.max(1);
        let (outcomes, outcome_rx) = mpsc::channel(concurrency * 4);
        let (stop, stop_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(concurrency));

        let task = tokio::spawn(consume_loop(queue, pool, policy, outcomes, stop_rx, permits));
        info!(concurrency, "Queue consumer started");

        (QueueConsumer { stop, task }, outcome_rx)
    }

    /// Stop taking jobs from the queue
    ///
    /// Jobs already handed to the pool keep running and still publish
    /// their outcome.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        let _ = self.task.await;
        info!("Queue consumer stopped");
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn consume_loop(
    queue: Arc<dyn JobQueue>,
    pool: WorkerPool,
    policy: RetryPolicy,
    outcomes: mpsc::Sender<JobOutcome>,
    mut stop: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
) {
    loop {
        let permit = tokio::select! {
            _ = stopped(&mut stop) => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = tokio::select! {
            _ = stopped(&mut stop) => break,
            job = queue.consume() => match job {
                Some(job) => job,
                None => break,
            },
        };

        tokio::spawn(process(job, pool.clone(), policy.clone(), outcomes.clone(), permit));
    }
    debug!("Queue consumer loop exited");
}

async fn process(
    job: ExecutionJob,
    pool: WorkerPool,
    policy: RetryPolicy,
    outcomes: mpsc::Sender<JobOutcome>,
    _permit: OwnedSemaphorePermit,
) {
    let request_id = job.request.id();
    let mut attempts = 0u32;

    let result = retry(policy.backoff(), || {
        attempts += 1;
        let pool = pool.clone();
        let request = job.request.clone();
        async move {
            pool.submit(request).await.map_err(|e| match e {
                Error::PoolExhausted { .. } => {
                    debug!(request_id = %request_id, "Pool exhausted, backing off");
                    backoff::Error::transient(e)
                }
                other => backoff::Error::permanent(other),
            })
        }
    })
    .await;

    if let Err(e) = &result {
        warn!(job_id = %job.job_id, request_id = %request_id, attempts, "Queued job failed: {}", e);
    }

    let outcome = JobOutcome {
        job_id: job.job_id,
        request_id,
        attempts,
        result,
    };
    if outcomes.send(outcome).await.is_err() {
        debug!(job_id = %job.job_id, "Outcome receiver dropped");
    }
}
