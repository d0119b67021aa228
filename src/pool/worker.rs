//! Worker threads
//!
//! A worker is a dedicated OS thread with its own current-thread tokio
//! runtime, because V8 isolates cannot move between threads. It runs one job
//! at a time and creates a fresh isolate for each.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sandbox::{InterruptHandle, IsolateRuntime, IsolateRun, IsolateTask};

/// Stable worker identifier, never reused within a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Waiting for a job
    Idle,
    /// Running a job
    Busy,
    /// Finishing its current job before stopping
    Draining,
    /// Stopped
    Terminated,
}

/// A job handed to a worker thread
pub(crate) struct WorkerJob {
    pub request_id: Uuid,
    pub task: IsolateTask,
    pub interrupt: InterruptHandle,
    pub reply: oneshot::Sender<IsolateRun>,
}

/// How a faulty worker fails its jobs
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) enum WorkerFault {
    /// Behaves like a thread that died mid-job
    DropsReply,
    /// Holds jobs without ever answering
    NeverReplies,
}

/// Host-side handle to a worker thread
pub(crate) struct WorkerHandle {
    id: WorkerId,
    jobs: Option<mpsc::Sender<WorkerJob>>,
    _thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker thread
    pub fn spawn(id: WorkerId, runtime: IsolateRuntime, prewarm: bool) -> Result<Self> {
        let (jobs, mut inbox) = mpsc::channel::<WorkerJob>(1);

        let thread = std::thread::Builder::new()
            .name(format!("sandbox-{}", id))
            .spawn(move || {
                let local = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(local) => local,
                    Err(e) => {
                        error!(worker_id = %id, "Failed to start worker runtime: {}", e);
                        return;
                    }
                };

                if prewarm {
                    if let Err(e) = runtime.prewarm() {
                        warn!(worker_id = %id, "Prewarm failed: {}", e);
                    }
                }

                local.block_on(async move {
                    while let Some(job) = inbox.recv().await {
                        debug!(worker_id = %id, request_id = %job.request_id, "Running script");
                        let run = runtime.run(job.task, &job.interrupt).await;
                        let _ = job.reply.send(run);
                    }
                });
                debug!(worker_id = %id, "Worker stopped");
            })
            .map_err(|e| Error::Worker(format!("Failed to spawn {}: {}", id, e)))?;

        Ok(WorkerHandle {
            id,
            jobs: Some(jobs),
            _thread: thread,
        })
    }

    /// Spawn a worker thread that misbehaves instead of running jobs
    #[cfg(test)]
    pub fn spawn_faulty(id: WorkerId, fault: WorkerFault) -> Result<Self> {
        let (jobs, mut inbox) = mpsc::channel::<WorkerJob>(1);
        let thread = std::thread::Builder::new()
            .name(format!("sandbox-{}", id))
            .spawn(move || {
                let mut held = Vec::new();
                while let Some(job) = inbox.blocking_recv() {
                    match fault {
                        WorkerFault::DropsReply => drop(job),
                        WorkerFault::NeverReplies => held.push(job),
                    }
                }
            })
            .map_err(|e| Error::Worker(format!("Failed to spawn {}: {}", id, e)))?;

        Ok(WorkerHandle {
            id,
            jobs: Some(jobs),
            _thread: thread,
        })
    }

    /// Worker id
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Hand a job to the worker; gives the job back if the worker is gone or busy
    pub fn try_send(&self, job: WorkerJob) -> std::result::Result<(), WorkerJob> {
        match &self.jobs {
            Some(jobs) => jobs.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
            }),
            None => Err(job),
        }
    }

    /// Stop accepting jobs; the thread exits after its current job
    pub fn close(&mut self) {
        self.jobs.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityRegistry;
    use crate::sandbox::{ExecutionOutcome, IsolateLimits};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn job(script: &str) -> (WorkerJob, oneshot::Receiver<IsolateRun>) {
        let (reply, rx) = oneshot::channel();
        let job = WorkerJob {
            request_id: Uuid::new_v4(),
            task: IsolateTask {
                script: script.to_string(),
                allowed: Default::default(),
                context: Value::Null,
                timeout: Duration::from_secs(5),
            },
            interrupt: InterruptHandle::new(),
            reply,
        };
        (job, rx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_runs_jobs_in_sequence() {
        let runtime = IsolateRuntime::new(Arc::new(CapabilityRegistry::builder().build()), IsolateLimits::default()).unwrap();
        let worker = WorkerHandle::spawn(WorkerId(1), runtime, true).unwrap();
        assert_eq!(worker.id().to_string(), "worker-1");

        let (first, first_rx) = job("return 'a';");
        assert!(worker.try_send(first).is_ok());
        assert_eq!(first_rx.await.unwrap().outcome, ExecutionOutcome::Success(json!("a")));

        let (second, second_rx) = job("return 'b';");
        assert!(worker.try_send(second).is_ok());
        assert_eq!(second_rx.await.unwrap().outcome, ExecutionOutcome::Success(json!("b")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_worker_returns_job() {
        let runtime = IsolateRuntime::new(Arc::new(CapabilityRegistry::builder().build()), IsolateLimits::default()).unwrap();
        let mut worker = WorkerHandle::spawn(WorkerId(2), runtime, false).unwrap();
        worker.close();

        let (job, _rx) = job("return 1;");
        assert!(worker.try_send(job).is_err());
    }
}
