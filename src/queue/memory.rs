//! Bounded in-memory job queue

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

use super::{ExecutionJob, JobAck, JobQueue};
use crate::error::{Error, Result};

struct QueueState {
    jobs: VecDeque<ExecutionJob>,
    closed: bool,
}

/// FIFO queue held in process memory
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl InMemoryJobQueue {
    /// Create a queue holding at most `capacity` jobs
    pub fn new(capacity: usize) -> Self {
        InMemoryJobQueue {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Maximum number of waiting jobs
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: ExecutionJob) -> Result<JobAck> {
        let ack = {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::NotAccepting);
            }
            if state.jobs.len() >= self.capacity {
                return Err(Error::QueueFull(self.capacity));
            }

            let ack = JobAck {
                job_id: job.job_id,
                request_id: job.request.id(),
                position: state.jobs.len(),
            };
            state.jobs.push_back(job);
            ack
        };

        self.notify.notify_one();
        tracing::debug!(job_id = %ack.job_id, position = ack.position, "Job enqueued");
        Ok(ack)
    }

    async fn consume(&self) -> Option<ExecutionJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(job) = state.jobs.pop_front() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn len(&self) -> usize {
        self.lock().jobs.len()
    }
}
