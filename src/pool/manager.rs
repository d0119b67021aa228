//! Worker pool manager
//!
//! Fixed set of workers, a bounded FIFO queue in front of them and explicit
//! rejection once both are full. Every dispatched job is supervised on the
//! host runtime: a worker that crashes or stops responding is replaced.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::worker::{WorkerHandle, WorkerId, WorkerJob, WorkerState};
use crate::capabilities::CapabilityId;
use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::sandbox::{
    ErrorKind, ExecutionRequest, ExecutionResult, InterruptHandle, InterruptReason, IsolateRun, IsolateRuntime,
    IsolateTask,
};

/// Pool sizing and request bounds
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub queue_capacity: usize,
    /// Workers that create a throwaway isolate at spawn
    pub prewarm: usize,
    pub default_timeout: Duration,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    /// Extra time a worker gets past the request timeout before it is replaced
    pub termination_grace: Duration,
    pub max_script_bytes: usize,
}

impl PoolSettings {
    /// Settings from the `sandbox` config section
    pub fn from_config(config: &SandboxConfig) -> Self {
        PoolSettings {
            pool_size: config.pool_size,
            queue_capacity: config.queue_capacity,
            prewarm: config.prewarm_count(),
            default_timeout: config.default_timeout,
            min_timeout: config.min_timeout,
            max_timeout: config.max_timeout,
            termination_grace: config.termination_grace,
            max_script_bytes: config.max_script_bytes,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

/// What happened during `shutdown`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// In-flight jobs that finished within the grace period
    pub completed: usize,
    /// Queued jobs that never started
    pub rejected_queued: usize,
    /// In-flight jobs that were force-terminated
    pub forced: usize,
}

/// Diagnostic view of one worker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_request_id: Option<Uuid>,
}

/// Diagnostic view of the pool
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub workers: Vec<WorkerSnapshot>,
    pub busy: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub accepting: bool,
    pub capabilities: BTreeSet<CapabilityId>,
}

struct InFlight {
    request_id: Uuid,
    interrupt: InterruptHandle,
}

struct WorkerSlot {
    handle: WorkerHandle,
    state: WorkerState,
    current: Option<InFlight>,
}

struct QueuedJob {
    request_id: Uuid,
    task: IsolateTask,
    reply: oneshot::Sender<Result<ExecutionResult>>,
}

struct PoolState {
    workers: Vec<WorkerSlot>,
    queue: VecDeque<QueuedJob>,
    accepting: bool,
}

impl PoolState {
    fn busy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.current.is_some()).count()
    }

    fn position(&self, id: WorkerId) -> Option<usize> {
        self.workers.iter().position(|w| w.handle.id() == id)
    }
}

struct PoolInner {
    settings: PoolSettings,
    runtime: IsolateRuntime,
    host: Handle,
    state: Mutex<PoolState>,
    busy: watch::Sender<usize>,
    next_worker_id: AtomicU64,
}

/// How a supervised job ended
enum Supervised {
    Reported(IsolateRun),
    Crashed,
    Unresponsive,
}

/// Bounded pool of isolate workers
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Start the pool's workers
    ///
    /// Must be called inside a tokio runtime; supervision tasks run on it.
    pub fn initialize(settings: PoolSettings, runtime: IsolateRuntime) -> Result<Self> {
        if settings.pool_size == 0 {
            return Err(Error::Config("Pool size must be at least 1".to_string()));
        }
        let host = Handle::try_current()
            .map_err(|_| Error::Runtime("WorkerPool must be initialized inside a tokio runtime".to_string()))?;

        let (busy, _) = watch::channel(0);
        let inner = Arc::new(PoolInner {
            settings,
            runtime,
            host,
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                queue: VecDeque::new(),
                accepting: true,
            }),
            busy,
            next_worker_id: AtomicU64::new(1),
        });

        let mut workers = Vec::with_capacity(inner.settings.pool_size);
        for index in 0..inner.settings.pool_size {
            let handle = inner.spawn_worker(index < inner.settings.prewarm)?;
            workers.push(WorkerSlot {
                handle,
                state: WorkerState::Idle,
                current: None,
            });
        }
        inner.lock().workers = workers;

        info!(
            pool_size = inner.settings.pool_size,
            queue_capacity = inner.settings.queue_capacity,
            prewarm = inner.settings.prewarm,
            "Worker pool started"
        );
        Ok(WorkerPool { inner })
    }

    /// Submit a request and wait for its result
    ///
    /// Fails immediately with `PoolExhausted` when every worker is busy and
    /// the queue is full. Resolves with `Shutdown` if the pool shuts down
    /// before the script completes.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let task = self.prepare(&request)?;
        let request_id = request.id();
        let (reply, response) = oneshot::channel();
        let job = QueuedJob {
            request_id,
            task,
            reply,
        };

        {
            let mut state = self.inner.lock();
            if !state.accepting {
                return Err(Error::NotAccepting);
            }

            if let Err(e) = self.inner.revive_terminated(&mut state) {
                error!(request_id = %request_id, "No live workers: {}", e);
                return Err(e);
            }

            let idle = state.workers.iter().position(|w| w.state == WorkerState::Idle);
            match idle {
                Some(index) => self.inner.dispatch(&mut state, index, job),
                None if state.queue.len() < self.inner.settings.queue_capacity => {
                    state.queue.push_back(job);
                    debug!(request_id = %request_id, queued = state.queue.len(), "All workers busy, request queued");
                }
                None => {
                    let busy = state.busy_count();
                    let queued = state.queue.len();
                    warn!(request_id = %request_id, busy, queued, "Pool exhausted, rejecting request");
                    return Err(Error::PoolExhausted {
                        busy,
                        queued,
                        capacity: self.inner.settings.queue_capacity,
                    });
                }
            }
        }

        response
            .await
            .map_err(|_| Error::Internal(format!("Request {} was dropped by the pool", request_id)))?
    }

    /// Stop intake, drain for up to `grace`, then force-terminate stragglers
    ///
    /// Returns once every pending submission has been resolved; it does not
    /// wait for interrupted isolates to finish unwinding.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let (rejected_queued, in_flight) = {
            let mut state = self.inner.lock();
            if !state.accepting {
                return ShutdownReport::default();
            }
            state.accepting = false;

            let rejected: Vec<QueuedJob> = state.queue.drain(..).collect();
            for job in &rejected {
                debug!(request_id = %job.request_id, "Rejecting queued request at shutdown");
            }
            let rejected_queued = rejected.len();
            for job in rejected {
                let _ = job.reply.send(Err(Error::Shutdown {
                    request_id: job.request_id,
                }));
            }

            for slot in &mut state.workers {
                match slot.state {
                    WorkerState::Idle => {
                        slot.state = WorkerState::Terminated;
                        slot.handle.close();
                    }
                    WorkerState::Busy => slot.state = WorkerState::Draining,
                    WorkerState::Draining | WorkerState::Terminated => {}
                }
            }
            (rejected_queued, state.busy_count())
        };

        info!(in_flight, rejected_queued, grace_ms = grace.as_millis() as u64, "Shutting down worker pool");

        let mut busy = self.inner.busy.subscribe();
        let drained = tokio::time::timeout(grace, busy.wait_for(|n| *n == 0)).await.is_ok();

        let mut forced = 0;
        if !drained {
            let state = self.inner.lock();
            for slot in &state.workers {
                if let Some(current) = &slot.current {
                    if current.interrupt.interrupt(InterruptReason::Shutdown) {
                        forced += 1;
                        warn!(
                            worker_id = %slot.handle.id(),
                            request_id = %current.request_id,
                            "Force-terminating script at shutdown"
                        );
                    }
                }
            }
        }

        let report = ShutdownReport {
            completed: in_flight.saturating_sub(forced),
            rejected_queued,
            forced,
        };
        info!(
            completed = report.completed,
            rejected_queued = report.rejected_queued,
            forced = report.forced,
            "Worker pool stopped"
        );
        report
    }

    /// Diagnostic snapshot
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.inner.lock();
        PoolSnapshot {
            workers: state
                .workers
                .iter()
                .map(|w| WorkerSnapshot {
                    id: w.handle.id(),
                    state: w.state,
                    current_request_id: w.current.as_ref().map(|c| c.request_id),
                })
                .collect(),
            busy: state.busy_count(),
            queue_depth: state.queue.len(),
            queue_capacity: self.inner.settings.queue_capacity,
            accepting: state.accepting,
            capabilities: self.inner.runtime.registry().ids(),
        }
    }

    /// Whether the pool accepts submissions
    pub fn is_accepting(&self) -> bool {
        self.inner.lock().accepting
    }

    /// Pool settings
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Validate a request against the pool bounds and the registry
    fn prepare(&self, request: &ExecutionRequest) -> Result<IsolateTask> {
        let settings = &self.inner.settings;

        let script_bytes = request.script_body().len();
        if script_bytes > settings.max_script_bytes {
            return Err(Error::InvalidInput(format!(
                "Script is {} bytes, the limit is {} bytes",
                script_bytes, settings.max_script_bytes
            )));
        }

        let timeout = request
            .timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or(settings.default_timeout);
        if timeout < settings.min_timeout || timeout > settings.max_timeout {
            return Err(Error::InvalidInput(format!(
                "timeoutMs must be between {} and {}",
                settings.min_timeout.as_millis(),
                settings.max_timeout.as_millis()
            )));
        }

        let registered = self.inner.runtime.registry().ids();
        let allowed = match request.allowed_capabilities() {
            Some(requested) => {
                let unknown: Vec<String> = requested.difference(&registered).map(|id| id.to_string()).collect();
                if !unknown.is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "Capabilities not available: {}",
                        unknown.join(", ")
                    )));
                }
                requested.clone()
            }
            None => registered,
        };

        Ok(IsolateTask {
            script: request.script_body().to_string(),
            allowed,
            context: request.context().clone(),
            timeout,
        })
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_worker(&self, prewarm: bool) -> Result<WorkerHandle> {
        let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
        WorkerHandle::spawn(id, self.runtime.clone(), prewarm)
    }

    /// Respawn slots whose worker could not be replaced earlier
    ///
    /// Fails only when no slot is left that could ever run a job.
    fn revive_terminated(&self, state: &mut PoolState) -> Result<()> {
        let mut last_error = None;
        for slot in state.workers.iter_mut().filter(|w| w.state == WorkerState::Terminated) {
            match self.spawn_worker(false) {
                Ok(handle) => {
                    info!(old = %slot.handle.id(), new = %handle.id(), "Terminated worker revived");
                    slot.handle = handle;
                    slot.state = WorkerState::Idle;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let live = state
            .workers
            .iter()
            .any(|w| matches!(w.state, WorkerState::Idle | WorkerState::Busy));
        match last_error {
            Some(e) if !live => Err(Error::Worker(format!("No worker could be started: {}", e))),
            _ => Ok(()),
        }
    }

    /// Resolve queued jobs that no worker is left to run
    fn fail_queue_if_dead(&self, state: &mut PoolState) {
        let live = state
            .workers
            .iter()
            .any(|w| matches!(w.state, WorkerState::Idle | WorkerState::Busy));
        if live || !state.accepting {
            return;
        }
        for job in state.queue.drain(..) {
            let _ = job.reply.send(Err(Error::Worker("No live workers to run the request".to_string())));
        }
    }

    fn publish_busy(&self, state: &PoolState) {
        self.busy.send_replace(state.busy_count());
    }

    /// Hand a job to the idle worker at `index` and start supervising it
    fn dispatch(self: &Arc<Self>, state: &mut PoolState, index: usize, job: QueuedJob) {
        let QueuedJob {
            request_id,
            task,
            reply,
        } = job;
        let timeout = task.timeout;
        let interrupt = InterruptHandle::new();
        let (run_tx, run_rx) = oneshot::channel();
        let worker_job = WorkerJob {
            request_id,
            task,
            interrupt: interrupt.clone(),
            reply: run_tx,
        };

        let slot = &mut state.workers[index];
        if let Err(worker_job) = slot.handle.try_send(worker_job) {
            warn!(worker_id = %slot.handle.id(), "Worker is gone, respawning before dispatch");
            let sent = self
                .spawn_worker(false)
                .map_err(|e| e.to_string())
                .and_then(|handle| {
                    slot.handle = handle;
                    slot.handle.try_send(worker_job).map_err(|_| "replacement worker refused the job".to_string())
                });
            if let Err(e) = sent {
                error!(request_id = %request_id, "Dispatch failed: {}", e);
                slot.state = WorkerState::Terminated;
                let _ = reply.send(Err(Error::Worker(e)));
                return;
            }
        }

        slot.state = WorkerState::Busy;
        slot.current = Some(InFlight {
            request_id,
            interrupt: interrupt.clone(),
        });
        let worker_id = slot.handle.id();
        self.publish_busy(state);
        debug!(worker_id = %worker_id, request_id = %request_id, "Dispatched request");

        let inner = self.clone();
        self.host.spawn(async move {
            inner
                .supervise(worker_id, request_id, timeout, interrupt, run_rx, reply)
                .await;
        });
    }

    async fn supervise(
        self: Arc<Self>,
        worker_id: WorkerId,
        request_id: Uuid,
        timeout: Duration,
        interrupt: InterruptHandle,
        mut run_rx: oneshot::Receiver<IsolateRun>,
        reply: oneshot::Sender<Result<ExecutionResult>>,
    ) {
        let started_at = Utc::now();
        let mut reply = Some(reply);
        let mut watch_interrupt = true;
        let hang = tokio::time::sleep(timeout + self.settings.termination_grace);
        tokio::pin!(hang);

        let supervised = loop {
            tokio::select! {
                run = &mut run_rx => break match run {
                    Ok(run) => Supervised::Reported(run),
                    Err(_) => Supervised::Crashed,
                },
                _ = &mut hang => break Supervised::Unresponsive,
                reason = interrupt.interrupted(), if watch_interrupt => {
                    watch_interrupt = false;
                    if reason == InterruptReason::Shutdown {
                        if let Some(reply) = reply.take() {
                            let _ = reply.send(Err(Error::Shutdown { request_id }));
                        }
                    }
                }
            }
        };

        let (result, replace) = match supervised {
            Supervised::Reported(run) => (ExecutionResult::from_run(request_id, run), false),
            Supervised::Crashed => {
                error!(worker_id = %worker_id, request_id = %request_id, "Worker crashed while running a script");
                let result = ExecutionResult::failed(
                    request_id,
                    ErrorKind::Runtime,
                    "Worker crashed while running the script",
                    started_at,
                );
                (result, true)
            }
            Supervised::Unresponsive => {
                warn!(worker_id = %worker_id, request_id = %request_id, "Worker stopped responding, replacing it");
                interrupt.interrupt(InterruptReason::Timeout);
                let result = ExecutionResult::failed(
                    request_id,
                    ErrorKind::Runtime,
                    format!(
                        "Worker stopped responding {}ms past the script timeout",
                        self.settings.termination_grace.as_millis()
                    ),
                    started_at,
                );
                (result, true)
            }
        };

        self.complete(worker_id, replace);

        if let Some(reply) = reply.take() {
            let response = if result.error_kind == Some(ErrorKind::Shutdown) {
                Err(Error::Shutdown { request_id })
            } else {
                debug!(
                    request_id = %request_id,
                    success = result.success,
                    duration_ms = result.duration_ms,
                    "Request completed"
                );
                Ok(result)
            };
            let _ = reply.send(response);
        }
    }

    /// Release a worker after its job and pull the next queued job
    fn complete(self: &Arc<Self>, worker_id: WorkerId, replace: bool) {
        let mut state = self.lock();
        let accepting = state.accepting;
        let Some(index) = state.position(worker_id) else {
            return;
        };

        let slot = &mut state.workers[index];
        slot.current = None;
        if replace {
            slot.handle.close();
            if accepting {
                match self.spawn_worker(false) {
                    Ok(handle) => {
                        info!(old = %worker_id, new = %handle.id(), "Worker respawned");
                        slot.handle = handle;
                        slot.state = WorkerState::Idle;
                    }
                    Err(e) => {
                        error!(worker_id = %worker_id, "Failed to respawn worker: {}", e);
                        slot.state = WorkerState::Terminated;
                    }
                }
            } else {
                slot.state = WorkerState::Terminated;
            }
        } else if slot.state == WorkerState::Draining || !accepting {
            slot.state = WorkerState::Terminated;
            slot.handle.close();
        } else {
            slot.state = WorkerState::Idle;
        }

        if state.workers[index].state == WorkerState::Idle {
            if let Some(job) = state.queue.pop_front() {
                self.dispatch(&mut state, index, job);
            }
        }
        self.fail_queue_if_dead(&mut state);
        self.publish_busy(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{AddNumbersCapability, CapabilityRegistry};
    use crate::pool::worker::WorkerFault;
    use crate::sandbox::IsolateLimits;
    use serde_json::json;
    use std::time::Instant;

    fn pool(pool_size: usize, queue_capacity: usize) -> WorkerPool {
        pool_with(PoolSettings {
            pool_size,
            queue_capacity,
            prewarm: 0,
            ..PoolSettings::default()
        })
    }

    fn pool_with(settings: PoolSettings) -> WorkerPool {
        let registry = Arc::new(CapabilityRegistry::builder().register(AddNumbersCapability).build());
        let runtime = IsolateRuntime::new(registry, IsolateLimits::default()).unwrap();
        WorkerPool::initialize(settings, runtime).unwrap()
    }

    /// Swap the first worker for one that fails its jobs
    fn install_faulty_worker(pool: &WorkerPool, fault: WorkerFault) -> WorkerId {
        let id = WorkerId(pool.inner.next_worker_id.fetch_add(1, Ordering::Relaxed));
        let faulty = WorkerHandle::spawn_faulty(id, fault).unwrap();
        let mut state = pool.inner.lock();
        let mut old = std::mem::replace(&mut state.workers[0].handle, faulty);
        old.close();
        id
    }

    async fn wait_until_busy(pool: &WorkerPool, busy: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.snapshot().busy < busy {
            assert!(Instant::now() < deadline, "workers never became busy");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_returns_value() {
        let pool = pool(1, 0);
        let result = pool.submit(ExecutionRequest::new("return 1 + 1;")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.value, Some(json!(2)));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.busy, 0);
        assert_eq!(snapshot.workers[0].state, WorkerState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_result() {
        let pool = pool(1, 0);
        let started = Instant::now();
        let result = pool
            .submit(ExecutionRequest::new("while (true) {}").with_timeout_ms(200))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.timed_out());
        assert!(result.error.unwrap().contains("timed out"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(1), "returned after {:?}", elapsed);

        // the worker is reusable afterwards
        let result = pool.submit(ExecutionRequest::new("return 'ok';")).await.unwrap();
        assert_eq!(result.value, Some(json!("ok")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backpressure_rejects_immediately() {
        let pool = pool(2, 0);
        let slow = || ExecutionRequest::new("while (true) {}").with_timeout_ms(1000);

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(slow()).await }
        });
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(slow()).await }
        });
        wait_until_busy(&pool, 2).await;

        let started = Instant::now();
        let err = pool.submit(slow()).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { busy: 2, queued: 0, capacity: 0 }));
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(first.await.unwrap().unwrap().timed_out());
        assert!(second.await.unwrap().unwrap().timed_out());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queued_request_runs_after_busy_worker() {
        let pool = pool(1, 1);

        let first = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.submit(ExecutionRequest::new("while (true) {}").with_timeout_ms(300))
                    .await
            }
        });
        wait_until_busy(&pool, 1).await;

        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(ExecutionRequest::new("return 'queued';")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.snapshot().queue_depth, 1);

        assert!(first.await.unwrap().unwrap().timed_out());
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.value, Some(json!("queued")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_requests() {
        let pool = pool(1, 0);

        let err = pool
            .submit(ExecutionRequest::new("return 1;").with_timeout_ms(1))
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        let err = pool
            .submit(ExecutionRequest::new("return 1;").with_capabilities([CapabilityId::HttpCall]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("httpCall"));

        let huge = "x".repeat(PoolSettings::default().max_script_bytes + 1);
        assert!(pool.submit(ExecutionRequest::new(huge)).await.unwrap_err().is_client_error());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_isolation() {
        let pool = pool(2, 4);
        let script = |n: u32| {
            ExecutionRequest::new(format!(
                "globalThis.shared = {n}; await addNumbers(0, 0); return globalThis.shared;"
            ))
        };

        let (a, b) = tokio::join!(pool.submit(script(1)), pool.submit(script(2)));
        assert_eq!(a.unwrap().value, Some(json!(1)));
        assert_eq!(b.unwrap().value, Some(json!(2)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_resolves_everything() {
        let pool = pool(2, 2);
        let slow = || ExecutionRequest::new("while (true) {}").with_timeout_ms(10_000);

        let mut pending = Vec::new();
        for _ in 0..2 {
            let pool = pool.clone();
            pending.push(tokio::spawn(async move { pool.submit(slow()).await }));
        }
        wait_until_busy(&pool, 2).await;
        let queued = tokio::spawn({
            let pool = pool.clone();
            async move { pool.submit(slow()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let report = pool.shutdown(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            report,
            ShutdownReport {
                completed: 0,
                rejected_queued: 1,
                forced: 2,
            }
        );

        assert!(matches!(queued.await.unwrap(), Err(Error::Shutdown { .. })));
        for handle in pending {
            assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown { .. })));
        }

        assert!(matches!(
            pool.submit(ExecutionRequest::new("return 1;")).await,
            Err(Error::NotAccepting)
        ));
        assert!(!pool.snapshot().accepting);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_waits_for_short_jobs() {
        let pool = pool(1, 0);
        let running = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.submit(ExecutionRequest::new(
                    "const end = Date.now() + 300; while (Date.now() < end) {} return 'done';",
                ))
                .await
            }
        });
        wait_until_busy(&pool, 1).await;

        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.forced, 0);
        assert_eq!(report.completed, 1);
        assert_eq!(running.await.unwrap().unwrap().value, Some(json!("done")));
        assert_eq!(pool.snapshot().workers[0].state, WorkerState::Terminated);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_crashed_worker_is_replaced() {
        let pool = pool(1, 0);
        let faulty = install_faulty_worker(&pool, WorkerFault::DropsReply);

        let result = pool.submit(ExecutionRequest::new("return 1;")).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Runtime));
        assert!(result.error.unwrap().contains("crashed"));

        let snapshot = pool.snapshot();
        assert_ne!(snapshot.workers[0].id, faulty);
        assert_eq!(snapshot.workers[0].state, WorkerState::Idle);

        let result = pool.submit(ExecutionRequest::new("return 'alive';")).await.unwrap();
        assert_eq!(result.value, Some(json!("alive")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unresponsive_worker_is_replaced() {
        let pool = pool_with(PoolSettings {
            pool_size: 1,
            queue_capacity: 0,
            prewarm: 0,
            termination_grace: Duration::from_millis(100),
            ..PoolSettings::default()
        });
        let faulty = install_faulty_worker(&pool, WorkerFault::NeverReplies);

        let started = Instant::now();
        let result = pool
            .submit(ExecutionRequest::new("return 1;").with_timeout_ms(200))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(result.error_kind, Some(ErrorKind::Runtime));
        assert!(result.error.unwrap().contains("stopped responding"));

        let snapshot = pool.snapshot();
        assert_ne!(snapshot.workers[0].id, faulty);
        assert_eq!(snapshot.workers[0].state, WorkerState::Idle);

        let result = pool.submit(ExecutionRequest::new("return 'alive';")).await.unwrap();
        assert_eq!(result.value, Some(json!("alive")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_terminated_workers_are_revived_on_submit() {
        let pool = pool(2, 1);
        let dead: Vec<WorkerId> = {
            let mut state = pool.inner.lock();
            for slot in &mut state.workers {
                slot.state = WorkerState::Terminated;
                slot.handle.close();
            }
            state.workers.iter().map(|w| w.handle.id()).collect()
        };

        let result = tokio::time::timeout(Duration::from_secs(5), pool.submit(ExecutionRequest::new("return 3;")))
            .await
            .expect("submit must not hang on a pool of terminated workers")
            .unwrap();
        assert_eq!(result.value, Some(json!(3)));

        let snapshot = pool.snapshot();
        for worker in &snapshot.workers {
            assert!(!dead.contains(&worker.id));
            assert_eq!(worker.state, WorkerState::Idle);
        }
    }
}
