//! Sandbox service lifecycle
//!
//! Wires configuration, the capability registry, the isolate runtime and the
//! worker pool together, and tears them down in order.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::capabilities::CapabilityRegistry;
use crate::config::{validate_config, Config};
use crate::error::{Error, Result};
use crate::pool::{PoolSettings, PoolSnapshot, ShutdownReport, WorkerPool};
use crate::queue::{JobOutcome, JobQueue, QueueConsumer, RetryPolicy};
use crate::sandbox::{ExecutionRequest, ExecutionResult, IsolateLimits, IsolateRuntime};

/// A running sandbox engine
#[derive(Clone)]
pub struct SandboxService {
    pool: WorkerPool,
    shutdown_grace: Duration,
    consumer: Arc<Mutex<Option<QueueConsumer>>>,
}

/// Validate configuration and start the engine
///
/// Must be called inside a tokio runtime: capability calls and pool
/// supervision run on it.
pub fn initialize_sandbox_service(config: &Config) -> Result<SandboxService> {
    let validation = validate_config(config);
    for issue in &validation.warnings {
        warn!(path = %issue.path, "Config warning: {}", issue.message);
    }
    if !validation.valid {
        return Err(Error::Config(validation.error_summary()));
    }

    let registry = Arc::new(CapabilityRegistry::from_config(&config.capabilities)?);
    let runtime = IsolateRuntime::new(registry, IsolateLimits::from_config(config))?;
    let pool = WorkerPool::initialize(PoolSettings::from_config(&config.sandbox), runtime)?;

    info!(
        pool_size = config.sandbox.pool_size,
        default_timeout_ms = config.sandbox.default_timeout.as_millis() as u64,
        "Sandbox service initialized"
    );

    Ok(SandboxService {
        pool,
        shutdown_grace: config.sandbox.shutdown_grace,
        consumer: Arc::new(Mutex::new(None)),
    })
}

/// Stop the queue consumer, drain the pool and force-terminate stragglers
pub async fn shutdown_sandbox_service(service: SandboxService) -> ShutdownReport {
    let consumer = match service.consumer.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(consumer) = consumer {
        consumer.stop().await;
    }

    let report = service.pool.shutdown(service.shutdown_grace).await;
    if report.forced > 0 {
        warn!(forced = report.forced, "Scripts were force-terminated at shutdown");
    }
    info!(
        completed = report.completed,
        rejected_queued = report.rejected_queued,
        "Sandbox service stopped"
    );
    report
}

impl SandboxService {
    /// Run a script with the default timeout and every registered capability
    pub async fn run(&self, code: impl Into<String>, context: Value) -> Result<ExecutionResult> {
        self.submit(ExecutionRequest::new(code).with_context(context)).await
    }

    /// Submit a fully specified request
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.pool.submit(request).await
    }

    /// Feed jobs from `queue` into the pool until shutdown
    pub fn attach_queue(&self, queue: Arc<dyn JobQueue>, policy: RetryPolicy) -> Result<mpsc::Receiver<JobOutcome>> {
        let mut slot = match self.consumer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return Err(Error::Config("A job queue is already attached".to_string()));
        }

        let (consumer, outcomes) =
            QueueConsumer::start(queue, self.pool.clone(), policy, self.pool.settings().pool_size);
        *slot = Some(consumer);
        Ok(outcomes)
    }

    /// Pool diagnostics
    pub fn snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    /// Whether new requests are accepted
    pub fn is_accepting(&self) -> bool {
        self.pool.is_accepting()
    }

    /// The underlying pool
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ExecutionJob, InMemoryJobQueue};
    use serde_json::json;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.sandbox.pool_size = 2;
        config.sandbox.prewarm_workers = Some(1);
        config.sandbox.shutdown_grace = Duration::from_millis(200);
        config.capabilities.enabled = Some(vec!["addNumbers".into()]);
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_and_shutdown() {
        let service = initialize_sandbox_service(&test_config()).unwrap();

        let result = service
            .run(
                "const r = await addNumbers(context.a, context.b); return r.data;",
                json!({"a": 4, "b": 5}),
            )
            .await
            .unwrap();
        assert_eq!(result.value, Some(json!(9)));

        let report = shutdown_sandbox_service(service.clone()).await;
        assert_eq!(report, ShutdownReport::default());
        assert!(!service.is_accepting());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.sandbox.pool_size = 0;
        assert!(matches!(initialize_sandbox_service(&config), Err(Error::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attached_queue() {
        let service = initialize_sandbox_service(&test_config()).unwrap();
        let queue = Arc::new(InMemoryJobQueue::new(4));
        let mut outcomes = service.attach_queue(queue.clone(), RetryPolicy::default()).unwrap();
        assert!(service.attach_queue(queue.clone(), RetryPolicy::default()).is_err());

        let ack = queue
            .enqueue(ExecutionJob::new(ExecutionRequest::new("return 'queued';")))
            .await
            .unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.job_id, ack.job_id);
        assert_eq!(outcome.result.unwrap().value, Some(json!("queued")));

        shutdown_sandbox_service(service).await;
    }
}
