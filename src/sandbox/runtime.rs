//! Isolate runtime - runs one script in a fresh V8 isolate
//!
//! Every run gets a brand new `JsRuntime` that is dropped as soon as the
//! outcome is known. `JsRuntime` is `!Send`, so `IsolateRuntime::run` must be
//! driven on the thread that will own the isolate, inside a current-thread
//! tokio runtime (the pool's workers do exactly that). Capability calls are
//! executed on the host runtime captured when the `IsolateRuntime` was built.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};

use super::collector::LogCollector;
use super::ops::{sandbox_host, CapabilityBridge, SettleSignal, Settlement};
use super::result::{ErrorKind, ExecutionOutcome, IsolateRun};
use crate::capabilities::{CapabilityId, CapabilityRegistry};
use crate::config::Config;
use crate::error::{Error, Result};

/// Installs console, capability globals and `context`, then removes every
/// route back to the host ops and to runtime code generation.
const BOOTSTRAP: &str = r#"
((ops, allowed, context) => {
    const logOp = ops.op_sandbox_log;
    const settleOp = ops.op_sandbox_settle;
    const invokeOp = ops.op_sandbox_invoke;

    const message = (e) =>
        e !== null && typeof e === "object" && "message" in e ? String(e.message) : String(e);

    const render = (value) => {
        if (typeof value === "string") return value;
        try {
            const json = JSON.stringify(value);
            return json === undefined ? String(value) : json;
        } catch (_) {
            return String(value);
        }
    };
    const writer = (prefix) => (...args) => logOp(prefix + args.map(render).join(" "));
    globalThis.console = Object.freeze({
        log: writer(""),
        info: writer(""),
        debug: writer(""),
        warn: writer("[warn] "),
        error: writer("[error] "),
    });

    for (const name of allowed) {
        const capability = async (...args) => {
            let payload;
            try {
                payload = JSON.stringify(args);
            } catch (e) {
                return { success: false, error: `Arguments are not serializable: ${message(e)}` };
            }
            return JSON.parse(await invokeOp(name, payload));
        };
        Object.defineProperty(globalThis, name, {
            value: capability, writable: false, configurable: false, enumerable: true,
        });
    }

    globalThis.context = context;

    const AsyncFunction = (async function () {}).constructor;
    let main = null;

    Object.defineProperty(globalThis, "__sandboxCompile", {
        configurable: true,
        value: (body) => {
            delete globalThis.__sandboxCompile;
            main = new AsyncFunction(body);
        },
    });

    Object.defineProperty(globalThis, "__sandboxRun", {
        configurable: true,
        value: () => {
            delete globalThis.__sandboxRun;
            const run = main;
            main = null;
            (async () => {
                try {
                    const value = await run();
                    if (typeof value === "function" || typeof value === "symbol") {
                        settleOp(JSON.stringify({ error: `Return value is not serializable: ${typeof value}` }));
                        return;
                    }
                    let json;
                    try {
                        json = JSON.stringify({ ok: value === undefined ? null : value });
                    } catch (e) {
                        settleOp(JSON.stringify({ error: `Return value is not serializable: ${message(e)}` }));
                        return;
                    }
                    settleOp(json);
                } catch (e) {
                    settleOp(JSON.stringify({ error: message(e) }));
                }
            })();
        },
    });

    delete globalThis.Deno;
    delete globalThis.eval;
    const GeneratorFunction = (function* () {}).constructor;
    const AsyncGeneratorFunction = (async function* () {}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {
        Object.defineProperty(ctor.prototype, "constructor", {
            value: undefined, configurable: false, writable: false,
        });
    }
})"#;

const INVOKE: &str = "globalThis.__sandboxRun();";

/// Why a run was interrupted from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// The request timeout elapsed
    Timeout,
    /// The pool is shutting down
    Shutdown,
}

/// Cross-thread handle that force-stops a run
///
/// The first `interrupt` wins. Interrupting terminates V8 execution of the
/// attached isolate (even inside a tight loop) and wakes the event loop race,
/// so time spent awaiting capability calls is cut short too.
#[derive(Clone)]
pub struct InterruptHandle {
    inner: Arc<InterruptInner>,
}

struct InterruptInner {
    reason: watch::Sender<Option<InterruptReason>>,
    isolate: Mutex<Option<v8::IsolateHandle>>,
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptHandle {
    /// Create a handle with no isolate attached
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        InterruptHandle {
            inner: Arc::new(InterruptInner {
                reason,
                isolate: Mutex::new(None),
            }),
        }
    }

    /// Interrupt the run; returns false if it was already interrupted
    pub fn interrupt(&self, reason: InterruptReason) -> bool {
        let first = self.inner.reason.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });

        if first {
            if let Some(isolate) = self.isolate().as_ref() {
                isolate.terminate_execution();
            }
        }
        first
    }

    /// The interrupt reason, if interrupted
    pub fn reason(&self) -> Option<InterruptReason> {
        *self.inner.reason.borrow()
    }

    /// Wait until the run is interrupted
    pub async fn interrupted(&self) -> InterruptReason {
        let mut rx = self.inner.reason.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn attach(&self, handle: v8::IsolateHandle) {
        let mut isolate = self.isolate();
        if self.reason().is_some() {
            handle.terminate_execution();
        }
        *isolate = Some(handle);
    }

    fn detach(&self) {
        self.isolate().take();
    }

    fn isolate(&self) -> MutexGuard<'_, Option<v8::IsolateHandle>> {
        match self.inner.isolate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-isolate resource limits
#[derive(Debug, Clone)]
pub struct IsolateLimits {
    pub max_heap_bytes: usize,
    pub max_log_bytes: usize,
    pub call_timeout: Duration,
    pub max_calls_per_run: usize,
    pub max_args_bytes: usize,
}

impl IsolateLimits {
    /// Limits from the `sandbox` and `capabilities` config sections
    pub fn from_config(config: &Config) -> Self {
        IsolateLimits {
            max_heap_bytes: config.sandbox.max_heap_bytes,
            max_log_bytes: config.sandbox.max_log_bytes,
            call_timeout: config.capabilities.call_timeout,
            max_calls_per_run: config.capabilities.max_calls_per_run,
            max_args_bytes: config.capabilities.max_args_bytes,
        }
    }
}

impl Default for IsolateLimits {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One script ready to run
#[derive(Debug, Clone)]
pub struct IsolateTask {
    pub script: String,
    pub allowed: BTreeSet<CapabilityId>,
    pub context: Value,
    pub timeout: Duration,
}

/// Creates and drives isolates
#[derive(Clone)]
pub struct IsolateRuntime {
    registry: Arc<CapabilityRegistry>,
    limits: IsolateLimits,
    host: Handle,
}

/// State for the near-heap-limit callback
#[derive(Default)]
struct HeapLimitState {
    handle: OnceLock<v8::IsolateHandle>,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState created in `run`,
    // which is declared before the runtime and therefore dropped after it.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        if let Some(handle) = state.handle.get() {
            handle.terminate_execution();
        }
    }
    // headroom so the termination can unwind
    current_heap_limit + 1024 * 1024
}

/// Fires a timeout interrupt unless stopped first
struct Watchdog {
    cancel: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn start(timeout: Duration, interrupt: InterruptHandle) -> Result<Self> {
        let (cancel, cancelled) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("sandbox-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                    interrupt.interrupt(InterruptReason::Timeout);
                }
            })?;

        Ok(Watchdog {
            cancel: Some(cancel),
            thread: Some(thread),
        })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// How the script steps ended, before interrupts are considered
#[derive(Debug)]
enum StepFailure {
    Compile(String),
    Runtime(String),
}

impl IsolateRuntime {
    /// Create a runtime that runs capability calls on the current tokio runtime
    pub fn new(registry: Arc<CapabilityRegistry>, limits: IsolateLimits) -> Result<Self> {
        let host = Handle::try_current()
            .map_err(|_| Error::Runtime("IsolateRuntime must be created inside a tokio runtime".to_string()))?;
        Ok(Self::with_handle(registry, limits, host))
    }

    /// Create a runtime that runs capability calls on `host`
    pub fn with_handle(registry: Arc<CapabilityRegistry>, limits: IsolateLimits, host: Handle) -> Self {
        IsolateRuntime { registry, limits, host }
    }

    /// The capability registry
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Resource limits
    pub fn limits(&self) -> &IsolateLimits {
        &self.limits
    }

    fn create_runtime(&self) -> JsRuntime {
        let create_params = v8::CreateParams::default().heap_limits(0, self.limits.max_heap_bytes);
        JsRuntime::new(RuntimeOptions {
            extensions: vec![sandbox_host::init()],
            create_params: Some(create_params),
            ..Default::default()
        })
    }

    /// Create and discard one isolate so V8 setup costs are paid up front
    pub fn prewarm(&self) -> Result<()> {
        let mut runtime = self.create_runtime();
        runtime
            .execute_script("[sandbox:prewarm]", "void 0;")
            .map_err(|e| Error::Runtime(format!("Isolate prewarm failed: {}", e)))?;
        Ok(())
    }

    /// Run one script to completion, error or forced interrupt
    ///
    /// Always produces an `IsolateRun`; failures are part of the outcome.
    pub async fn run(&self, task: IsolateTask, interrupt: &InterruptHandle) -> IsolateRun {
        let timeout_ms = task.timeout.as_millis() as u64;
        // Isolate setup counts against the timeout
        let deadline = Instant::now() + task.timeout;
        let settled = Arc::new(Notify::new());

        let heap_state = Box::new(HeapLimitState::default());
        let mut runtime = self.create_runtime();
        {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            op_state.put(LogCollector::new(self.limits.max_log_bytes));
            op_state.put(CapabilityBridge::new(
                self.registry.clone(),
                task.allowed.clone(),
                self.host.clone(),
                self.limits.call_timeout,
                deadline,
                self.limits.max_calls_per_run,
                self.limits.max_args_bytes,
            ));
            op_state.put(SettleSignal(settled.clone()));
        }

        let isolate = runtime.v8_isolate();
        let _ = heap_state.handle.set(isolate.thread_safe_handle());
        isolate.add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );
        interrupt.attach(isolate.thread_safe_handle());

        let started_at = Utc::now();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let stepped = match Watchdog::start(remaining, interrupt.clone()) {
            Ok(watchdog) => {
                let stepped = self.drive(&mut runtime, &task, interrupt, &settled).await;
                drop(watchdog);
                stepped
            }
            Err(e) => Err(StepFailure::Runtime(format!("Failed to start watchdog: {}", e))),
        };
        interrupt.detach();

        let (settlement, logs) = {
            let op_state = runtime.op_state();
            let mut op_state = op_state.borrow_mut();
            let settlement = op_state.try_take::<Settlement>().map(|s| s.0);
            let logs = op_state
                .try_take::<LogCollector>()
                .map(LogCollector::into_string)
                .unwrap_or_default();
            (settlement, logs)
        };

        let outcome = classify(
            interrupt.reason(),
            heap_state.triggered.load(Ordering::SeqCst),
            self.limits.max_heap_bytes,
            stepped,
            settlement,
            timeout_ms,
        );
        let ended_at = Utc::now();
        drop(runtime);

        IsolateRun {
            outcome,
            logs,
            started_at,
            ended_at,
        }
    }

    async fn drive(
        &self,
        runtime: &mut JsRuntime,
        task: &IsolateTask,
        interrupt: &InterruptHandle,
        settled: &Notify,
    ) -> std::result::Result<(), StepFailure> {
        let allowed: Vec<&str> = task.allowed.iter().map(|id| id.as_str()).collect();
        let allowed = serde_json::to_string(&allowed).map_err(|e| StepFailure::Runtime(e.to_string()))?;
        let context = serde_json::to_string(&task.context).map_err(|e| StepFailure::Runtime(e.to_string()))?;

        runtime
            .execute_script(
                "[sandbox:bootstrap]",
                format!("{}(Deno.core.ops, {}, {});", BOOTSTRAP, allowed, context),
            )
            .map_err(|e| StepFailure::Runtime(e.to_string()))?;

        // Parsed as a standalone function body; nothing runs in this step
        let body = serde_json::to_string(&task.script).map_err(|e| StepFailure::Runtime(e.to_string()))?;
        runtime
            .execute_script("[sandbox:compile]", format!("globalThis.__sandboxCompile({});", body))
            .map_err(|e| StepFailure::Compile(e.to_string()))?;

        runtime
            .execute_script("[sandbox:invoke]", INVOKE)
            .map_err(|e| StepFailure::Runtime(e.to_string()))?;

        // Capability calls the script never awaited are dropped with the isolate
        tokio::select! {
            biased;
            _ = interrupt.interrupted() => Ok(()),
            _ = settled.notified() => Ok(()),
            result = runtime.run_event_loop(PollEventLoopOptions::default()) => {
                result.map_err(|e| StepFailure::Runtime(e.to_string()))
            }
        }
    }
}

/// Decide the outcome: interrupt, then heap limit, then compile and runtime
/// errors, then whatever the script settled with
fn classify(
    interrupt: Option<InterruptReason>,
    heap_exceeded: bool,
    max_heap_bytes: usize,
    stepped: std::result::Result<(), StepFailure>,
    settlement: Option<String>,
    timeout_ms: u64,
) -> ExecutionOutcome {
    match interrupt {
        Some(InterruptReason::Timeout) => return ExecutionOutcome::timed_out(timeout_ms),
        Some(InterruptReason::Shutdown) => {
            return ExecutionOutcome::failure(ErrorKind::Shutdown, "Sandbox shut down before the script completed")
        }
        None => {}
    }

    if heap_exceeded {
        return ExecutionOutcome::failure(
            ErrorKind::Runtime,
            format!("Script exceeded the memory limit of {} bytes", max_heap_bytes),
        );
    }

    match stepped {
        Err(StepFailure::Compile(message)) => return ExecutionOutcome::failure(ErrorKind::Compile, message),
        Err(StepFailure::Runtime(message)) => return ExecutionOutcome::failure(ErrorKind::Runtime, message),
        Ok(()) => {}
    }

    match settlement {
        Some(json) => read_settlement(&json),
        None => ExecutionOutcome::failure(
            ErrorKind::Runtime,
            "Script finished without producing a result (a promise never settled)",
        ),
    }
}

fn read_settlement(json: &str) -> ExecutionOutcome {
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(mut envelope)) => match envelope.remove("error") {
            Some(Value::String(message)) => ExecutionOutcome::failure(ErrorKind::Runtime, message),
            Some(other) => ExecutionOutcome::failure(ErrorKind::Runtime, other.to_string()),
            None => ExecutionOutcome::Success(envelope.remove("ok").unwrap_or(Value::Null)),
        },
        _ => ExecutionOutcome::failure(ErrorKind::Runtime, "Script produced an unreadable result"),
    }
}
