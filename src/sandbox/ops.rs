//! Host ops exposed to the isolate
//!
//! Scripts never see these directly: the bootstrap captures them in a closure
//! and deletes `Deno` before user code is compiled.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use deno_core::{op2, OpState};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};

use super::collector::LogCollector;
use crate::capabilities::{CapabilityEnvelope, CapabilityId, CapabilityRegistry};

deno_core::extension!(
    sandbox_host,
    ops = [op_sandbox_log, op_sandbox_settle, op_sandbox_invoke],
);

/// JSON envelope written by the invoke script: `{ok}` or `{error}`
pub(crate) struct Settlement(pub String);

/// Woken once the script settles
pub(crate) struct SettleSignal(pub Arc<Notify>);

/// Per-run state for capability calls
pub(crate) struct CapabilityBridge {
    registry: Arc<CapabilityRegistry>,
    allowed: BTreeSet<CapabilityId>,
    host: Handle,
    call_timeout: Duration,
    deadline: Instant,
    max_calls: usize,
    max_args_bytes: usize,
    calls_made: usize,
}

/// A validated call ready to run on the host runtime
pub(crate) struct PreparedCall {
    registry: Arc<CapabilityRegistry>,
    host: Handle,
    id: CapabilityId,
    args: Vec<Value>,
    timeout: Duration,
}

impl CapabilityBridge {
    pub(crate) fn new(
        registry: Arc<CapabilityRegistry>,
        allowed: BTreeSet<CapabilityId>,
        host: Handle,
        call_timeout: Duration,
        deadline: Instant,
        max_calls: usize,
        max_args_bytes: usize,
    ) -> Self {
        CapabilityBridge {
            registry,
            allowed,
            host,
            call_timeout,
            deadline,
            max_calls,
            max_args_bytes,
            calls_made: 0,
        }
    }

    /// Check limits and decode arguments
    pub(crate) fn prepare(&mut self, name: &str, args_json: &str) -> Result<PreparedCall, CapabilityEnvelope> {
        let id = name
            .parse::<CapabilityId>()
            .ok()
            .filter(|id| self.allowed.contains(id) && self.registry.contains(*id))
            .ok_or_else(|| CapabilityEnvelope::failure(format!("Capability '{}' is not available", name)))?;

        if self.calls_made >= self.max_calls {
            return Err(CapabilityEnvelope::failure(format!(
                "Capability call limit of {} per run reached",
                self.max_calls
            )));
        }
        self.calls_made += 1;

        if args_json.len() > self.max_args_bytes {
            return Err(CapabilityEnvelope::failure(format!(
                "Capability arguments exceed {} bytes",
                self.max_args_bytes
            )));
        }

        let args: Vec<Value> = serde_json::from_str(args_json)
            .map_err(|e| CapabilityEnvelope::failure(format!("Invalid capability arguments: {}", e)))?;

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CapabilityEnvelope::failure("Script deadline reached"));
        }

        Ok(PreparedCall {
            registry: self.registry.clone(),
            host: self.host.clone(),
            id,
            args,
            timeout: self.call_timeout.min(remaining),
        })
    }

    /// Calls made so far in this run
    pub(crate) fn calls_made(&self) -> usize {
        self.calls_made
    }
}

impl PreparedCall {
    /// Run the call on the host runtime
    pub(crate) fn spawn(self) -> AbortOnDrop<CapabilityEnvelope> {
        let PreparedCall {
            registry,
            host,
            id,
            args,
            timeout,
        } = self;
        AbortOnDrop(host.spawn(async move { registry.invoke(id, args, timeout).await }))
    }
}

/// Join handle that aborts its task when dropped
///
/// Pending op futures are dropped with the isolate, which cancels any host
/// work a finished or interrupted script left behind.
pub(crate) struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[op2(fast)]
fn op_sandbox_log(state: &mut OpState, #[string] message: &str) {
    if let Some(logs) = state.try_borrow_mut::<LogCollector>() {
        logs.push(message);
    }
}

#[op2(fast)]
fn op_sandbox_settle(state: &mut OpState, #[string] json: &str) {
    if !state.has::<Settlement>() {
        state.put(Settlement(json.to_string()));
        if let Some(signal) = state.try_borrow::<SettleSignal>() {
            signal.0.notify_one();
        }
    }
}

#[op2(async)]
#[string]
async fn op_sandbox_invoke(
    state: Rc<RefCell<OpState>>,
    #[string] name: String,
    #[string] args_json: String,
) -> String {
    let prepared = {
        let mut state = state.borrow_mut();
        match state.try_borrow_mut::<CapabilityBridge>() {
            Some(bridge) => bridge.prepare(&name, &args_json),
            None => Err(CapabilityEnvelope::failure("No capabilities are available")),
        }
    };

    let envelope = match prepared {
        Ok(call) => match call.spawn().await {
            Ok(envelope) => envelope,
            Err(e) => CapabilityEnvelope::failure(format!("Capability '{}' was cancelled: {}", name, e)),
        },
        Err(envelope) => envelope,
    };
    envelope.to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::AddNumbersCapability;
    use serde_json::json;

    fn bridge(max_calls: usize, max_args_bytes: usize) -> CapabilityBridge {
        let registry = Arc::new(CapabilityRegistry::builder().register(AddNumbersCapability).build());
        CapabilityBridge::new(
            registry,
            [CapabilityId::AddNumbers].into_iter().collect(),
            Handle::current(),
            Duration::from_secs(1),
            Instant::now() + Duration::from_secs(5),
            max_calls,
            max_args_bytes,
        )
    }

    #[tokio::test]
    async fn test_prepare_and_spawn() {
        let mut bridge = bridge(4, 1024);
        let call = bridge.prepare("addNumbers", "[1, 2]").unwrap();
        assert!(call.timeout <= Duration::from_secs(1));

        let envelope = call.spawn().await.unwrap();
        assert_eq!(envelope, CapabilityEnvelope::success(json!(3.0)));
        assert_eq!(bridge.calls_made(), 1);
    }

    #[tokio::test]
    async fn test_disallowed_capability() {
        let mut bridge = bridge(4, 1024);
        let envelope = bridge.prepare("httpCall", "[]").err().unwrap();
        assert!(envelope.error.unwrap().contains("not available"));
        assert_eq!(bridge.calls_made(), 0);
    }

    #[tokio::test]
    async fn test_call_limits() {
        let mut bridge = bridge(1, 8);
        let envelope = bridge.prepare("addNumbers", "[100000, 200000]").err().unwrap();
        assert!(envelope.error.unwrap().contains("exceed 8 bytes"));

        let envelope = bridge.prepare("addNumbers", "[1,2]").err().unwrap();
        assert!(envelope.error.unwrap().contains("limit of 1"));
    }

    #[tokio::test]
    async fn test_timeout_clamped_to_deadline() {
        let mut bridge = bridge(4, 1024);
        bridge.deadline = Instant::now() + Duration::from_millis(50);
        let call = bridge.prepare("addNumbers", "[1,2]").unwrap();
        assert!(call.timeout <= Duration::from_millis(50));
    }
}
