//! Async Execution Queue.
//!
//! # Responsibilities
//! - Run call operations on the Tokio worker pool
//! - Deliver each result to its completion callback ("tag")
//! - Drop operations whose flow has already finished
//! - Count pending operations and live flows
//!
//! # Data Flow
//! ```text
//! flow ──issue(op, tag)──▶ spawned task ──op.await──▶ tag(result)
//!                               │
//!                   cancel token fired ──▶ op dropped, tag never runs
//! ```
//!
//! # Design Decisions
//! - One task per operation; no thread is dedicated to a flow
//! - The tag owns whatever it captured (typically an `Arc` of the flow), so a
//!   flow lives exactly as long as its last outstanding operation

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Global counter for flow IDs. Only uniqueness matters.
static FLOW_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of one proxied call, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(u64);

impl FlowId {
    fn next() -> Self {
        Self(FLOW_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

/// Counts flows that are still alive.
#[derive(Debug, Clone, Default)]
pub struct FlowTracker {
    live: Arc<AtomicU64>,
    started: Arc<AtomicU64>,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new flow. The returned guard unregisters it on drop.
    pub fn track(&self) -> FlowGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::Relaxed);
        FlowGuard {
            live: Arc::clone(&self.live),
            id: FlowId::next(),
        }
    }

    /// Flows created and not yet released.
    pub fn live_count(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn started_count(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

/// Held by a flow for its whole lifetime.
#[derive(Debug)]
pub struct FlowGuard {
    live: Arc<AtomicU64>,
    id: FlowId,
}

impl FlowGuard {
    pub fn id(&self) -> FlowId {
        self.id
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(flow_id = %self.id, "flow released");
    }
}

/// Shared executor for call operations.
#[derive(Debug, Clone)]
pub struct AsyncQueue {
    handle: Handle,
    pending: Arc<AtomicUsize>,
    flows: FlowTracker,
}

impl AsyncQueue {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            pending: Arc::new(AtomicUsize::new(0)),
            flows: FlowTracker::new(),
        }
    }

    /// Queue bound to the runtime of the calling task.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Run `op` and pass its output to `tag`.
    ///
    /// If `cancel` fires first, `op` is dropped and `tag` never runs.
    pub fn issue<T, F, C>(&self, cancel: &CancellationToken, op: F, tag: C)
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        let pending = PendingOp::new(&self.pending);
        let cancel = cancel.clone();
        self.handle.spawn(async move {
            let _pending = pending;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                output = op => tag(output),
            }
        });
    }

    /// Operations issued and not yet completed or dropped.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn flows(&self) -> &FlowTracker {
        &self.flows
    }
}

/// Keeps the pending count accurate however the task ends.
struct PendingOp(Arc<AtomicUsize>);

impl PendingOp {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("grpc_gateway_pending_operations").increment(1.0);
        Self(Arc::clone(counter))
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!("grpc_gateway_pending_operations").decrement(1.0);
    }
}
