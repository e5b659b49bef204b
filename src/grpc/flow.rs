//! Proxy Flow: relays one client call to one backend call.
//!
//! # State Machine
//! ```text
//! INIT ─▶ UPSTREAM_CALLING ─▶ ACTIVE ─▶ HALF_CLOSED ─▶ FINISHING ─▶ DONE
//!                │                                         ▲
//!                └──────── start failed (UNAVAILABLE) ─────┘
//! ```
//!
//! # Pumps
//! ```text
//! client→backend:  read client ─▶ write backend ─▶ read client ─▶ ... ─▶ writes_done
//! backend→client:  read headers ─▶ send headers ─▶ read backend ─▶ write client ─▶ ...
//! ```
//! Both pumps start once the backend accepts the call and run concurrently.
//! Within a pump the next operation is issued only from the completion of the
//! previous one, which keeps per-direction order. A pump that ends or fails
//! hands over to Backend-Finish, which hands over to Client-Finish.
//!
//! # Termination
//! Three once-flags guard the half-close, the backend finish and the client
//! finish. Operations are issued under the state lock after checking that the
//! client has not been finished, and Client-Finish claims its flag under the
//! same lock, so nothing is issued on either call afterwards. Each completion
//! callback owns an `Arc` of the flow. Finishing the client cancels the flow
//! token, which drops every outstanding operation and releases the flow.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::grpc::call::{
    CallFuture, Metering, OnceFlag, ReadOutcome, ServerCall, UpstreamCall, UpstreamStub,
};
use crate::grpc::framing::GrpcMessage;
use crate::grpc::metadata::{self, BackendMetadata, ClientMetadata};
use crate::grpc::queue::{AsyncQueue, FlowGuard, FlowId};
use crate::grpc::status::Status;
use crate::observability::metrics::{self, Direction};

/// Lifecycle phase. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowPhase {
    Init,
    UpstreamCalling,
    Active,
    HalfClosed,
    Finishing,
    Done,
}

/// Mutable flow state shared by both pumps.
#[derive(Debug)]
struct FlowState {
    phase: FlowPhase,
    client_to_backend: Option<GrpcMessage>,
    backend_to_client: Option<GrpcMessage>,
    /// Status originated by the proxy. A non-OK value wins over the backend's.
    local_status: Status,
    backend_status: Option<Status>,
    backend_trailers: BackendMetadata,
    start_time: Option<Instant>,
}

impl FlowState {
    fn new() -> Self {
        Self {
            phase: FlowPhase::Init,
            client_to_backend: None,
            backend_to_client: None,
            local_status: Status::ok(),
            backend_status: None,
            backend_trailers: BackendMetadata::new(),
            start_time: None,
        }
    }

    fn advance(&mut self, phase: FlowPhase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    /// The first local error sticks.
    fn record_local_status(&mut self, status: Status) {
        if self.local_status.is_ok() && !status.is_ok() {
            self.local_status = status;
        }
    }

    /// Terminal status and client trailers for Client-Finish.
    fn resolve(&mut self) -> (Status, ClientMetadata) {
        if !self.local_status.is_ok() {
            return (self.local_status.clone(), ClientMetadata::new());
        }
        let status = self
            .backend_status
            .take()
            .unwrap_or_else(|| Status::unknown("upstream backend returned no status"));
        (status, metadata::upstream_to_downstream(&self.backend_trailers))
    }
}

/// One proxied call.
///
/// Created by [`ProxyFlow::start`] and otherwise driven entirely by
/// completions on the [`AsyncQueue`].
pub struct ProxyFlow<D, U> {
    queue: AsyncQueue,
    downstream: D,
    upstream: OnceLock<U>,
    metering: Arc<dyn Metering>,
    method: String,
    done: CancellationToken,
    writes_done_sent: OnceFlag,
    upstream_finish_started: OnceFlag,
    client_finish_sent: OnceFlag,
    state: Mutex<FlowState>,
    guard: FlowGuard,
}

impl<D: ServerCall, U: UpstreamCall> ProxyFlow<D, U> {
    /// Relay the client call `downstream` to `method` on the backend behind `stub`.
    pub fn start<S>(
        queue: &AsyncQueue,
        downstream: D,
        stub: &S,
        method: &str,
        headers: &ClientMetadata,
        metering: Arc<dyn Metering>,
    ) -> FlowId
    where
        S: UpstreamStub<Call = U>,
    {
        let backend_metadata = metadata::downstream_to_upstream(headers);
        let flow = Arc::new(Self {
            queue: queue.clone(),
            downstream,
            upstream: OnceLock::new(),
            metering,
            method: method.to_string(),
            done: CancellationToken::new(),
            writes_done_sent: OnceFlag::new(),
            upstream_finish_started: OnceFlag::new(),
            client_finish_sent: OnceFlag::new(),
            state: Mutex::new(FlowState::new()),
            guard: queue.flows().track(),
        });

        let id = flow.id();
        info!(flow_id = %id, method, "flow started");
        flow.metering.flow_started();

        flow.watch_client();
        flow.start_upstream_call(stub, backend_metadata);
        id
    }

    pub fn id(&self) -> FlowId {
        self.guard.id()
    }

    fn lock_state(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue an operation unless the client has been finished.
    ///
    /// `op` runs under the state lock and may decline by returning `None`.
    /// `tag` runs on a queue worker with the operation's output.
    fn issue<T, O, C>(self: &Arc<Self>, op: O, tag: C)
    where
        T: Send + 'static,
        O: FnOnce(&Self, &mut FlowState) -> Option<CallFuture<T>>,
        C: FnOnce(Arc<Self>, T) + Send + 'static,
    {
        let future = {
            let mut state = self.lock_state();
            if self.client_finish_sent.is_set() {
                return;
            }
            match op(self.as_ref(), &mut *state) {
                Some(future) => future,
                None => return,
            }
        };
        let flow = Arc::clone(self);
        self.queue
            .issue(&self.done, future, move |output| tag(flow, output));
    }

    fn watch_client(self: &Arc<Self>) {
        self.issue(
            |flow, _| Some(flow.downstream.closed()),
            |flow, ()| {
                debug!(flow_id = %flow.id(), "client went away");
                flow.on_client_gone(Status::cancelled("client disconnected"));
            },
        );
    }

    fn start_upstream_call<S>(self: &Arc<Self>, stub: &S, backend_metadata: BackendMetadata)
    where
        S: UpstreamStub<Call = U>,
    {
        self.issue(
            |flow, state| {
                state.start_time = Some(Instant::now());
                state.advance(FlowPhase::UpstreamCalling);
                Some(stub.call(&flow.method, backend_metadata))
            },
            |flow, result| match result {
                Ok(call) => flow.on_upstream_started(call),
                Err(status) => {
                    warn!(
                        flow_id = %flow.id(),
                        method = %flow.method,
                        error = %status,
                        "upstream call failed to start"
                    );
                    flow.start_client_finish(Status::unavailable("upstream backend unavailable"));
                }
            },
        );
    }

    fn on_upstream_started(self: &Arc<Self>, call: U) {
        {
            let mut state = self.lock_state();
            if self.client_finish_sent.is_set() {
                drop(state);
                call.try_cancel();
                return;
            }
            if let Err(call) = self.upstream.set(call) {
                call.try_cancel();
                return;
            }
            state.advance(FlowPhase::Active);
        }
        debug!(flow_id = %self.id(), "upstream call accepted");

        self.read_upstream_initial_metadata();
        self.read_client_message();
    }

    /// The client stream failed or the client disconnected.
    fn on_client_gone(self: &Arc<Self>, status: Status) {
        self.lock_state().record_local_status(status.clone());

        match self.upstream.get() {
            Some(upstream) => {
                upstream.try_cancel();
                self.start_upstream_finish();
            }
            None => self.start_client_finish(status),
        }
    }

    // Client → backend pump.

    fn read_client_message(self: &Arc<Self>) {
        self.issue(
            |flow, _| Some(flow.downstream.read()),
            |flow, outcome| match outcome {
                ReadOutcome::Message(message) => {
                    flow.lock_state().client_to_backend = Some(message);
                    flow.write_upstream_message();
                }
                ReadOutcome::EndOfStream => flow.send_upstream_writes_done(),
                ReadOutcome::Failed(status) => {
                    debug!(flow_id = %flow.id(), error = %status, "client read failed");
                    let status = if status.is_ok() {
                        Status::cancelled("client stream failed")
                    } else {
                        status
                    };
                    flow.on_client_gone(status);
                }
            },
        );
    }

    fn write_upstream_message(self: &Arc<Self>) {
        self.issue(
            |flow, state| {
                let upstream = flow.upstream.get()?;
                let message = state.client_to_backend.clone()?;
                metrics::record_message(Direction::ClientToBackend, &message);
                Some(upstream.write(message))
            },
            |flow, written| {
                flow.lock_state().client_to_backend = None;
                if written {
                    flow.read_client_message();
                } else {
                    debug!(flow_id = %flow.id(), "upstream write failed");
                    flow.start_upstream_finish();
                }
            },
        );
    }

    fn send_upstream_writes_done(self: &Arc<Self>) {
        self.issue(
            |flow, state| {
                let upstream = flow.upstream.get()?;
                if !flow.writes_done_sent.claim() {
                    return None;
                }
                state.advance(FlowPhase::HalfClosed);
                Some(upstream.writes_done())
            },
            |flow, sent| {
                if !sent {
                    debug!(flow_id = %flow.id(), "upstream half-close failed");
                    flow.start_upstream_finish();
                }
            },
        );
    }

    // Backend → client pump.

    fn read_upstream_initial_metadata(self: &Arc<Self>) {
        self.issue(
            |flow, _| Some(flow.upstream.get()?.read_initial_metadata()),
            |flow, received| match received {
                Some(backend_metadata) => flow.send_client_initial_metadata(backend_metadata),
                None => flow.start_client_finish(Status::unknown(
                    "upstream backend failed to send metadata",
                )),
            },
        );
    }

    fn send_client_initial_metadata(self: &Arc<Self>, backend_metadata: BackendMetadata) {
        let headers = metadata::upstream_to_downstream(&backend_metadata);
        self.issue(
            |flow, _| Some(flow.downstream.send_initial_metadata(headers)),
            |flow, sent| {
                if sent {
                    flow.read_upstream_message();
                } else {
                    flow.start_client_finish(Status::unknown("failed to send initial metadata"));
                }
            },
        );
    }

    fn read_upstream_message(self: &Arc<Self>) {
        self.issue(
            |flow, _| Some(flow.upstream.get()?.read()),
            |flow, received| match received {
                Some(message) => {
                    flow.lock_state().backend_to_client = Some(message);
                    flow.write_client_message();
                }
                None => flow.start_upstream_finish(),
            },
        );
    }

    fn write_client_message(self: &Arc<Self>) {
        self.issue(
            |flow, state| {
                let message = state.backend_to_client.clone()?;
                metrics::record_message(Direction::BackendToClient, &message);
                Some(flow.downstream.write(message))
            },
            |flow, written| {
                flow.lock_state().backend_to_client = None;
                if written {
                    flow.read_upstream_message();
                } else {
                    flow.start_client_finish(Status::unknown(
                        "failed to send a message to the downstream client",
                    ));
                }
            },
        );
    }

    // Termination.

    fn start_upstream_finish(self: &Arc<Self>) {
        self.issue(
            |flow, state| {
                let upstream = flow.upstream.get()?;
                if !flow.upstream_finish_started.claim() {
                    return None;
                }
                state.advance(FlowPhase::Finishing);
                Some(upstream.finish())
            },
            |flow, (status, trailers)| {
                {
                    let mut state = flow.lock_state();
                    state.backend_status = Some(status);
                    state.backend_trailers = trailers;
                }
                flow.start_client_finish(Status::ok());
            },
        );
    }

    fn start_client_finish(self: &Arc<Self>, status: Status) {
        let (resolved, trailers, elapsed) = {
            let mut state = self.lock_state();
            if !self.client_finish_sent.claim() {
                return;
            }
            state.record_local_status(status);
            state.advance(FlowPhase::Done);
            let (resolved, trailers) = state.resolve();
            let elapsed = state.start_time.map(|t| t.elapsed()).unwrap_or_default();
            (resolved, trailers, elapsed)
        };

        if !self.upstream_finish_started.is_set() {
            if let Some(upstream) = self.upstream.get() {
                upstream.try_cancel();
            }
        }

        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.metering.record_backend_time(elapsed_ms);
        self.metering.flow_finished(resolved.code());
        info!(
            flow_id = %self.id(),
            method = %self.method,
            code = %resolved.code(),
            elapsed_ms,
            "flow finished"
        );

        self.downstream.finish(resolved, trailers);
        self.done.cancel();
    }
}
