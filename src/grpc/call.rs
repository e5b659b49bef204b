//! Contracts between the proxy flow and the two calls it joins.
//!
//! # Design Decisions
//! - Every operation returns immediately with a boxed future; the flow hands
//!   that future to the [`AsyncQueue`](crate::grpc::queue::AsyncQueue), which
//!   runs it and delivers the result to a completion callback.
//! - Futures are `'static` so they can outlive the borrow of the call that
//!   produced them. Implementations keep their state behind an `Arc`.
//! - Operations issued on the same call complete in issue order. The flow
//!   never has two reads, or two writes, in flight on one call.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::grpc::framing::GrpcMessage;
use crate::grpc::metadata::{BackendMetadata, ClientMetadata};
use crate::grpc::status::{Code, Status};

/// Future returned by every call operation.
pub type CallFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Result of reading from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Message(GrpcMessage),
    /// The client half-closed its stream.
    EndOfStream,
    /// The client stream failed or was reset.
    Failed(Status),
}

/// Client-facing half of a proxied call.
///
/// `finish` doubles as the write-side half-close: it ends the response
/// stream with the terminal status and trailers.
pub trait ServerCall: Send + Sync + 'static {
    /// Send response headers. Resolves `false` if they could not be sent.
    fn send_initial_metadata(&self, metadata: ClientMetadata) -> CallFuture<bool>;

    fn read(&self) -> CallFuture<ReadOutcome>;

    fn write(&self, message: GrpcMessage) -> CallFuture<bool>;

    /// End the call. Called at most once by the flow.
    fn finish(&self, status: Status, trailers: ClientMetadata);

    /// Resolves when the client goes away before the call is finished.
    fn closed(&self) -> CallFuture<()>;
}

/// Factory for backend calls on one backend channel.
pub trait UpstreamStub: Send + Sync + 'static {
    type Call: UpstreamCall;

    /// Start a call to `method`. Fails when the backend cannot be reached.
    fn call(&self, method: &str, metadata: BackendMetadata) -> CallFuture<Result<Self::Call, Status>>;
}

/// Backend-facing half of a proxied call.
pub trait UpstreamCall: Send + Sync + 'static {
    /// Response headers from the backend, `None` if they never arrived.
    fn read_initial_metadata(&self) -> CallFuture<Option<BackendMetadata>>;

    /// Next backend message, `None` at end of stream or on failure.
    fn read(&self) -> CallFuture<Option<GrpcMessage>>;

    fn write(&self, message: GrpcMessage) -> CallFuture<bool>;

    /// Half-close the request stream.
    fn writes_done(&self) -> CallFuture<bool>;

    /// Terminal status and trailers of the backend call.
    fn finish(&self) -> CallFuture<(Status, BackendMetadata)>;

    /// Propagate cancellation to the backend. Pending operations resolve as failures.
    fn try_cancel(&self);
}

/// Consumer of per-flow measurements.
pub trait Metering: Send + Sync + 'static {
    fn record_backend_time(&self, backend_elapsed_ms: u64);

    fn flow_started(&self) {}

    fn flow_finished(&self, _code: Code) {}
}

/// Metering that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetering;

impl Metering for NoopMetering {
    fn record_backend_time(&self, _backend_elapsed_ms: u64) {}
}

/// Single-assignment flag for at-most-once transitions.
///
/// [`OnceFlag::claim`] returns `true` for exactly one caller, however many
/// race for it.
#[derive(Debug, Default)]
pub struct OnceFlag(AtomicBool);

impl OnceFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Set the flag. Returns `true` only for the caller that set it.
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
