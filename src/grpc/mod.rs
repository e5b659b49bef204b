//! gRPC streaming proxy core.
//!
//! # Data Flow
//! ```text
//! client ──HyperServerCall──▶ ProxyFlow ──HyperUpstreamCall──▶ backend
//!                               │
//!                      AsyncQueue runs every operation
//! ```
//!
//! `call` defines the contracts the flow drives. `server_call` and
//! `upstream` implement them over hyper; tests substitute in-memory calls.

pub mod call;
pub mod flow;
pub mod framing;
pub mod metadata;
pub mod queue;
pub mod server_call;
pub mod status;
pub mod stub_map;
pub mod upstream;

pub use call::{Metering, NoopMetering, ReadOutcome, ServerCall, UpstreamCall, UpstreamStub};
pub use flow::ProxyFlow;
pub use framing::GrpcMessage;
pub use metadata::{BackendMetadata, ClientMetadata, MetadataValue};
pub use queue::{AsyncQueue, FlowId};
pub use server_call::{HyperServerCall, PendingResponse};
pub use status::{Code, Status};
pub use stub_map::StubMap;
pub use upstream::{ChannelSettings, GrpcChannel, HyperUpstreamCall};
