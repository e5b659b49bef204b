//! gRPC gateway library.
//!
//! Proxies bidirectional-streaming gRPC calls from clients to backend
//! services over HTTP/2, one [`grpc::ProxyFlow`] per call.

pub mod admin;
pub mod config;
pub mod grpc;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod routing;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
