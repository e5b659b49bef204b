//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (HTTP/2 prior knowledge)
//!     → server.rs (axum setup, request id, tracing)
//!     → request.rs (admit gRPC calls, extract authority and method)
//!     → routing resolves the backend
//!     → grpc::flow relays the call
//!     → response.rs (response heads, trailers-only errors)
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::X_REQUEST_ID;
pub use server::{AppState, GatewayState, HttpServer, ServerError};
