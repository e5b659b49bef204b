//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     token fired → servers stop accepting → open calls drain → exit
//! ```
//!
//! # Design Decisions
//! - One `CancellationToken` shared by the gRPC and admin servers
//! - Draining is bounded by `DRAIN_TIMEOUT`; calls still open after it are dropped

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, DRAIN_TIMEOUT};
