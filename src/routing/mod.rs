//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming call (authority, method path)
//!     → router.rs (override / route lookup / fallback)
//!     → matcher.rs (evaluate match conditions)
//!     → Return: BackendTarget or no match
//!
//! Route Compilation (at startup and on reload):
//!     RouteConfig[]
//!     → Sort by priority
//!     → Compile matchers
//!     → Freeze as immutable Router
//! ```
//!
//! # Design Decisions
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route
//! - First match wins (ordered by priority)

pub mod matcher;
pub mod router;

pub use matcher::CallInfo;
pub use router::{BackendTarget, Router, TargetSource};
