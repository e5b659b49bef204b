//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! flows, server, config reload
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms, backend latency metering)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID is relayed to the backend with the rest of the metadata
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
