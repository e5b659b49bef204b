//! Metrics collection and exposition.
//!
//! # Metrics
//! - `grpc_gateway_flows_started_total` (counter): flows created, by route
//! - `grpc_gateway_flows_finished_total` (counter): flows finished, by route and code
//! - `grpc_gateway_backend_latency_ms` (histogram): backend time per flow, by route
//! - `grpc_gateway_messages_total` (counter): relayed messages, by direction
//! - `grpc_gateway_message_bytes_total` (counter): relayed payload bytes, by direction
//! - `grpc_gateway_pending_operations` (gauge): operations in the execution queue
//! - `grpc_gateway_rejected_requests_total` (counter): calls refused before a flow, by reason
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until an
//!   exporter is installed, so tests never need one
//! - Per-flow series are labelled by route name, or `override`/`fallback`
//!   when no route matched. The method path is client-controlled and never
//!   becomes a label

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::grpc::call::Metering;
use crate::grpc::framing::GrpcMessage;
use crate::grpc::status::Code;

/// Direction of a relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        }
    }
}

/// Install the Prometheus exporter with an HTTP scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_message(direction: Direction, message: &GrpcMessage) {
    metrics::counter!("grpc_gateway_messages_total", "direction" => direction.as_str())
        .increment(1);
    metrics::counter!("grpc_gateway_message_bytes_total", "direction" => direction.as_str())
        .increment(message.payload().len() as u64);
}

pub fn record_rejected(reason: &'static str) {
    metrics::counter!("grpc_gateway_rejected_requests_total", "reason" => reason).increment(1);
}

/// Per-flow metering for calls resolved through one route.
#[derive(Debug, Clone)]
pub struct RouteMeter {
    route: String,
}

impl RouteMeter {
    /// `route` must come from configuration, not from the request.
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }
}

impl Metering for RouteMeter {
    fn record_backend_time(&self, backend_elapsed_ms: u64) {
        metrics::histogram!("grpc_gateway_backend_latency_ms", "route" => self.route.clone())
            .record(backend_elapsed_ms as f64);
    }

    fn flow_started(&self) {
        metrics::counter!("grpc_gateway_flows_started_total", "route" => self.route.clone())
            .increment(1);
    }

    fn flow_finished(&self, code: Code) {
        metrics::counter!(
            "grpc_gateway_flows_finished_total",
            "route" => self.route.clone(),
            "code" => code.as_str()
        )
        .increment(1);
    }
}
