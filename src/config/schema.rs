//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Backend resolution and transport limits.
    pub grpc: GrpcConfig,

    /// Route definitions mapping calls to backends.
    pub routes: Vec<RouteConfig>,

    /// Async execution queue sizing.
    pub queue: QueueConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// gRPC proxying settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GrpcConfig {
    /// Send every call to this backend, ignoring routes.
    pub backend_address_override: Option<String>,

    /// Backend for calls that match no route.
    pub backend_address_fallback: Option<String>,

    /// Largest message accepted in either direction.
    pub max_message_bytes: usize,

    /// Messages buffered per direction inside the transports.
    pub stream_buffer: usize,

    /// Backend connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            backend_address_override: None,
            backend_address_fallback: None,
            max_message_bytes: 4 * 1024 * 1024,
            stream_buffer: 8,
            connect_timeout_ms: 5_000,
        }
    }
}

/// Route configuration mapping calls to a backend address.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host (authority) to match, exact and case-insensitive.
    pub host: Option<String>,

    /// gRPC method path prefix to match (e.g. "/echo.Echo/").
    pub method_prefix: Option<String>,

    /// Backend address (e.g., "127.0.0.1:50051").
    pub backend: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Async execution queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker threads serving the queue. 0 means one per CPU core.
    pub worker_threads: usize,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter directive used when `RUST_LOG` is unset.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Scrape endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "rpc_gateway=info,tower_http=info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,

    /// Bind address for the admin listener.
    pub bind_address: String,

    /// Bearer token required on every admin request.
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:8081".to_string(),
            api_key: String::new(),
        }
    }
}
