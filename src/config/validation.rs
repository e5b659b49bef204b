//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses (listeners are socket addresses, backends are host:port)
//! - Validate value ranges (limits > 0)
//! - Detect duplicate route names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;

use http::uri::Authority;
use thiserror::Error;

use crate::config::schema::GatewayConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field}: '{value}' is not a socket address")]
    InvalidSocketAddress { field: &'static str, value: String },

    #[error("{field}: '{value}' is not a host:port backend address")]
    InvalidBackendAddress { field: String, value: String },

    #[error("routes: a route has an empty name")]
    EmptyRouteName,

    #[error("routes: duplicate route name '{0}'")]
    DuplicateRoute(String),

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("admin.api_key must be set when the admin API is enabled")]
    MissingAdminKey,
}

/// Check a `host:port` backend address.
pub fn is_backend_address(value: &str) -> bool {
    Authority::from_str(value)
        .map(|authority| authority.port_u16().is_some() && !authority.host().is_empty())
        .unwrap_or(false)
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_socket_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_socket_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }
    if config.admin.enabled {
        check_socket_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::MissingAdminKey);
        }
    }

    let grpc = &config.grpc;
    for (field, value) in [
        ("grpc.backend_address_override", &grpc.backend_address_override),
        ("grpc.backend_address_fallback", &grpc.backend_address_fallback),
    ] {
        if let Some(address) = value {
            check_backend_address(&mut errors, field.to_string(), address);
        }
    }
    if grpc.max_message_bytes == 0 {
        errors.push(ValidationError::ZeroLimit("grpc.max_message_bytes"));
    }
    if grpc.stream_buffer == 0 {
        errors.push(ValidationError::ZeroLimit("grpc.stream_buffer"));
    }
    if grpc.connect_timeout_ms == 0 {
        errors.push(ValidationError::ZeroLimit("grpc.connect_timeout_ms"));
    }

    let mut names = HashSet::new();
    for route in &config.routes {
        if route.name.is_empty() {
            errors.push(ValidationError::EmptyRouteName);
        } else if !names.insert(route.name.as_str()) {
            errors.push(ValidationError::DuplicateRoute(route.name.clone()));
        }
        check_backend_address(&mut errors, format!("routes.{}.backend", route.name), &route.backend);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_socket_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidSocketAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn check_backend_address(errors: &mut Vec<ValidationError>, field: String, value: &str) {
    if !is_backend_address(value) {
        errors.push(ValidationError::InvalidBackendAddress {
            field,
            value: value.to_string(),
        });
    }
}
