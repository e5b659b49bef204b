//! Request admission.
//!
//! # Responsibilities
//! - Accept only HTTP/2 requests carrying a gRPC content type
//! - Extract the routing inputs (authority and method path)
//! - Carry the request ID into log fields

use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderMap, Request, StatusCode, Version};

use crate::routing::CallInfo;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Why a request was turned away before a flow started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotHttp2,
    NotGrpc,
}

impl Rejection {
    pub fn status_code(self) -> StatusCode {
        match self {
            Rejection::NotHttp2 => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            Rejection::NotGrpc => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Rejection::NotHttp2 => "gRPC requires HTTP/2",
            Rejection::NotGrpc => "content-type must be application/grpc",
        }
    }

    /// Label used on the rejection counter.
    pub fn reason(self) -> &'static str {
        match self {
            Rejection::NotHttp2 => "not_http2",
            Rejection::NotGrpc => "not_grpc",
        }
    }
}

/// `application/grpc` or `application/grpc+proto`, parameters ignored.
pub fn is_grpc_content_type(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let essence = value.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("application/grpc")
        || essence.eq_ignore_ascii_case("application/grpc+proto")
}

/// Check that a request can be proxied as a gRPC call.
pub fn admit<B>(request: &Request<B>) -> Result<(), Rejection> {
    if request.version() != Version::HTTP_2 {
        return Err(Rejection::NotHttp2);
    }
    if !is_grpc_content_type(request.headers()) {
        return Err(Rejection::NotGrpc);
    }
    Ok(())
}

/// Routing inputs of a request. The authority comes from the URI, else `Host`.
pub fn call_info<B>(request: &Request<B>) -> CallInfo<'_> {
    let host = request
        .uri()
        .authority()
        .map(|authority| authority.as_str())
        .or_else(|| request.headers().get(HOST).and_then(|v| v.to_str().ok()));
    CallInfo {
        host,
        method: request.uri().path(),
    }
}

pub fn request_id(headers: &HeaderMap) -> &str {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
}
