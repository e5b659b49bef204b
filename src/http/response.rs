//! gRPC response construction.
//!
//! # Responsibilities
//! - Build response heads carrying `content-type: application/grpc`
//! - Build trailers-only responses for calls that end before any headers
//! - Answer non-gRPC requests with plain HTTP errors

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};

use crate::grpc::metadata::ClientMetadata;
use crate::grpc::status::Status;

pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Header advertising accepted message encodings. Only `identity` is offered.
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";

/// Start a `200 OK` gRPC response with `metadata` as response headers.
pub fn grpc_response(body: Body, metadata: &ClientMetadata) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    headers.insert(GRPC_ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    metadata.extend_header_map(headers);
    response
}

/// A response whose only header block carries the status and trailers.
pub fn trailers_only(status: &Status, trailers: &ClientMetadata) -> Response {
    let mut response = grpc_response(Body::empty(), trailers);
    status.write_headers(response.headers_mut());
    response
}

/// Plain HTTP rejection for requests that are not gRPC calls.
pub fn http_error(status: StatusCode, message: &'static str) -> Response {
    (status, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::status::{GRPC_MESSAGE, GRPC_STATUS};

    #[test]
    fn trailers_only_carries_status_and_metadata() {
        let trailers: ClientMetadata = [("x-reason", "quota".to_string())].into_iter().collect();
        let response = trailers_only(&Status::unimplemented("no backend configured for /a.B/C"), &trailers);

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), GRPC_CONTENT_TYPE);
        assert_eq!(headers.get(GRPC_STATUS).unwrap(), "12");
        assert_eq!(headers.get(GRPC_MESSAGE).unwrap(), "no backend configured for /a.B/C");
        assert_eq!(headers.get("x-reason").unwrap(), "quota");
    }

    #[test]
    fn ok_status_has_no_message_header() {
        let response = trailers_only(&Status::ok(), &ClientMetadata::new());
        assert_eq!(response.headers().get(GRPC_STATUS).unwrap(), "0");
        assert!(response.headers().get(GRPC_MESSAGE).is_none());
    }

    #[test]
    fn advertises_identity_encoding_only() {
        let response = grpc_response(Body::empty(), &ClientMetadata::new());
        assert_eq!(response.headers().get(GRPC_ACCEPT_ENCODING).unwrap(), "identity");
        assert_eq!(response.headers().get_all(GRPC_ACCEPT_ENCODING).iter().count(), 1);
    }
}
