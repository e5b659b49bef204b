use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Bearer token expected on admin requests.
#[derive(Clone)]
pub struct ApiKey(Arc<str>);

impl ApiKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    fn accepts(&self, header: Option<&str>) -> bool {
        !self.0.is_empty()
            && header
                .and_then(|value| value.strip_prefix("Bearer "))
                .is_some_and(|token| token == &*self.0)
    }
}

pub async fn admin_auth_middleware(
    State(key): State<ApiKey>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if key.accepts(auth_header) {
        return Ok(next.run(request).await);
    }

    tracing::debug!(path = %request.uri().path(), "admin request rejected");
    Err(StatusCode::UNAUTHORIZED)
}
