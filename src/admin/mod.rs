//! Operator API on a separate listener.
//!
//! Every route requires `Authorization: Bearer <api_key>`.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};

use self::auth::{admin_auth_middleware, ApiKey};
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState, api_key: &str) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/backends", get(get_backends))
        .route("/admin/routes", get(get_routes))
        .route_layer(middleware::from_fn_with_state(
            ApiKey::new(api_key),
            admin_auth_middleware,
        ))
        .with_state(state)
}
