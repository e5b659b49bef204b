use axum::{extract::State, Json};
use serde::Serialize;

use crate::grpc::stub_map::ChannelSummary;
use crate::http::server::AppState;
use crate::routing::router::RouteSummary;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub live_flows: u64,
    pub flows_started: u64,
    pub pending_operations: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let flows = state.queue().flows();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime().as_secs(),
        live_flows: flows.live_count(),
        flows_started: flows.started_count(),
        pending_operations: state.queue().pending(),
    })
}

pub async fn get_backends(State(state): State<AppState>) -> Json<Vec<ChannelSummary>> {
    Json(state.stubs().snapshot())
}

pub async fn get_routes(State(state): State<AppState>) -> Json<Vec<RouteSummary>> {
    Json(state.routes().routes())
}
