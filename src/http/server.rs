//! gRPC listener.
//!
//! # Responsibilities
//! - Create the axum router with one catch-all gRPC handler
//! - Wire up middleware (request id, tracing)
//! - Admit requests, resolve their backend, start a proxy flow
//! - Serve HTTP/2 (prior knowledge) until shutdown
//!
//! # Design Decisions
//! - The handler returns as soon as the flow has decided the response
//!   head; the flow keeps streaming the body on the queue
//! - The route table sits behind `ArcSwap` so reloads never block calls

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::routing::any;
use http::Request;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::grpc::metadata::ClientMetadata;
use crate::grpc::status::Status;
use crate::grpc::upstream::{ChannelSettings, HyperUpstreamCall};
use crate::grpc::{AsyncQueue, HyperServerCall, ProxyFlow, StubMap};
use crate::http::request;
use crate::http::response::{http_error, trailers_only};
use crate::observability::metrics::{self, RouteMeter};
use crate::routing::Router as RouteTable;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state behind every handler.
pub struct GatewayState {
    routes: ArcSwap<RouteTable>,
    stubs: StubMap,
    queue: AsyncQueue,
    max_message_len: usize,
    stream_buffer: usize,
    started_at: Instant,
}

pub type AppState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(config: &GatewayConfig, queue: AsyncQueue) -> Self {
        Self {
            routes: ArcSwap::from_pointee(RouteTable::from_config(&config.routes, &config.grpc)),
            stubs: StubMap::new(ChannelSettings::from(&config.grpc)),
            queue,
            max_message_len: config.grpc.max_message_bytes,
            stream_buffer: config.grpc.stream_buffer.max(1),
            started_at: Instant::now(),
        }
    }

    /// Swap in the route table of `config`. Calls already proxied keep their backend.
    pub fn reload_routes(&self, config: &GatewayConfig) {
        let table = RouteTable::from_config(&config.routes, &config.grpc);
        tracing::info!(routes = config.routes.len(), "route table reloaded");
        self.routes.store(Arc::new(table));
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    pub fn stubs(&self) -> &StubMap {
        &self.stubs
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// HTTP/2 server that proxies gRPC calls.
pub struct HttpServer {
    router: axum::Router,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            router: Self::build_router(state),
        }
    }

    /// Build the axum router with all middleware layers.
    fn build_router(state: AppState) -> axum::Router {
        axum::Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_grpc())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    /// Serve on `listener` until `shutdown` fires and open calls drain.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "gRPC server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .into_future()
            .await?;

        tracing::info!("gRPC server stopped");
        Ok(())
    }
}

/// Bind `address`, mapping failures to [`ServerError::Bind`].
pub async fn bind(address: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.to_string(),
            source,
        })
}

/// Admit the call, resolve its backend and start a flow.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    if let Err(rejection) = request::admit(&request) {
        tracing::debug!(
            path = %request.uri().path(),
            version = ?request.version(),
            reason = rejection.reason(),
            "rejecting non-gRPC request"
        );
        metrics::record_rejected(rejection.reason());
        return http_error(rejection.status_code(), rejection.message());
    }

    let request_id = request::request_id(request.headers()).to_string();
    let target = state.routes.load().resolve(&request::call_info(&request));
    let Some(target) = target else {
        let method = request.uri().path();
        tracing::warn!(request_id = %request_id, method, "no backend configured");
        metrics::record_rejected("no_backend");
        return trailers_only(
            &Status::unimplemented(format!("no backend configured for {method}")),
            &ClientMetadata::new(),
        );
    };

    let (parts, body) = request.into_parts();
    let headers = ClientMetadata::from_header_map(&parts.headers);
    let (call, pending) = HyperServerCall::new(body, state.max_message_len, state.stream_buffer);
    let stub = state.stubs.get_stub(&target.address);

    let flow_id = ProxyFlow::<HyperServerCall, HyperUpstreamCall>::start(
        &state.queue,
        call,
        &stub,
        &target.method,
        &headers,
        Arc::new(RouteMeter::new(target.metric_label())),
    );
    tracing::debug!(
        request_id = %request_id,
        flow_id = %flow_id,
        backend = %target.address,
        route = target.route.as_deref().unwrap_or("-"),
        "call dispatched"
    );

    pending.into_response().await
}
