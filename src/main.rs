//! gRPC gateway.
//!
//! Accepts bidirectional-streaming gRPC calls over HTTP/2 and relays each one
//! to the backend chosen by the route table.
//!
//! # Architecture Overview
//!
//! ```text
//!     client call ──▶ http::server ──▶ routing ──▶ grpc::stub_map
//!                          │                           │
//!                          ▼                           ▼
//!                   HyperServerCall ◀── ProxyFlow ──▶ HyperUpstreamCall ──▶ backend
//!                                          │
//!                                     AsyncQueue (Tokio workers)
//!
//!     cross-cutting: config (+ watcher), observability, admin, lifecycle
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rpc_gateway::admin::setup_admin_router;
use rpc_gateway::config::validation::validate_config;
use rpc_gateway::config::watcher::ConfigWatcher;
use rpc_gateway::config::{load_config, ConfigError, GatewayConfig};
use rpc_gateway::grpc::AsyncQueue;
use rpc_gateway::http::server::bind;
use rpc_gateway::http::{GatewayState, HttpServer};
use rpc_gateway::lifecycle::signals::spawn_signal_handler;
use rpc_gateway::lifecycle::{Shutdown, DRAIN_TIMEOUT};
use rpc_gateway::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "rpc-gateway")]
#[command(about = "Bidirectional-streaming gRPC gateway", long_about = None)]
struct Args {
    /// TOML configuration file. Routes are reloaded when it changes.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listener address, overriding the configuration.
    #[arg(short, long)]
    bind: Option<String>,

    /// Send every call to this backend.
    #[arg(long)]
    backend: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.listener.bind_address = bind.clone();
    }
    if let Some(backend) = &args.backend {
        config.grpc.backend_address_override = Some(backend.clone());
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all().thread_name("rpc-gateway-worker");
    if config.queue.worker_threads > 0 {
        runtime.worker_threads(config.queue.worker_threads);
    }
    let runtime = runtime.build()?;

    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rpc-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        backend_override = config.grpc.backend_address_override.as_deref().unwrap_or("-"),
        backend_fallback = config.grpc.backend_address_fallback.as_deref().unwrap_or("-"),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let state = Arc::new(GatewayState::new(&config, AsyncQueue::current()));
    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    // Route hot reload. The watcher handle must outlive the server.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let handle = watcher.run()?;
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Some(updated) = updates.recv().await {
                    state.reload_routes(&updated);
                }
            });
            Some(handle)
        }
        None => None,
    };

    if config.admin.enabled {
        let listener = bind(&config.admin.bind_address).await?;
        let app = setup_admin_router(Arc::clone(&state), &config.admin.api_key);
        let token = shutdown.token();
        tracing::info!(address = %config.admin.bind_address, "admin API starting");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "admin API failed");
            }
        });
    }

    let listener = bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(Arc::clone(&state));
    let mut serving = tokio::spawn(server.run(listener, shutdown.token()));

    tokio::select! {
        result = &mut serving => result??,
        _ = shutdown.wait() => {
            tracing::info!(
                live_flows = state.queue().flows().live_count(),
                "draining open calls"
            );
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut serving).await {
                Ok(result) => result??,
                Err(_) => tracing::warn!(
                    live_flows = state.queue().flows().live_count(),
                    "drain timeout elapsed, dropping open calls"
                ),
            }
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
