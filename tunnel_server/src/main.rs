//! Public edge server for the reverse HTTP/WebSocket tunneling service.
//!
//! Accepts client control connections on `/ws`, registers a subdomain per
//! tunnel, and forwards external HTTP/WebSocket traffic on
//! `*.tunnel-domain` to the owning client.

mod allocator;
mod config;
mod control;
mod forwarder;
mod ingress;
mod pending;
mod registry;
mod wsproxy;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use registry::Registry;

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tunnel_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(host = %config.host, port = config.port, "starting tunnel server");
    tracing::info!(tunnel_domain = %config.tunnel_domain, "serving tunnels under this domain");

    let state = AppState {
        config: Arc::new(config.clone()),
        registry: Arc::new(Registry::new()),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(control::control_handler))
        .fallback(ingress::handle_ingress)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_registry = state.registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, closing tunnels");
            shutdown_registry.shutdown();
        })
        .await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, format!("tunnels: {}", state.registry.size()))
}
