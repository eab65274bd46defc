//! Signaling relay: tracks which identities are online and forwards call
//! negotiation envelopes between their channels without reading them.

pub mod cli;
pub mod config;
pub mod directory;
pub mod handlers;
pub mod registry;
pub mod relay;
pub mod websocket;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::directory::{Directory, OpenDirectory, StaticDirectory};
use crate::handlers::{health_check, presence};
use crate::relay::RelayState;
use crate::websocket::websocket_handler;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/presence", get(presence))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Picks the directory implementation the config asks for.
pub async fn build_directory(config: &Config) -> anyhow::Result<Arc<dyn Directory>> {
    Ok(match &config.directory_file {
        Some(path) => {
            let directory = StaticDirectory::from_file(path).await?;
            tracing::info!(path = %path.display(), entries = directory.len(), "loaded directory");
            Arc::new(directory)
        }
        None => Arc::new(OpenDirectory),
    })
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
