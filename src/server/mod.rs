//! HTTP facade over the dispatcher.
//!
//! Every route answers 200 with `{"status": "success", ...}` or
//! `{"status": "error", "message": ...}`; callers inspect `status`.

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::dispatcher::Dispatcher;

pub mod routes;

/// Server state
pub struct AppState {
    pub dispatcher: Dispatcher,
}

pub async fn start_server(port: u16, dispatcher: Dispatcher) -> anyhow::Result<()> {
    let state = Arc::new(AppState { dispatcher });

    let app = Router::new()
        .route("/connect", post(routes::connect))
        .route("/store", post(routes::store))
        .route("/bulk_store", post(routes::bulk_store))
        .route("/retrieve", post(routes::retrieve))
        .route("/models", get(routes::models))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.dispatcher.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
