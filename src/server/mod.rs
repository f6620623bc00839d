//! HTTP surface of the scanserve service
//!
//! - `GET /health`
//! - `POST /predict`
//! - `POST /feedback`, `GET /feedback/:prediction_id`
//! - `GET /model`, `POST /model/rollback`, `POST /evaluate`

use anyhow::Result;
use axum::{extract::DefaultBodyLimit, extract::State, response::IntoResponse, routing::get, Json, Router};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::ApiError;
use state::ServerState;

/// Create the main application router
pub fn create_app(state: ServerState) -> Router {
    let timeout_duration = Duration::from_secs(state.config.request_timeout_secs);
    let body_limit = state.config.body_limit_bytes;
    let cors = middleware::cors_layer(&state.config.cors_origins);

    let mut app = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .merge(routes::predict::create_router())
        .merge(routes::feedback::create_router())
        .merge(routes::model::create_router())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(timeout_duration))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    app
}

/// Health check endpoint
async fn health_check(State(state): State<ServerState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "scanserve",
        "version": env!("CARGO_PKG_VERSION"),
        "model_version": state.manager.current_version(),
    }))
}

/// Serve until ctrl-c or SIGTERM
pub async fn start_server(addr: SocketAddr, state: ServerState) -> Result<()> {
    let app = create_app(state);

    info!("Starting scanserve on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}
