//! HTTP status service using Axum.

pub mod facade;
pub mod routes;

use anyhow::{Result, Context};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::storage::schedules::ScheduleStore;
use crate::utils::metrics::MetricsCollector;

pub use facade::StatusFacade;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub facade: StatusFacade,
    pub store: Arc<dyn ScheduleStore>,
    pub metrics: MetricsCollector,
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health_check))
        .route("/metrics", get(routes::metrics))
        .route("/status", get(routes::job_status))
        .route("/keyword-status", get(routes::keyword_status))
        .route("/schedule/create", post(routes::create_schedule))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` flips or its sender goes away.
pub async fn serve(state: AppState, bind: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("Failed to bind {}", bind))?;

    info!("Status service listening on {}", bind);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Status service failed")?;

    info!("Status service stopped");
    Ok(())
}
