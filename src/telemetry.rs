//! Metrics and health endpoints
//!
//! Serves `GET /metrics` in the Prometheus text format and `GET /health`
//! as JSON. The server stops when the supplied token is cancelled.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{database::Database, metrics::WorkerMetrics};

/// State shared by the telemetry handlers
#[derive(Clone)]
pub struct TelemetryState {
    pub metrics: WorkerMetrics,
    pub database: Option<Database>,
    pub expected_workers: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    workers_running: i64,
    expected_workers: usize,
    database: bool,
}

pub fn router(state: TelemetryState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `address` and serves until `shutdown` is cancelled
pub async fn serve(
    address: &str,
    state: TelemetryState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!("Telemetry server listening on {}", address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Telemetry server stopped");
    Ok(())
}

async fn health_check(
    State(state): State<TelemetryState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match &state.database {
        Some(db) => db.health_check().await.is_ok(),
        None => true,
    };
    let workers_running = state.metrics.workers_running();
    let healthy = database && workers_running == state.expected_workers as i64;

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        version: crate::VERSION,
        timestamp: chrono::Utc::now(),
        workers_running,
        expected_workers: state.expected_workers,
        database,
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

async fn get_metrics(State(state): State<TelemetryState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
