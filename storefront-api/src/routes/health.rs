/// Health check endpoint
///
/// Verifies that the server is running and that the database pool can serve
/// a statement.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
///
/// # Response
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "database": "connected",
///   "pool": { "max_connections": 10, "size": 1, "idle": 1, "leased": 0, ... }
/// }
/// ```
///
/// Responds `503 Service Unavailable` with `"status": "degraded"` when the
/// pool is not initialized, shut down, or the probe fails.

use crate::app::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use storefront_shared::db::pool::PoolStats;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Application version
    pub version: String,

    /// Database status
    pub database: String,

    /// Pool statistics, absent before initialization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}

/// Health check handler
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database_status = if !state.db.is_healthy() {
        "unavailable"
    } else {
        match state.db.select("SELECT 1", &[], "health.probe").await {
            Ok(_) => "connected",
            Err(err) => {
                tracing::warn!(error = %err, "Health probe failed");
                "disconnected"
            }
        }
    };

    let healthy = database_status == "connected";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: database_status.to_string(),
            pool: state.db.stats(),
        }),
    )
}
