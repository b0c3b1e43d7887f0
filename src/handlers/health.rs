use crate::{ApiResponse, AppState};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::time::Instant;

/// Liveness plus a database ping.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let database = match state.db.ping().await {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };
    let status = if database == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = json!({
        "status": database,
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {
            "database": database,
            "draft_store": state.config.draft_store_backend,
            "idempotency_ledger": state.config.idempotency_backend,
        },
        "response_time_ms": started.elapsed().as_millis() as u64,
    });
    (status, Json(ApiResponse::success(body)))
}
