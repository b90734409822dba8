use crate::api::AppState;
use crate::pool::{ConnectionPool, PoolStatus};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    postgres_connected: bool,
    shared_schema: String,
    pool: PoolStatus,
    uptime_seconds: u64,
}

pub async fn health_check<P: ConnectionPool>(
    State(state): State<Arc<AppState<P>>>,
) -> impl IntoResponse {
    // Round-trips through the router so a broken reset path shows up here too
    let postgres_connected = match state.router.acquire_schema(None).await {
        Ok(conn) => {
            conn.release().await;
            true
        }
        Err(_) => false,
    };

    let status = if postgres_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if postgres_connected {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            postgres_connected,
            shared_schema: state.router.shared_schema().to_string(),
            pool: state.router.pool().status(),
            uptime_seconds: state.started.elapsed().as_secs(),
        }),
    )
}
