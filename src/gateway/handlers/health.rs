//! Health check handler

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use axum::{Json, extract::State, http::StatusCode};
use utoipa::ToSchema;

use super::super::state::AppState;
use super::super::types::{ApiResponse, error_codes};

/// Health check response data
#[derive(serde::Serialize, ToSchema)]
pub struct HealthResponse {
    /// Server timestamp in milliseconds
    #[schema(example = 1703494800000_i64)]
    pub timestamp_ms: i64,
    /// Payment gateway adapter in use
    #[schema(example = "mock")]
    pub payment_gateway: String,
}

/// Health check endpoint
///
/// Pings the PostgreSQL store when one is configured, at most once per
/// interval. Internal details are never exposed in the response.
///
/// - Healthy: 200 OK + {code: 0, data: {timestamp_ms, payment_gateway}}
/// - Unhealthy: 503 Service Unavailable + {code: 5001, msg: "unavailable"}
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse, content_type = "application/json"),
        (status = 503, description = "Service unavailable")
    ),
    tag = "System"
)]
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    static LAST_CHECK_MS: AtomicI64 = AtomicI64::new(0);
    const CHECK_INTERVAL_MS: i64 = 5000;

    let now_ms = chrono::Utc::now().timestamp_millis();

    let last_check = LAST_CHECK_MS.load(Ordering::Relaxed);
    let healthy = match &state.pg_store {
        Some(store) if now_ms - last_check > CHECK_INTERVAL_MS => {
            LAST_CHECK_MS.store(now_ms, Ordering::Relaxed);
            match store.health_check().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(error = %e, "[HEALTH] PostgreSQL ping failed");
                    // Re-check on the next request
                    LAST_CHECK_MS.store(0, Ordering::Relaxed);
                    false
                }
            }
        }
        _ => true,
    };

    if healthy {
        (
            StatusCode::OK,
            Json(ApiResponse::success(HealthResponse {
                timestamp_ms: now_ms,
                payment_gateway: state.engine.gateway_name().to_string(),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse {
                code: error_codes::SERVICE_UNAVAILABLE,
                msg: "unavailable".to_string(),
                data: None,
            }),
        )
    }
}
