//! HTTP Gateway
//!
//! ```text
//! /api/v1/health                      public
//! /api/v1/webhooks/payment            public, HMAC-signed
//! /api/v1/transactions/*              JWT
//! /api/v1/verifications/*             JWT
//! /api/v1/admin/verifications/*       JWT + role=admin
//! ```

pub mod auth;
pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, patch, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;

use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use handlers::{requests, transactions, verification, webhook};
use state::AppState;

/// Complete application router
pub fn router(state: Arc<AppState>) -> Router {
    // ==========================================================================
    // Transactions - JWT
    // ==========================================================================
    let transaction_routes = Router::new()
        .route("/deposit", post(transactions::deposit))
        .route("/withdraw", post(transactions::withdraw))
        .route("/send", post(transactions::send))
        .route("/exchange", post(transactions::exchange))
        .route("/request", post(requests::create_request))
        .route("/pay-request", post(requests::pay_request))
        .route("/reject-request", post(requests::reject_request))
        .route("/requests", get(requests::list_requests))
        .route("/balance", get(transactions::balance))
        .route("/history", get(transactions::history))
        .route("/{transaction_id}", get(transactions::get_transaction))
        .route(
            "/{transaction_id}/cancel",
            post(transactions::cancel_deposit),
        )
        .layer(from_fn_with_state(state.clone(), auth::jwt_auth_middleware));

    // ==========================================================================
    // Verification - JWT
    // ==========================================================================
    let verification_routes = Router::new()
        .route("/", get(verification::status))
        .route("/{kind}", post(verification::submit))
        .layer(from_fn_with_state(state.clone(), auth::jwt_auth_middleware));

    // ==========================================================================
    // Admin - JWT + role
    // ==========================================================================
    let admin_routes = Router::new()
        .route("/verifications/{kind}", get(verification::admin_list))
        .route(
            "/verifications/{kind}/{id}",
            patch(verification::admin_review),
        )
        .layer(from_fn(auth::require_admin))
        .layer(from_fn_with_state(state.clone(), auth::jwt_auth_middleware));

    Router::new()
        .route("/api/v1/health", get(handlers::health_check))
        .route("/api/v1/webhooks/payment", post(webhook::payment_webhook))
        .nest("/api/v1/transactions", transaction_routes)
        .nest("/api/v1/verifications", verification_routes)
        .nest("/api/v1/admin", admin_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
}

/// Bind and serve until the process exits
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> std::io::Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        tracing::error!(%addr, error = %e, "Failed to bind, port may already be in use");
        e
    })?;

    tracing::info!("Gateway listening on http://{}", addr);
    tracing::info!("API Docs: http://{}/docs", addr);

    axum::serve(listener, app).await
}
