//! Payment processor callback
//!
//! Takes the raw body: the signature covers the exact bytes received, so
//! the payload must not pass through a JSON extractor first.

use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::HeaderMap};

use crate::engine::WebhookAck;
use crate::error::WalletError;

use super::super::state::AppState;
use super::super::types::{ApiResult, ok};

#[utoipa::path(
    post,
    path = "/api/v1/webhooks/payment",
    request_body(content = String, description = "Signed processor event", content_type = "application/json"),
    responses(
        (status = 200, description = "Event acknowledged"),
        (status = 400, description = "Invalid webhook signature")
    ),
    tag = "Webhooks"
)]
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    let signature = headers
        .get(state.signature_header.as_str())
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!(header = %state.signature_header, "Webhook without signature header");
            WalletError::InvalidWebhookSignature
        })?;
    ok(state.engine.handle_webhook(&body, signature).await?)
}
