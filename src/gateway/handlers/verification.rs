//! Verification handlers: user submission and admin review

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};

use crate::core_types::VerificationId;
use crate::models::{VerificationKind, VerificationRecord};

use super::super::auth::Caller;
use super::super::state::AppState;
use super::super::types::{
    ApiError, ApiResult, ReviewVerificationRequest, SubmitVerificationRequest,
    VerificationListQuery, VerificationStatusData, ok,
};

fn parse_kind(raw: &str) -> Result<VerificationKind, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Unknown verification kind: {}", raw)))
}

/// Submit a verification document
#[utoipa::path(
    post,
    path = "/api/v1/verifications/{kind}",
    params(("kind" = String, Path, description = "passport | gun")),
    request_body = SubmitVerificationRequest,
    responses(
        (status = 200, description = "Record created as pending"),
        (status = 409, description = "A pending or verified record already exists")
    ),
    security(("bearer_auth" = [])),
    tag = "Verification"
)]
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(kind): Path<String>,
    Json(req): Json<SubmitVerificationRequest>,
) -> ApiResult<VerificationRecord> {
    let kind = parse_kind(&kind)?;
    ok(state
        .engine
        .submit_verification(&caller.user_id, kind, &req.document_ref)
        .await?)
}

/// Caller's verification records and gate result
#[utoipa::path(
    get,
    path = "/api/v1/verifications",
    responses((status = 200, description = "Gate status")),
    security(("bearer_auth" = [])),
    tag = "Verification"
)]
pub async fn status(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<VerificationStatusData> {
    let records = state.engine.gate().user_records(&caller.user_id).await?;
    let authorized = state.engine.is_authorized(&caller.user_id).await?;
    ok(VerificationStatusData {
        authorized,
        records,
    })
}

/// Admin console listing
#[utoipa::path(
    get,
    path = "/api/v1/admin/verifications/{kind}",
    params(
        ("kind" = String, Path, description = "passport | gun"),
        ("status" = Option<String>, Query, description = "pending | verified | rejected")
    ),
    responses(
        (status = 200, description = "Matching records"),
        (status = 403, description = "Admin role required")
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn admin_list(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(params): Query<VerificationListQuery>,
) -> ApiResult<Vec<VerificationRecord>> {
    let kind = parse_kind(&kind)?;
    ok(state
        .engine
        .list_verifications(Some(kind), params.status)
        .await?)
}

/// Review a record; may flip the user's gate
#[utoipa::path(
    patch,
    path = "/api/v1/admin/verifications/{kind}/{id}",
    params(
        ("kind" = String, Path, description = "passport | gun"),
        ("id" = String, Path, description = "Verification record id")
    ),
    request_body = ReviewVerificationRequest,
    responses(
        (status = 200, description = "Record updated"),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "No such record of this kind")
    ),
    security(("bearer_auth" = [])),
    tag = "Admin"
)]
pub async fn admin_review(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<Caller>,
    Path((kind, id)): Path<(String, String)>,
    Json(req): Json<ReviewVerificationRequest>,
) -> ApiResult<VerificationRecord> {
    let kind = parse_kind(&kind)?;
    let id: VerificationId = id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid verification id"))?;
    let record = state
        .engine
        .review_verification(id, kind, req.status, req.notes)
        .await?;
    tracing::info!(admin = %admin.user_id, %id, %kind, status = %req.status.as_str(), "Verification reviewed");
    ok(record)
}
