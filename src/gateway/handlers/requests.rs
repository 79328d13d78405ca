//! Money request handlers (JWT)

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Query, State},
};

use crate::engine::MoneyRequestCommand;
use crate::models::MoneyRequest;

use super::super::auth::Caller;
use super::super::state::AppState;
use super::super::types::{
    ApiResult, CreateMoneyRequest, MoneyRequestData, RequestIdBody, RequestListQuery, ok,
};

/// Ask another user for money
#[utoipa::path(
    post,
    path = "/api/v1/transactions/request",
    request_body = CreateMoneyRequest,
    responses(
        (status = 200, description = "Request created"),
        (status = 400, description = "Unknown target")
    ),
    security(("bearer_auth" = [])),
    tag = "Money Requests"
)]
pub async fn create_request(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CreateMoneyRequest>,
) -> ApiResult<MoneyRequestData> {
    let target = req.target()?;
    let request = state
        .engine
        .request_money(MoneyRequestCommand {
            requester: caller.user_id,
            target,
            amount: req.amount,
            currency: req.currency,
            notes: req.notes,
        })
        .await?;
    ok(MoneyRequestData {
        message: "Money request sent".to_string(),
        request,
        transaction: None,
    })
}

/// Pay a request addressed to the caller
#[utoipa::path(
    post,
    path = "/api/v1/transactions/pay-request",
    request_body = RequestIdBody,
    responses(
        (status = 200, description = "Request paid"),
        (status = 404, description = "No such request for this caller"),
        (status = 409, description = "Already settled"),
        (status = 422, description = "Insufficient funds")
    ),
    security(("bearer_auth" = [])),
    tag = "Money Requests"
)]
pub async fn pay_request(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<RequestIdBody>,
) -> ApiResult<MoneyRequestData> {
    let outcome = state
        .engine
        .pay_money_request(&caller.user_id, body.request_id)
        .await?;
    ok(MoneyRequestData {
        message: "Money request paid".to_string(),
        request: outcome.request,
        transaction: Some(outcome.transfer.sent),
    })
}

/// Decline a request addressed to the caller
#[utoipa::path(
    post,
    path = "/api/v1/transactions/reject-request",
    request_body = RequestIdBody,
    responses(
        (status = 200, description = "Request rejected"),
        (status = 409, description = "Already settled")
    ),
    security(("bearer_auth" = [])),
    tag = "Money Requests"
)]
pub async fn reject_request(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<RequestIdBody>,
) -> ApiResult<MoneyRequestData> {
    let request = state
        .engine
        .reject_money_request(&caller.user_id, body.request_id)
        .await?;
    ok(MoneyRequestData {
        message: "Money request rejected".to_string(),
        request,
        transaction: None,
    })
}

#[utoipa::path(
    get,
    path = "/api/v1/transactions/requests",
    params(
        ("direction" = Option<String>, Query, description = "incoming (default) | outgoing"),
        ("status" = Option<String>, Query, description = "pending | completed | rejected")
    ),
    responses((status = 200, description = "Money requests, newest first")),
    security(("bearer_auth" = [])),
    tag = "Money Requests"
)]
pub async fn list_requests(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<RequestListQuery>,
) -> ApiResult<Vec<MoneyRequest>> {
    ok(state
        .engine
        .list_money_requests(&caller.user_id, params.direction, params.status)
        .await?)
}
