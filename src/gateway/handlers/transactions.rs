//! Wallet transaction handlers (JWT)

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};

use crate::core_types::TransactionId;
use crate::currency::Currency;
use crate::engine::{DepositCommand, ExchangeCommand, SendCommand, WithdrawCommand};
use crate::journal::HistoryPage;
use crate::models::{TransactionStatus, TransactionType};
use crate::store::{Page, TransactionFilter};

use super::super::auth::Caller;
use super::super::state::AppState;
use super::super::types::{
    ApiError, ApiResult, BalanceData, DepositRequest, ExchangeData, ExchangeRequest, HistoryQuery,
    SendRequest, SingleTransactionData, TransactionData, WithdrawRequest, ok,
};

/// Deposit funds
#[utoipa::path(
    post,
    path = "/api/v1/transactions/deposit",
    request_body = DepositRequest,
    responses(
        (status = 200, description = "Deposit completed or pending processor confirmation"),
        (status = 400, description = "Invalid amount"),
        (status = 502, description = "Payment gateway error")
    ),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn deposit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<DepositRequest>,
) -> ApiResult<TransactionData> {
    let tx = state
        .engine
        .deposit(DepositCommand {
            user_id: caller.user_id,
            amount: req.amount,
            currency: req.currency,
            payment_method: req.payment_method,
            method_token: req.method_token,
            gateway_ref: req.gateway_ref,
            notes: req.notes,
        })
        .await?;
    let message = match tx.status {
        TransactionStatus::Completed => "Deposit completed",
        _ => "Deposit pending confirmation",
    };
    ok(TransactionData::new(message, tx))
}

/// Withdraw funds
#[utoipa::path(
    post,
    path = "/api/v1/transactions/withdraw",
    request_body = WithdrawRequest,
    responses(
        (status = 200, description = "Withdrawal completed or processing"),
        (status = 403, description = "Verification required"),
        (status = 422, description = "Insufficient funds"),
        (status = 502, description = "Payout failed, funds returned")
    ),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<WithdrawRequest>,
) -> ApiResult<TransactionData> {
    let tx = state
        .engine
        .withdraw(WithdrawCommand {
            user_id: caller.user_id,
            amount: req.amount,
            currency: req.currency,
            payment_method: req.payment_method,
            destination: req.destination,
            notes: req.notes,
        })
        .await?;
    let message = match tx.status {
        TransactionStatus::Completed => "Withdrawal completed",
        _ => "Withdrawal processing",
    };
    ok(TransactionData::new(message, tx))
}

/// Send money to another user
#[utoipa::path(
    post,
    path = "/api/v1/transactions/send",
    request_body = SendRequest,
    responses(
        (status = 200, description = "Transfer completed"),
        (status = 400, description = "Invalid recipient or amount"),
        (status = 403, description = "Verification required"),
        (status = 422, description = "Insufficient funds")
    ),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn send(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<SendRequest>,
) -> ApiResult<TransactionData> {
    let recipient = req.recipient()?;
    let outcome = state
        .engine
        .send_money(SendCommand {
            sender: caller.user_id,
            recipient,
            amount: req.amount,
            currency: req.currency,
            notes: req.notes,
        })
        .await?;
    ok(TransactionData::new("Money sent", outcome.sent))
}

/// Exchange between two of the caller's currencies
#[utoipa::path(
    post,
    path = "/api/v1/transactions/exchange",
    request_body = ExchangeRequest,
    responses(
        (status = 200, description = "Exchange completed"),
        (status = 400, description = "Invalid or unsupported exchange"),
        (status = 422, description = "Insufficient funds")
    ),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn exchange(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<ExchangeRequest>,
) -> ApiResult<ExchangeData> {
    let outcome = state
        .engine
        .exchange(ExchangeCommand {
            user_id: caller.user_id,
            from: req.from_currency,
            to: req.to_currency,
            amount: req.amount,
        })
        .await?;
    ok(ExchangeData {
        message: "Currency exchanged".to_string(),
        transaction: outcome.transaction,
        converted_amount: outcome.converted_amount,
        exchange_rate: outcome.exchange_rate,
    })
}

/// Caller's balances in every currency
#[utoipa::path(
    get,
    path = "/api/v1/transactions/balance",
    responses((status = 200, description = "Wallet balances")),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn balance(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<BalanceData> {
    let wallet = state.engine.get_account(&caller.user_id).await?;
    ok(BalanceData { wallet })
}

/// Paginated history, newest first
#[utoipa::path(
    get,
    path = "/api/v1/transactions/history",
    params(
        ("type" = Option<String>, Query, description = "deposit | withdraw | exchange | send | receive"),
        ("currency" = Option<String>, Query, description = "Matches either side of an exchange"),
        ("limit" = Option<u32>, Query, description = "Page size, default 10, max 100"),
        ("page" = Option<u32>, Query, description = "1-based page")
    ),
    responses((status = 200, description = "Transactions and pagination")),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn history(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<HistoryQuery>,
) -> ApiResult<HistoryPage> {
    let filter = TransactionFilter {
        tx_type: params
            .tx_type
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<TransactionType>)
            .transpose()
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        currency: params
            .currency
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<Currency>)
            .transpose()
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
    };
    let page = Page::new(params.page, params.limit);
    ok(state.engine.history(&caller.user_id, &filter, page).await?)
}

/// One transaction owned by, or addressed to, the caller
#[utoipa::path(
    get,
    path = "/api/v1/transactions/{transaction_id}",
    params(("transaction_id" = String, Path, description = "Transaction id")),
    responses(
        (status = 200, description = "Transaction"),
        (status = 404, description = "Not found")
    ),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(transaction_id): Path<String>,
) -> ApiResult<SingleTransactionData> {
    let id = parse_transaction_id(&transaction_id)?;
    let transaction = state.engine.get_transaction(&caller.user_id, id).await?;
    ok(SingleTransactionData { transaction })
}

/// Abandon a deposit still awaiting processor confirmation
#[utoipa::path(
    post,
    path = "/api/v1/transactions/{transaction_id}/cancel",
    params(("transaction_id" = String, Path, description = "Pending deposit id")),
    responses(
        (status = 200, description = "Deposit cancelled"),
        (status = 409, description = "Not a pending deposit")
    ),
    security(("bearer_auth" = [])),
    tag = "Transactions"
)]
pub async fn cancel_deposit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(transaction_id): Path<String>,
) -> ApiResult<TransactionData> {
    let id = parse_transaction_id(&transaction_id)?;
    let tx = state
        .engine
        .cancel_pending_deposit(&caller.user_id, id)
        .await?;
    ok(TransactionData::new("Deposit cancelled", tx))
}

fn parse_transaction_id(raw: &str) -> Result<TransactionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("Invalid transaction id"))
}
