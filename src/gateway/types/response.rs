//! API Response types and error codes
//!
//! - `ApiResponse<T>`: Unified response wrapper
//! - `ApiError`: Error half of every handler result
//! - `error_codes`: Standard error code constants
//! - Response DTOs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::WalletError;
use crate::models::{Account, MoneyRequest, Transaction, VerificationRecord};

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or absent (error)
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    #[schema(example = 0)]
    pub code: i32,
    #[schema(example = "ok")]
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

// ============================================================================
// ApiError
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub msg: String,
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, error_codes::AUTH_FAILED, msg)
    }

    pub fn missing_auth() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            error_codes::MISSING_AUTH,
            "Missing Authorization header",
        )
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, error_codes::FORBIDDEN, msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::SERVICE_UNAVAILABLE,
            msg,
        )
    }

    pub fn into_err<T>(self) -> Result<T, Self> {
        Err(self)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<()>::error(self.code, self.msg)),
        )
            .into_response()
    }
}

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let msg = match &e {
            // Storage details stay in the logs
            WalletError::Storage(detail) => {
                tracing::error!(error = %detail, "Storage failure");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        Self::new(status, error_codes::for_wallet_error(&e), msg)
    }
}

// ============================================================================
// Response DTOs
// ============================================================================

/// `{message, transaction}`
#[derive(Debug, Serialize)]
pub struct TransactionData {
    pub message: String,
    pub transaction: Transaction,
}

impl TransactionData {
    pub fn new(message: &str, transaction: Transaction) -> Self {
        Self {
            message: message.to_string(),
            transaction,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeData {
    pub message: String,
    pub transaction: Transaction,
    pub converted_amount: Decimal,
    pub exchange_rate: Decimal,
}

#[derive(Debug, Serialize)]
pub struct MoneyRequestData {
    pub message: String,
    pub request: MoneyRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Serialize)]
pub struct SingleTransactionData {
    pub transaction: Transaction,
}

/// `{wallet: {balances: [...]}}`
#[derive(Debug, Serialize)]
pub struct BalanceData {
    pub wallet: Account,
}

#[derive(Debug, Serialize)]
pub struct VerificationStatusData {
    pub authorized: bool,
    pub records: Vec<VerificationRecord>,
}

// ============================================================================
// Error Codes
// ============================================================================

/// Standard API error codes
pub mod error_codes {
    use crate::error::WalletError;

    // Success
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const INSUFFICIENT_FUNDS: i32 = 1002;
    pub const INVALID_AMOUNT: i32 = 1003;
    pub const INVALID_RECIPIENT: i32 = 1004;
    pub const INVALID_EXCHANGE: i32 = 1005;
    pub const UNSUPPORTED_CURRENCY_PAIR: i32 = 1006;
    pub const VERIFICATION_REQUIRED: i32 = 1007;
    pub const ALREADY_SETTLED: i32 = 1008;
    pub const INVALID_TRANSITION: i32 = 1009;

    // Auth errors (2xxx)
    pub const MISSING_AUTH: i32 = 2001;
    pub const AUTH_FAILED: i32 = 2002;
    pub const FORBIDDEN: i32 = 2003;
    pub const INVALID_WEBHOOK_SIGNATURE: i32 = 2004;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4004;
    pub const CONCURRENCY_CONFLICT: i32 = 4009;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
    pub const PAYMENT_GATEWAY_ERROR: i32 = 5002;

    pub fn for_wallet_error(e: &WalletError) -> i32 {
        match e {
            WalletError::InvalidAmount(_) => INVALID_AMOUNT,
            WalletError::InvalidRecipient(_) => INVALID_RECIPIENT,
            WalletError::InvalidExchange(_) => INVALID_EXCHANGE,
            WalletError::UnsupportedCurrencyPair { .. } => UNSUPPORTED_CURRENCY_PAIR,
            WalletError::InsufficientFunds => INSUFFICIENT_FUNDS,
            WalletError::VerificationRequired => VERIFICATION_REQUIRED,
            WalletError::AlreadySettled => ALREADY_SETTLED,
            WalletError::NotFound(_) => NOT_FOUND,
            WalletError::InvalidTransition(_) => INVALID_TRANSITION,
            WalletError::Unauthorized => AUTH_FAILED,
            WalletError::Forbidden => FORBIDDEN,
            WalletError::PaymentGatewayError(_) => PAYMENT_GATEWAY_ERROR,
            WalletError::InvalidWebhookSignature => INVALID_WEBHOOK_SIGNATURE,
            WalletError::ConcurrencyConflict => CONCURRENCY_CONFLICT,
            WalletError::Storage(_) => INTERNAL_ERROR,
        }
    }
}
