//! Wallet error taxonomy
//!
//! Every engine error carries a stable string code and an HTTP status
//! suggestion so the gateway can map it without string matching.

use thiserror::Error;

use crate::money::MoneyError;
use crate::payment::GatewayError;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WalletError {
    // === Validation Errors ===
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Invalid exchange: {0}")]
    InvalidExchange(String),

    #[error("Unsupported currency pair: {from} -> {to}")]
    UnsupportedCurrencyPair { from: String, to: String },

    // === Precondition Errors ===
    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Identity and license verification required")]
    VerificationRequired,

    #[error("Request already settled")]
    AlreadySettled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    // === Caller Errors ===
    #[error("User not authenticated")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    // === External / System Errors ===
    #[error("Payment gateway error: {0}")]
    PaymentGatewayError(String),

    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,

    #[error("Concurrent modification, please retry")]
    ConcurrencyConflict,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl WalletError {
    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::InvalidAmount(_) => "INVALID_AMOUNT",
            WalletError::InvalidRecipient(_) => "INVALID_RECIPIENT",
            WalletError::InvalidExchange(_) => "INVALID_EXCHANGE",
            WalletError::UnsupportedCurrencyPair { .. } => "UNSUPPORTED_CURRENCY_PAIR",
            WalletError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            WalletError::VerificationRequired => "VERIFICATION_REQUIRED",
            WalletError::AlreadySettled => "ALREADY_SETTLED",
            WalletError::NotFound(_) => "NOT_FOUND",
            WalletError::InvalidTransition(_) => "INVALID_TRANSITION",
            WalletError::Unauthorized => "UNAUTHORIZED",
            WalletError::Forbidden => "FORBIDDEN",
            WalletError::PaymentGatewayError(_) => "PAYMENT_GATEWAY_ERROR",
            WalletError::InvalidWebhookSignature => "INVALID_WEBHOOK_SIGNATURE",
            WalletError::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            WalletError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            WalletError::InvalidAmount(_)
            | WalletError::InvalidRecipient(_)
            | WalletError::InvalidExchange(_)
            | WalletError::UnsupportedCurrencyPair { .. }
            | WalletError::InvalidWebhookSignature => 400,
            WalletError::Unauthorized => 401,
            WalletError::VerificationRequired | WalletError::Forbidden => 403,
            WalletError::NotFound(_) => 404,
            WalletError::AlreadySettled
            | WalletError::InvalidTransition(_)
            | WalletError::ConcurrencyConflict => 409,
            WalletError::InsufficientFunds => 422,
            WalletError::PaymentGatewayError(_) => 502,
            WalletError::Storage(_) => 500,
        }
    }

    /// Transient failures the caller may retry as a whole request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalletError::ConcurrencyConflict | WalletError::Storage(_)
        )
    }
}

impl From<MoneyError> for WalletError {
    fn from(e: MoneyError) -> Self {
        WalletError::InvalidAmount(e.to_string())
    }
}

impl From<StoreError> for WalletError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict | StoreError::DuplicateReference(_) => {
                WalletError::ConcurrencyConflict
            }
            StoreError::StatusConflict(msg) => WalletError::InvalidTransition(msg),
            StoreError::DuplicateTransaction(id) => {
                WalletError::InvalidTransition(format!("transaction {} already recorded", id))
            }
            StoreError::NotFound(what) => WalletError::NotFound(what),
            StoreError::Database(msg) => WalletError::Storage(msg),
        }
    }
}

impl From<GatewayError> for WalletError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::InvalidSignature => WalletError::InvalidWebhookSignature,
            other => WalletError::PaymentGatewayError(other.to_string()),
        }
    }
}

pub type WalletResult<T> = Result<T, WalletError>;
