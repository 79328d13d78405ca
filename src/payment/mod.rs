//! Payment Gateway Adapter
//!
//! Boundary to the external card/bank processor. The engine only ever talks
//! to [`PaymentGateway`]; concrete processors live behind it:
//! - [`HttpPaymentGateway`]: JSON-over-HTTP processor API
//! - [`MockGateway`]: in-process processor with scriptable outcomes
//!
//! Amounts cross this boundary in major units; adapters convert to the
//! processor's minor units themselves.

pub mod http;
pub mod mock;
pub mod webhook;

pub use http::HttpPaymentGateway;
pub use mock::MockGateway;
pub use webhook::{WebhookEvent, WebhookSigner};

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::core_types::{TransactionId, UserId};
use crate::currency::Currency;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Payment declined: {0}")]
    Declined(String),

    #[error("Gateway network error: {0}")]
    Network(String),

    #[error("Gateway call timed out")]
    Timeout,

    #[error("Invalid gateway payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,
}

impl GatewayError {
    /// Could the processor have acted on the request anyway?
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Network(_))
    }
}

/// Processor-side outcome of a charge or payout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Succeeded,
    /// Accepted; the final result arrives by webhook
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    /// Our journal row id, also sent as the idempotency key
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub method_token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRequest {
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOutcome {
    /// Processor charge / payout id
    pub gateway_ref: String,
    pub status: GatewayStatus,
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &'static str;

    async fn charge(&self, request: &ChargeRequest) -> Result<GatewayOutcome, GatewayError>;

    async fn payout(&self, request: &PayoutRequest) -> Result<GatewayOutcome, GatewayError>;

    /// Authenticate and parse an inbound webhook.
    ///
    /// `InvalidSignature` for a bad or stale signature; the payload must not
    /// be acted upon in that case.
    fn verify_webhook(&self, raw_payload: &[u8], signature: &str)
    -> Result<WebhookEvent, GatewayError>;
}
