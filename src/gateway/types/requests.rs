//! Request bodies and query strings
//!
//! Amounts are decimal numbers in major units. Field names are camelCase.

use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::core_types::{RequestId, UserId};
use crate::currency::Currency;
use crate::engine::Recipient;
use crate::error::WalletError;
use crate::models::{PaymentMethod, RequestDirection, RequestStatus, VerificationStatus};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    #[schema(value_type = String, example = "25.00")]
    pub amount: Decimal,
    #[schema(value_type = String, example = "USD")]
    pub currency: Currency,
    #[serde(default)]
    #[schema(value_type = String, example = "card")]
    pub payment_method: PaymentMethod,
    /// Processor token for a server-side charge
    #[serde(default)]
    pub method_token: Option<String>,
    /// Charge already created by hosted checkout
    #[serde(default)]
    pub gateway_ref: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    #[schema(value_type = String, example = "10.00")]
    pub amount: Decimal,
    #[schema(value_type = String, example = "USD")]
    pub currency: Currency,
    #[serde(default)]
    #[schema(value_type = String, example = "bank")]
    pub payment_method: PaymentMethod,
    /// Processor destination (bank account id, card id)
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub recipient_id: Option<UserId>,
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[schema(value_type = String, example = "40.00")]
    pub amount: Decimal,
    #[schema(value_type = String, example = "USD")]
    pub currency: Currency,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SendRequest {
    pub fn recipient(&self) -> Result<Recipient, WalletError> {
        recipient_from(self.recipient_id.as_ref(), self.recipient_email.as_deref())
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    #[schema(value_type = String, example = "USD")]
    pub from_currency: Currency,
    #[schema(value_type = String, example = "EUR")]
    pub to_currency: Currency,
    #[schema(value_type = String, example = "100.00")]
    pub amount: Decimal,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateMoneyRequest {
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub target_id: Option<UserId>,
    #[serde(default)]
    pub target_email: Option<String>,
    #[schema(value_type = String, example = "20.00")]
    pub amount: Decimal,
    #[schema(value_type = String, example = "EUR")]
    pub currency: Currency,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CreateMoneyRequest {
    pub fn target(&self) -> Result<Recipient, WalletError> {
        recipient_from(self.target_id.as_ref(), self.target_email.as_deref())
    }
}

/// Body of pay-request / reject-request
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestIdBody {
    #[schema(value_type = String)]
    pub request_id: RequestId,
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
    pub currency: Option<String>,
    pub limit: Option<u32>,
    pub page: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RequestListQuery {
    #[serde(default)]
    pub direction: RequestDirection,
    pub status: Option<RequestStatus>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitVerificationRequest {
    /// Pointer into the document store
    #[schema(example = "docs/passport/3f2a.pdf")]
    pub document_ref: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReviewVerificationRequest {
    #[schema(value_type = String, example = "verified")]
    pub status: VerificationStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct VerificationListQuery {
    pub status: Option<VerificationStatus>,
}

/// Id wins over email when both are given
fn recipient_from(id: Option<&UserId>, email: Option<&str>) -> Result<Recipient, WalletError> {
    match (id, email.map(str::trim).filter(|e| !e.is_empty())) {
        (Some(id), _) if !id.as_str().trim().is_empty() => Ok(Recipient::Id(id.clone())),
        (_, Some(email)) => Ok(Recipient::Email(email.to_string())),
        _ => Err(WalletError::InvalidRecipient(
            "recipient id or email required".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_camel_case() {
        let req: SendRequest = serde_json::from_str(
            r#"{"recipientEmail":"bob@example.com","amount":40,"currency":"USD"}"#,
        )
        .unwrap();
        assert_eq!(req.amount, Decimal::from(40));
        assert_eq!(
            req.recipient().unwrap(),
            Recipient::Email("bob@example.com".to_string())
        );
    }

    #[test]
    fn test_missing_recipient_rejected() {
        let req: SendRequest =
            serde_json::from_str(r#"{"amount":"1.00","currency":"EUR","recipientEmail":" "}"#)
                .unwrap();
        assert!(matches!(
            req.recipient(),
            Err(WalletError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn test_deposit_defaults() {
        let req: DepositRequest =
            serde_json::from_str(r#"{"amount":"5.5","currency":"GBP"}"#).unwrap();
        assert_eq!(req.payment_method, PaymentMethod::default());
        assert!(req.method_token.is_none());
    }
}
