//! HTTP processor client
//!
//! Talks to a Stripe-style REST API: `POST {base}/v1/charges` and
//! `POST {base}/v1/payouts`, bearer-authenticated, with our transaction id as
//! the `Idempotency-Key` so a retried call can never charge twice.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::webhook::{WebhookEvent, WebhookSigner};
use super::{ChargeRequest, GatewayError, GatewayOutcome, GatewayStatus, PaymentGateway, PayoutRequest};
use crate::money::to_minor_units;

#[derive(Debug, Serialize)]
struct ChargeBody<'a> {
    amount: i64,
    currency: String,
    source: &'a str,
    metadata: HashMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
struct PayoutBody<'a> {
    amount: i64,
    currency: String,
    destination: &'a str,
    metadata: HashMap<&'static str, String>,
}

#[derive(Debug, Deserialize)]
struct ProcessorObject {
    id: String,
    status: String,
    #[serde(default)]
    failure_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessorErrorEnvelope {
    error: ProcessorErrorBody,
}

#[derive(Debug, Deserialize)]
struct ProcessorErrorBody {
    message: String,
}

pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    signer: WebhookSigner,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: &str,
        api_key: &str,
        webhook_secret: &str,
        timeout: Duration,
        webhook_tolerance_secs: i64,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            signer: WebhookSigner::new(webhook_secret, webhook_tolerance_secs),
        })
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        idempotency_key: String,
        body: &B,
    ) -> Result<GatewayOutcome, GatewayError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Network(format!("processor returned {}", status)));
        }
        if !status.is_success() {
            let message = response
                .json::<ProcessorErrorEnvelope>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_else(|_| status.to_string());
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    GatewayError::Network(format!("processor rejected credentials: {}", message))
                }
                _ => GatewayError::Declined(message),
            });
        }

        let object: ProcessorObject = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;
        Ok(GatewayOutcome {
            status: map_status(&object.status)?,
            gateway_ref: object.id,
            failure_reason: object.failure_message,
        })
    }
}

fn map_status(status: &str) -> Result<GatewayStatus, GatewayError> {
    match status {
        "succeeded" | "paid" => Ok(GatewayStatus::Succeeded),
        "pending" | "processing" | "in_transit" => Ok(GatewayStatus::Pending),
        "failed" | "canceled" => Ok(GatewayStatus::Failed),
        other => Err(GatewayError::InvalidPayload(format!("unknown status {}", other))),
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<GatewayOutcome, GatewayError> {
        let amount =
            to_minor_units(request.amount).map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;
        let body = ChargeBody {
            amount,
            currency: request.currency.code().to_lowercase(),
            source: &request.method_token,
            metadata: HashMap::from([
                ("user_id", request.user_id.to_string()),
                ("transaction_id", request.transaction_id.to_string()),
            ]),
        };
        self.post("/v1/charges", request.transaction_id.to_string(), &body)
            .await
    }

    async fn payout(&self, request: &PayoutRequest) -> Result<GatewayOutcome, GatewayError> {
        let amount =
            to_minor_units(request.amount).map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;
        let body = PayoutBody {
            amount,
            currency: request.currency.code().to_lowercase(),
            destination: &request.destination,
            metadata: HashMap::from([
                ("user_id", request.user_id.to_string()),
                ("transaction_id", request.transaction_id.to_string()),
            ]),
        };
        self.post("/v1/payouts", request.transaction_id.to_string(), &body)
            .await
    }

    fn verify_webhook(
        &self,
        raw_payload: &[u8],
        signature: &str,
    ) -> Result<WebhookEvent, GatewayError> {
        self.signer
            .verify(raw_payload, signature, chrono::Utc::now().timestamp())?;
        WebhookEvent::parse(raw_payload)
    }
}
