//! Webhook signing and parsing
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac-sha256>`, where the MAC
//! covers `"{t}.{raw body}"`. Several `v1` entries may be present during
//! secret rotation; any match is accepted.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::GatewayError;
use crate::core_types::{TransactionId, UserId};
use crate::currency::Currency;
use crate::money::{from_minor_units, to_minor_units};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

pub struct WebhookSigner {
    secret: Vec<u8>,
    tolerance_secs: i64,
}

impl WebhookSigner {
    pub fn new(secret: impl AsRef<[u8]>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            tolerance_secs,
        }
    }

    fn mac(&self, payload: &[u8], timestamp: i64) -> Result<HmacSha256, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| GatewayError::InvalidPayload(format!("webhook secret: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }

    /// Signature header value for `payload` at `timestamp`
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, GatewayError> {
        let tag = self.mac(payload, timestamp)?.finalize().into_bytes();
        Ok(format!("t={},v1={}", timestamp, hex::encode(tag)))
    }

    /// Check `header` against `payload`, with `now` in unix seconds
    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> Result<(), GatewayError> {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", v)) => timestamp = v.parse::<i64>().ok(),
                Some(("v1", v)) => candidates.push(v),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(GatewayError::InvalidSignature)?;
        if (now - timestamp).abs() > self.tolerance_secs {
            tracing::warn!(timestamp, now, "Webhook timestamp outside tolerance");
            return Err(GatewayError::InvalidSignature);
        }

        for candidate in candidates {
            let Ok(tag) = hex::decode(candidate) else {
                continue;
            };
            if self.mac(payload, timestamp)?.verify_slice(&tag).is_ok() {
                return Ok(());
            }
        }
        Err(GatewayError::InvalidSignature)
    }
}

// ============================================================================
// Event payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    ChargeSucceeded,
    ChargeFailed,
    PayoutPaid,
    PayoutFailed,
    /// Acknowledged and ignored
    Unhandled(String),
}

impl WebhookEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            WebhookEventKind::ChargeSucceeded => "charge.succeeded",
            WebhookEventKind::ChargeFailed => "charge.failed",
            WebhookEventKind::PayoutPaid => "payout.paid",
            WebhookEventKind::PayoutFailed => "payout.failed",
            WebhookEventKind::Unhandled(other) => other,
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "charge.succeeded" => WebhookEventKind::ChargeSucceeded,
            "charge.failed" => WebhookEventKind::ChargeFailed,
            "payout.paid" => WebhookEventKind::PayoutPaid,
            "payout.failed" => WebhookEventKind::PayoutFailed,
            other => WebhookEventKind::Unhandled(other.to_string()),
        }
    }
}

/// Authenticated processor event
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    /// Processor event id, the de-duplication key
    pub event_id: String,
    pub kind: WebhookEventKind,
    /// Charge or payout id
    pub gateway_ref: String,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    /// From metadata, set by us when the charge was created
    pub user_id: Option<UserId>,
    pub transaction_id: Option<TransactionId>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: WireObject,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireObject {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    currency: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_message: Option<String>,
}

impl WebhookEvent {
    pub fn parse(raw: &[u8]) -> Result<Self, GatewayError> {
        let wire: WireEvent = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;

        let currency = wire
            .data
            .currency
            .as_deref()
            .map(str::parse::<Currency>)
            .transpose()
            .map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;
        let transaction_id = wire
            .data
            .metadata
            .get("transaction_id")
            .map(|s| s.parse::<TransactionId>())
            .transpose()
            .map_err(|e| GatewayError::InvalidPayload(format!("transaction_id: {}", e)))?;

        Ok(Self {
            event_id: wire.id,
            kind: WebhookEventKind::parse(&wire.event_type),
            gateway_ref: wire.data.id,
            amount: wire.data.amount.map(from_minor_units),
            currency,
            user_id: wire.data.metadata.get("user_id").map(|s| UserId::new(s.as_str())),
            transaction_id,
            failure_reason: wire.data.failure_message,
        })
    }

    /// Wire form, as the processor would send it
    pub fn to_payload(&self) -> Result<Vec<u8>, GatewayError> {
        let mut metadata = HashMap::new();
        if let Some(user_id) = &self.user_id {
            metadata.insert("user_id".to_string(), user_id.to_string());
        }
        if let Some(id) = &self.transaction_id {
            metadata.insert("transaction_id".to_string(), id.to_string());
        }
        let amount = self
            .amount
            .map(to_minor_units)
            .transpose()
            .map_err(|e| GatewayError::InvalidPayload(e.to_string()))?;
        let wire = WireEvent {
            id: self.event_id.clone(),
            event_type: self.kind.as_str().to_string(),
            data: WireObject {
                id: self.gateway_ref.clone(),
                amount,
                currency: self.currency.map(|c| c.code().to_lowercase()),
                metadata,
                failure_message: self.failure_reason.clone(),
            },
        };
        serde_json::to_vec(&wire).map_err(|e| GatewayError::InvalidPayload(e.to_string()))
    }
}
