//! In-process processor
//!
//! Used by the `mock` provider and by tests. Outcomes are scripted per call
//! type; webhooks are signed with the same scheme as the real processor.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::webhook::{DEFAULT_TOLERANCE_SECS, WebhookEvent, WebhookSigner};
use super::{ChargeRequest, GatewayError, GatewayOutcome, GatewayStatus, PaymentGateway, PayoutRequest};

/// Scripted result of the next calls
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    Succeed,
    /// Accept; final result must be delivered by webhook
    Pending,
    Decline(String),
    /// Processor reachable but reports failure in the body
    Fail(String),
    NetworkError,
    /// Never answer; exercises caller timeouts
    Hang,
}

pub struct MockGateway {
    signer: WebhookSigner,
    charge_behavior: Mutex<MockBehavior>,
    payout_behavior: Mutex<MockBehavior>,
    charge_count: AtomicUsize,
    payout_count: AtomicUsize,
    seq: AtomicU64,
}

impl MockGateway {
    pub fn new(webhook_secret: &str) -> Self {
        Self {
            signer: WebhookSigner::new(webhook_secret, DEFAULT_TOLERANCE_SECS),
            charge_behavior: Mutex::new(MockBehavior::Succeed),
            payout_behavior: Mutex::new(MockBehavior::Succeed),
            charge_count: AtomicUsize::new(0),
            payout_count: AtomicUsize::new(0),
            seq: AtomicU64::new(1),
        }
    }

    pub fn set_charge_behavior(&self, behavior: MockBehavior) {
        *self.charge_behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    pub fn set_payout_behavior(&self, behavior: MockBehavior) {
        *self.payout_behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    pub fn charge_count(&self) -> usize {
        self.charge_count.load(Ordering::SeqCst)
    }

    pub fn payout_count(&self) -> usize {
        self.payout_count.load(Ordering::SeqCst)
    }

    /// Raw body and signature header for `event`, as the processor would deliver it
    pub fn signed_webhook(&self, event: &WebhookEvent) -> Result<(Vec<u8>, String), GatewayError> {
        let payload = event.to_payload()?;
        let signature = self.signer.sign(&payload, chrono::Utc::now().timestamp())?;
        Ok((payload, signature))
    }

    async fn respond(&self, behavior: MockBehavior, prefix: &str) -> Result<GatewayOutcome, GatewayError> {
        let gateway_ref = format!("{}_mock_{}", prefix, self.seq.fetch_add(1, Ordering::SeqCst));
        match behavior {
            MockBehavior::Succeed => Ok(GatewayOutcome {
                gateway_ref,
                status: GatewayStatus::Succeeded,
                failure_reason: None,
            }),
            MockBehavior::Pending => Ok(GatewayOutcome {
                gateway_ref,
                status: GatewayStatus::Pending,
                failure_reason: None,
            }),
            MockBehavior::Fail(reason) => Ok(GatewayOutcome {
                gateway_ref,
                status: GatewayStatus::Failed,
                failure_reason: Some(reason),
            }),
            MockBehavior::Decline(reason) => Err(GatewayError::Declined(reason)),
            MockBehavior::NetworkError => Err(GatewayError::Network("mock connection reset".to_string())),
            MockBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(GatewayError::Timeout)
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<GatewayOutcome, GatewayError> {
        self.charge_count.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .charge_behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        tracing::debug!(transaction_id = %request.transaction_id, ?behavior, "Mock charge");
        self.respond(behavior, "ch").await
    }

    async fn payout(&self, request: &PayoutRequest) -> Result<GatewayOutcome, GatewayError> {
        self.payout_count.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .payout_behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        tracing::debug!(transaction_id = %request.transaction_id, ?behavior, "Mock payout");
        self.respond(behavior, "po").await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{TransactionId, UserId};
    use crate::currency::Currency;
    use crate::payment::webhook::WebhookEventKind;
    use rust_decimal::Decimal;

    fn charge() -> ChargeRequest {
        ChargeRequest {
            transaction_id: TransactionId::new(),
            user_id: UserId::from("alice"),
            amount: Decimal::from(10),
            currency: Currency::Usd,
            method_token: "tok".to_string(),
        }
    }

    #[tokio::test]
    async fn test_mock_behaviors() {
        let gateway = MockGateway::new("whsec");
        let ok = gateway.charge(&charge()).await.unwrap();
        assert_eq!(ok.status, GatewayStatus::Succeeded);
        assert!(ok.gateway_ref.starts_with("ch_mock_"));

        gateway.set_charge_behavior(MockBehavior::Pending);
        assert_eq!(
            gateway.charge(&charge()).await.unwrap().status,
            GatewayStatus::Pending
        );

        gateway.set_charge_behavior(MockBehavior::Decline("card declined".to_string()));
        assert!(matches!(
            gateway.charge(&charge()).await,
            Err(GatewayError::Declined(_))
        ));
        assert_eq!(gateway.charge_count(), 3);
    }

    #[test]
    fn test_signed_webhook_verifies() {
        let gateway = MockGateway::new("whsec");
        let event = WebhookEvent {
            event_id: "evt_1".to_string(),
            kind: WebhookEventKind::ChargeSucceeded,
            gateway_ref: "ch_1".to_string(),
            amount: Some(Decimal::new(1000, 2)),
            currency: Some(Currency::Usd),
            user_id: None,
            transaction_id: None,
            failure_reason: None,
        };
        let (body, signature) = gateway.signed_webhook(&event).unwrap();
        assert_eq!(gateway.verify_webhook(&body, &signature).unwrap(), event);

        let other = MockGateway::new("different");
        assert_eq!(
            other.verify_webhook(&body, &signature),
            Err(GatewayError::InvalidSignature)
        );
    }
}
