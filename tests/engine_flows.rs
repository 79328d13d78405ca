//! End-to-end engine behaviour over the in-memory store and mock processor

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{Notify, mpsc};

use wallet_ledger::engine::{
    DepositCommand, EngineSettings, EventEffect, ExchangeCommand, MoneyRequestCommand,
    SendCommand, TransferEngine, WithdrawCommand,
};
use wallet_ledger::models::{RequestDirection, RequestStatus, UserProfile};
use wallet_ledger::payment::mock::MockBehavior;
use wallet_ledger::payment::webhook::WebhookEventKind;
use wallet_ledger::payment::{
    ChargeRequest, GatewayError, GatewayOutcome, GatewayStatus, MockGateway, PaymentGateway,
    PayoutRequest, WebhookEvent,
};
use wallet_ledger::store::{Page, TransactionFilter};
use wallet_ledger::{
    Currency, MemoryStore, PaymentMethod, RateTable, Recipient, TransactionId, TransactionStatus,
    TransactionType, UserId, VerificationKind, VerificationStatus, WalletError,
};

struct Harness {
    store: Arc<MemoryStore>,
    gateway: Arc<MockGateway>,
    engine: Arc<TransferEngine>,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    for name in ["alice", "bob", "carol"] {
        store
            .add_user(UserProfile {
                user_id: UserId::from(name),
                email: format!("{}@example.com", name),
                display_name: name.to_string(),
            })
            .await;
    }
    let gateway = Arc::new(MockGateway::new("whsec_test"));
    let engine = TransferEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        gateway.clone(),
        Arc::new(RateTable::new()),
        EngineSettings {
            gateway_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );
    Harness {
        store,
        gateway,
        engine: Arc::new(engine),
    }
}

fn user(name: &str) -> UserId {
    UserId::from(name)
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

/// Both documents submitted and approved
async fn authorize(engine: &TransferEngine, name: &str) {
    for kind in [VerificationKind::Identity, VerificationKind::License] {
        let record = engine
            .submit_verification(&user(name), kind, &format!("doc-{}-{}", name, kind))
            .await
            .unwrap();
        engine
            .review_verification(record.id, kind, VerificationStatus::Verified, None)
            .await
            .unwrap();
    }
}

async fn fund(engine: &TransferEngine, name: &str, amount: &str, currency: Currency) {
    engine
        .deposit(DepositCommand {
            user_id: user(name),
            amount: dec(amount),
            currency,
            payment_method: PaymentMethod::Cash,
            method_token: None,
            gateway_ref: None,
            notes: None,
        })
        .await
        .unwrap();
}

async fn balance(engine: &TransferEngine, name: &str, currency: Currency) -> Decimal {
    engine.get_balance(&user(name), currency).await.unwrap()
}

fn send(from: &str, to: &str, amount: &str) -> SendCommand {
    SendCommand {
        sender: user(from),
        recipient: Recipient::parse(to),
        amount: dec(amount),
        currency: Currency::Usd,
        notes: None,
    }
}

fn wallet_withdraw(name: &str, amount: &str) -> WithdrawCommand {
    WithdrawCommand {
        user_id: user(name),
        amount: dec(amount),
        currency: Currency::Usd,
        payment_method: PaymentMethod::Wallet,
        destination: None,
        notes: None,
    }
}

fn bank_withdraw(name: &str, amount: &str) -> WithdrawCommand {
    WithdrawCommand {
        payment_method: PaymentMethod::Bank,
        destination: Some("acct_123".to_string()),
        ..wallet_withdraw(name, amount)
    }
}

fn charge_event(event_id: &str, gateway_ref: &str, amount: &str) -> WebhookEvent {
    WebhookEvent {
        event_id: event_id.to_string(),
        kind: WebhookEventKind::ChargeSucceeded,
        gateway_ref: gateway_ref.to_string(),
        amount: Some(dec(amount)),
        currency: Some(Currency::Usd),
        user_id: None,
        transaction_id: None,
        failure_reason: None,
    }
}

async fn hosted_deposit(engine: &TransferEngine, name: &str, amount: &str, gateway_ref: &str) {
    let pending = engine
        .deposit(DepositCommand {
            user_id: user(name),
            amount: dec(amount),
            currency: Currency::Usd,
            payment_method: PaymentMethod::Card,
            method_token: None,
            gateway_ref: Some(gateway_ref.to_string()),
            notes: None,
        })
        .await
        .unwrap();
    assert_eq!(pending.status, TransactionStatus::Pending);
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn withdraw_more_than_balance_fails_and_leaves_balance() {
    let h = harness().await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "100", Currency::Usd).await;

    let err = h
        .engine
        .withdraw(wallet_withdraw("alice", "150"))
        .await
        .unwrap_err();
    assert_eq!(err, WalletError::InsufficientFunds);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("100"));
    // Only the funding deposit is journaled
    assert_eq!(h.store.transaction_count().await, 1);
}

#[tokio::test]
async fn send_moves_exact_amount_and_journals_both_sides() {
    let h = harness().await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "100", Currency::Usd).await;

    let outcome = h.engine.send_money(send("alice", "bob", "40")).await.unwrap();

    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("60"));
    assert_eq!(balance(&h.engine, "bob", Currency::Usd).await, dec("40"));
    assert_eq!(outcome.sent.tx_type, TransactionType::Send);
    assert_eq!(outcome.received.tx_type, TransactionType::Receive);
    for tx in [&outcome.sent, &outcome.received] {
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.amount, dec("40"));
        assert_eq!(tx.currency_from, Currency::Usd);
    }
    assert_eq!(outcome.sent.transfer_id, outcome.received.transfer_id);
    assert_ne!(outcome.sent.reference, outcome.received.reference);
    assert_eq!(outcome.received.counterparty_user_id, Some(user("alice")));
}

#[tokio::test]
async fn send_by_email_resolves_recipient() {
    let h = harness().await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "10", Currency::Usd).await;

    h.engine
        .send_money(send("alice", "carol@example.com", "2.50"))
        .await
        .unwrap();
    assert_eq!(balance(&h.engine, "carol", Currency::Usd).await, dec("2.50"));
}

#[tokio::test]
async fn send_to_self_or_unknown_is_rejected_without_mutation() {
    let h = harness().await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "10", Currency::Usd).await;

    for to in ["alice", "nobody", "nobody@example.com"] {
        let err = h.engine.send_money(send("alice", to, "1")).await.unwrap_err();
        assert!(matches!(err, WalletError::InvalidRecipient(_)), "{to}: {err:?}");
    }
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("10"));
}

#[tokio::test]
async fn unverified_sender_is_blocked() {
    let h = harness().await;
    fund(&h.engine, "alice", "10", Currency::Usd).await;

    assert_eq!(
        h.engine.send_money(send("alice", "bob", "1")).await.unwrap_err(),
        WalletError::VerificationRequired
    );
    assert_eq!(
        h.engine
            .withdraw(wallet_withdraw("alice", "1"))
            .await
            .unwrap_err(),
        WalletError::VerificationRequired
    );
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("10"));
}

#[tokio::test]
async fn unpayable_money_request_stays_pending() {
    let h = harness().await;
    authorize(&h.engine, "bob").await;
    fund(&h.engine, "bob", "10", Currency::Eur).await;

    let request = h
        .engine
        .request_money(MoneyRequestCommand {
            requester: user("alice"),
            target: Recipient::parse("bob"),
            amount: dec("20"),
            currency: Currency::Eur,
            notes: Some("dinner".to_string()),
        })
        .await
        .unwrap();

    let err = h
        .engine
        .pay_money_request(&user("bob"), request.id)
        .await
        .unwrap_err();
    assert_eq!(err, WalletError::InsufficientFunds);

    let incoming = h
        .engine
        .list_money_requests(&user("bob"), RequestDirection::Incoming, None)
        .await
        .unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].status, RequestStatus::Pending);
    assert_eq!(balance(&h.engine, "bob", Currency::Eur).await, dec("10"));
    assert_eq!(balance(&h.engine, "alice", Currency::Eur).await, Decimal::ZERO);
}

#[tokio::test]
async fn money_request_settles_once() {
    let h = harness().await;
    authorize(&h.engine, "bob").await;
    fund(&h.engine, "bob", "50", Currency::Usd).await;

    let request = h
        .engine
        .request_money(MoneyRequestCommand {
            requester: user("alice"),
            target: Recipient::parse("bob@example.com"),
            amount: dec("20"),
            currency: Currency::Usd,
            notes: None,
        })
        .await
        .unwrap();

    // Only the target may act on it
    assert!(matches!(
        h.engine.pay_money_request(&user("alice"), request.id).await,
        Err(WalletError::NotFound(_))
    ));

    let settled = h
        .engine
        .pay_money_request(&user("bob"), request.id)
        .await
        .unwrap();
    assert_eq!(settled.request.status, RequestStatus::Completed);
    assert_eq!(settled.transfer.sent.request_id, Some(request.id));
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("20"));
    assert_eq!(balance(&h.engine, "bob", Currency::Usd).await, dec("30"));

    assert_eq!(
        h.engine
            .pay_money_request(&user("bob"), request.id)
            .await
            .unwrap_err(),
        WalletError::AlreadySettled
    );
    assert_eq!(
        h.engine
            .reject_money_request(&user("bob"), request.id)
            .await
            .unwrap_err(),
        WalletError::AlreadySettled
    );
    assert_eq!(balance(&h.engine, "bob", Currency::Usd).await, dec("30"));
}

#[tokio::test]
async fn rejected_request_cannot_be_paid() {
    let h = harness().await;
    authorize(&h.engine, "bob").await;
    fund(&h.engine, "bob", "50", Currency::Usd).await;
    let request = h
        .engine
        .request_money(MoneyRequestCommand {
            requester: user("alice"),
            target: Recipient::parse("bob"),
            amount: dec("5"),
            currency: Currency::Usd,
            notes: None,
        })
        .await
        .unwrap();

    let rejected = h
        .engine
        .reject_money_request(&user("bob"), request.id)
        .await
        .unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(
        h.engine
            .pay_money_request(&user("bob"), request.id)
            .await
            .unwrap_err(),
        WalletError::AlreadySettled
    );
}

#[tokio::test]
async fn concurrent_payments_of_one_request_settle_once() {
    let h = harness().await;
    authorize(&h.engine, "bob").await;
    fund(&h.engine, "bob", "100", Currency::Usd).await;
    let request = h
        .engine
        .request_money(MoneyRequestCommand {
            requester: user("alice"),
            target: Recipient::parse("bob"),
            amount: dec("10"),
            currency: Currency::Usd,
            notes: None,
        })
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = h.engine.clone();
            let id = request.id;
            tokio::spawn(async move { engine.pay_money_request(&UserId::from("bob"), id).await })
        })
        .collect();
    let results = futures::future::join_all(handles).await;
    let paid = results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| r.is_ok())
        .count();

    assert_eq!(paid, 1);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("10"));
    assert_eq!(balance(&h.engine, "bob", Currency::Usd).await, dec("90"));
}

#[tokio::test]
async fn exchange_uses_configured_rate_and_freezes_it() {
    let h = harness().await;
    fund(&h.engine, "alice", "100", Currency::Usd).await;

    let outcome = h
        .engine
        .exchange(ExchangeCommand {
            user_id: user("alice"),
            from: Currency::Usd,
            to: Currency::Eur,
            amount: dec("100"),
        })
        .await
        .unwrap();

    assert_eq!(outcome.converted_amount, dec("93.00"));
    assert_eq!(outcome.exchange_rate, dec("0.93"));
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, Decimal::ZERO);
    assert_eq!(balance(&h.engine, "alice", Currency::Eur).await, dec("93"));

    h.engine
        .rates()
        .set_rate(Currency::Usd, Currency::Eur, dec("0.50"));
    let stored = h
        .engine
        .get_transaction(&user("alice"), outcome.transaction.id)
        .await
        .unwrap();
    assert_eq!(stored.exchange_rate, Some(dec("0.93")));
    assert_eq!(stored.converted_amount, Some(dec("93.00")));
    assert_eq!(stored.currency_to, Some(Currency::Eur));
}

#[tokio::test]
async fn exchange_without_funds_changes_nothing() {
    let h = harness().await;
    fund(&h.engine, "alice", "5", Currency::Usd).await;
    let err = h
        .engine
        .exchange(ExchangeCommand {
            user_id: user("alice"),
            from: Currency::Usd,
            to: Currency::Gbp,
            amount: dec("10"),
        })
        .await
        .unwrap_err();
    assert_eq!(err, WalletError::InsufficientFunds);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("5"));
    assert_eq!(balance(&h.engine, "alice", Currency::Gbp).await, Decimal::ZERO);
}

#[tokio::test]
async fn amounts_with_more_than_two_decimals_are_rejected() {
    let h = harness().await;
    let err = h
        .engine
        .deposit(DepositCommand {
            user_id: user("alice"),
            amount: dec("1.005"),
            currency: Currency::Usd,
            payment_method: PaymentMethod::Cash,
            method_token: None,
            gateway_ref: None,
            notes: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::InvalidAmount(_)));
    assert_eq!(h.store.transaction_count().await, 0);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transfers_conserve_money() {
    let h = harness().await;
    authorize(&h.engine, "alice").await;
    authorize(&h.engine, "bob").await;
    fund(&h.engine, "alice", "500", Currency::Usd).await;
    fund(&h.engine, "bob", "500", Currency::Usd).await;

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let engine = h.engine.clone();
            let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
            let cmd = send(from, to, &format!("{}.25", i % 7 + 1));
            tokio::spawn(async move { engine.send_money(cmd).await })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        match handle.unwrap() {
            Ok(_) | Err(WalletError::InsufficientFunds) => {}
            Err(e) => panic!("unexpected transfer error: {e:?}"),
        }
    }

    let alice = balance(&h.engine, "alice", Currency::Usd).await;
    let bob = balance(&h.engine, "bob", Currency::Usd).await;
    assert_eq!(alice + bob, dec("1000"));
    assert!(alice >= Decimal::ZERO && bob >= Decimal::ZERO);
    assert_eq!(h.engine.ledger().lock_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_withdrawals_never_overdraw() {
    let h = harness().await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "100", Currency::Usd).await;

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.withdraw(wallet_withdraw("alice", "10")).await })
        })
        .collect();
    let mut succeeded = 0;
    for handle in futures::future::join_all(handles).await {
        match handle.unwrap() {
            Ok(_) => succeeded += 1,
            Err(WalletError::InsufficientFunds) => {}
            Err(e) => panic!("unexpected withdraw error: {e:?}"),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, Decimal::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_thousand_concurrent_entries_get_distinct_references() {
    let h = harness().await;

    let handles: Vec<_> = (0..10_000)
        .map(|i| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .deposit(DepositCommand {
                        user_id: UserId::new(format!("load-{}", i % 64)),
                        amount: Decimal::ONE,
                        currency: Currency::Usd,
                        payment_method: PaymentMethod::Cash,
                        method_token: None,
                        gateway_ref: None,
                        notes: None,
                    })
                    .await
            })
        })
        .collect();

    let mut references = HashSet::new();
    for handle in futures::future::join_all(handles).await {
        let tx = handle.unwrap().unwrap();
        assert!(references.insert(tx.reference));
    }
    assert_eq!(references.len(), 10_000);
    assert_eq!(h.store.transaction_count().await, 10_000);
}

#[tokio::test]
async fn gate_opens_only_with_both_documents_in_any_order() {
    let h = harness().await;
    let alice = user("alice");

    let identity = h
        .engine
        .submit_verification(&alice, VerificationKind::Identity, "passport-1")
        .await
        .unwrap();
    let license = h
        .engine
        .submit_verification(&alice, VerificationKind::License, "license-1")
        .await
        .unwrap();

    // License first this time
    h.engine
        .review_verification(license.id, VerificationKind::License, VerificationStatus::Verified, None)
        .await
        .unwrap();
    assert!(!h.engine.is_authorized(&alice).await.unwrap());

    h.engine
        .review_verification(identity.id, VerificationKind::Identity, VerificationStatus::Verified, None)
        .await
        .unwrap();
    assert!(h.engine.is_authorized(&alice).await.unwrap());
    assert!(h.engine.get_account(&alice).await.unwrap().verified);

    // Revoking one document closes the gate again
    h.engine
        .review_verification(
            license.id,
            VerificationKind::License,
            VerificationStatus::Rejected,
            Some("expired".to_string()),
        )
        .await
        .unwrap();
    assert!(!h.engine.is_authorized(&alice).await.unwrap());
    assert!(!h.engine.get_account(&alice).await.unwrap().verified);
}

#[tokio::test]
async fn second_open_submission_of_a_kind_is_refused() {
    let h = harness().await;
    let alice = user("alice");
    h.engine
        .submit_verification(&alice, VerificationKind::Identity, "passport-1")
        .await
        .unwrap();
    assert!(matches!(
        h.engine
            .submit_verification(&alice, VerificationKind::Identity, "passport-2")
            .await,
        Err(WalletError::InvalidTransition(_))
    ));
}

// ============================================================================
// Processor-backed flows
// ============================================================================

#[tokio::test]
async fn card_deposit_credits_on_successful_charge() {
    let h = harness().await;
    let tx = h
        .engine
        .deposit(DepositCommand {
            user_id: user("alice"),
            amount: dec("12.34"),
            currency: Currency::Usd,
            payment_method: PaymentMethod::Card,
            method_token: Some("tok_visa".to_string()),
            gateway_ref: None,
            notes: None,
        })
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert!(tx.gateway_ref.as_deref().is_some_and(|r| r.starts_with("ch_mock_")));
    assert_eq!(h.gateway.charge_count(), 1);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("12.34"));
}

#[tokio::test]
async fn duplicate_webhook_credits_once() {
    let h = harness().await;
    hosted_deposit(&h.engine, "alice", "25", "ch_hosted_42").await;

    let (body, signature) = h
        .gateway
        .signed_webhook(&charge_event("evt_1", "ch_hosted_42", "25"))
        .unwrap();
    let first = h.engine.handle_webhook(&body, &signature).await.unwrap();
    let second = h.engine.handle_webhook(&body, &signature).await.unwrap();
    assert_eq!(first.effect, EventEffect::Applied);
    assert_eq!(second.effect, EventEffect::Duplicate);

    // Redelivery under a fresh event id is caught by the status check
    let (body, signature) = h
        .gateway
        .signed_webhook(&charge_event("evt_2", "ch_hosted_42", "25"))
        .unwrap();
    let third = h.engine.handle_webhook(&body, &signature).await.unwrap();
    assert_eq!(third.effect, EventEffect::Duplicate);

    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("25"));
    let page = h
        .engine
        .history(
            &user("alice"),
            &TransactionFilter {
                tx_type: Some(TransactionType::Deposit),
                currency: None,
            },
            Page::new(None, None),
        )
        .await
        .unwrap();
    assert_eq!(page.transactions.len(), 1);
    assert_eq!(page.transactions[0].status, TransactionStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_webhook_deliveries_credit_once() {
    let h = harness().await;
    hosted_deposit(&h.engine, "alice", "10", "ch_hosted_7").await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = h.engine.clone();
            let (body, signature) = h
                .gateway
                .signed_webhook(&charge_event(&format!("evt_{}", i % 2), "ch_hosted_7", "10"))
                .unwrap();
            tokio::spawn(async move { engine.handle_webhook(&body, &signature).await })
        })
        .collect();
    let applied = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .filter(|ack| ack.effect == EventEffect::Applied)
        .count();

    assert_eq!(applied, 1);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("10"));
}

#[tokio::test]
async fn forged_webhook_is_rejected() {
    let h = harness().await;
    hosted_deposit(&h.engine, "alice", "10", "ch_hosted_9").await;

    let forger = MockGateway::new("not-the-secret");
    let (body, signature) = forger
        .signed_webhook(&charge_event("evt_x", "ch_hosted_9", "10"))
        .unwrap();
    assert_eq!(
        h.engine.handle_webhook(&body, &signature).await.unwrap_err(),
        WalletError::InvalidWebhookSignature
    );
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, Decimal::ZERO);
}

#[tokio::test]
async fn failed_charge_webhook_closes_pending_deposit() {
    let h = harness().await;
    hosted_deposit(&h.engine, "alice", "10", "ch_hosted_3").await;

    let mut event = charge_event("evt_fail", "ch_hosted_3", "10");
    event.kind = WebhookEventKind::ChargeFailed;
    event.failure_reason = Some("card_declined".to_string());
    let (body, signature) = h.gateway.signed_webhook(&event).unwrap();
    assert_eq!(
        h.engine.handle_webhook(&body, &signature).await.unwrap().effect,
        EventEffect::Applied
    );

    // A late success for the closed deposit must not credit
    let (body, signature) = h
        .gateway
        .signed_webhook(&charge_event("evt_late", "ch_hosted_3", "10"))
        .unwrap();
    assert_eq!(
        h.engine.handle_webhook(&body, &signature).await.unwrap().effect,
        EventEffect::Ignored
    );
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, Decimal::ZERO);
}

#[tokio::test]
async fn failed_payout_is_compensated() {
    let h = harness().await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "100", Currency::Usd).await;
    h.gateway
        .set_payout_behavior(MockBehavior::Fail("account closed".to_string()));

    let err = h
        .engine
        .withdraw(bank_withdraw("alice", "40"))
        .await
        .unwrap_err();
    assert!(matches!(err, WalletError::PaymentGatewayError(_)));
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("100"));

    let page = h
        .engine
        .history(
            &user("alice"),
            &TransactionFilter {
                tx_type: Some(TransactionType::Withdraw),
                currency: None,
            },
            Page::new(None, None),
        )
        .await
        .unwrap();
    assert_eq!(page.transactions.len(), 1);
    assert_eq!(page.transactions[0].status, TransactionStatus::Failed);
}

#[tokio::test]
async fn async_payout_settles_by_webhook() {
    let h = harness().await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "100", Currency::Usd).await;
    h.gateway.set_payout_behavior(MockBehavior::Pending);

    let tx = h.engine.withdraw(bank_withdraw("alice", "30")).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Processing);
    // Reserved eagerly
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("70"));

    let event = WebhookEvent {
        event_id: "evt_po_fail".to_string(),
        kind: WebhookEventKind::PayoutFailed,
        gateway_ref: tx.gateway_ref.clone().unwrap(),
        amount: Some(dec("30")),
        currency: Some(Currency::Usd),
        user_id: None,
        transaction_id: Some(tx.id),
        failure_reason: Some("invalid account".to_string()),
    };
    let (body, signature) = h.gateway.signed_webhook(&event).unwrap();
    assert_eq!(
        h.engine.handle_webhook(&body, &signature).await.unwrap().effect,
        EventEffect::Applied
    );
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("100"));

    // Replay of the failure does not credit again
    let mut replay = event.clone();
    replay.event_id = "evt_po_fail_2".to_string();
    let (body, signature) = h.gateway.signed_webhook(&replay).unwrap();
    assert_eq!(
        h.engine.handle_webhook(&body, &signature).await.unwrap().effect,
        EventEffect::Duplicate
    );
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("100"));
}

#[tokio::test]
async fn payout_timeout_keeps_reserve_pending() {
    let h = harness().await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "50", Currency::Usd).await;
    h.gateway.set_payout_behavior(MockBehavior::Hang);

    let tx = h.engine.withdraw(bank_withdraw("alice", "20")).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("30"));
    assert_eq!(h.gateway.payout_count(), 1);
}

#[tokio::test]
async fn history_filters_and_paginates() {
    let h = harness().await;
    for _ in 0..5 {
        fund(&h.engine, "alice", "1", Currency::Usd).await;
    }
    fund(&h.engine, "alice", "3", Currency::Gbp).await;

    let usd = TransactionFilter {
        tx_type: None,
        currency: Some(Currency::Usd),
    };
    let first = h
        .engine
        .history(&user("alice"), &usd, Page::new(Some(1), Some(2)))
        .await
        .unwrap();
    assert_eq!(first.transactions.len(), 2);
    assert_eq!(first.pagination.total, 5);
    assert_eq!(first.pagination.pages, 3);

    let last = h
        .engine
        .history(&user("alice"), &usd, Page::new(Some(3), Some(2)))
        .await
        .unwrap();
    assert_eq!(last.transactions.len(), 1);

    // Other users see nothing
    let bob = h
        .engine
        .history(&user("bob"), &TransactionFilter::default(), Page::new(None, None))
        .await
        .unwrap();
    assert!(bob.transactions.is_empty());
}

// ============================================================================
// Webhooks racing an in-flight processor call
// ============================================================================

/// Processor that parks every charge and payout until released
struct HeldGateway {
    signer: MockGateway,
    entered: mpsc::UnboundedSender<TransactionId>,
    release: Notify,
    answer: GatewayOutcome,
}

impl HeldGateway {
    async fn hold(&self, id: TransactionId) -> Result<GatewayOutcome, GatewayError> {
        let _ = self.entered.send(id);
        self.release.notified().await;
        Ok(self.answer.clone())
    }
}

#[async_trait]
impl PaymentGateway for HeldGateway {
    fn name(&self) -> &'static str {
        "held"
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<GatewayOutcome, GatewayError> {
        self.hold(request.transaction_id).await
    }

    async fn payout(&self, request: &PayoutRequest) -> Result<GatewayOutcome, GatewayError> {
        self.hold(request.transaction_id).await
    }

    fn verify_webhook(
        &self,
        raw_payload: &[u8],
        signature: &str,
    ) -> Result<WebhookEvent, GatewayError> {
        self.signer.verify_webhook(raw_payload, signature)
    }
}

struct HeldHarness {
    store: Arc<MemoryStore>,
    gateway: Arc<HeldGateway>,
    engine: Arc<TransferEngine>,
    entered: mpsc::UnboundedReceiver<TransactionId>,
}

async fn held_harness(gateway_ref: &str, timeout: Duration) -> HeldHarness {
    let store = Arc::new(MemoryStore::new());
    store
        .add_user(UserProfile {
            user_id: user("alice"),
            email: "alice@example.com".to_string(),
            display_name: "alice".to_string(),
        })
        .await;
    let (tx, entered) = mpsc::unbounded_channel();
    let gateway = Arc::new(HeldGateway {
        signer: MockGateway::new("whsec_test"),
        entered: tx,
        release: Notify::new(),
        answer: GatewayOutcome {
            gateway_ref: gateway_ref.to_string(),
            status: GatewayStatus::Succeeded,
            failure_reason: None,
        },
    });
    let engine = TransferEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        gateway.clone(),
        Arc::new(RateTable::new()),
        EngineSettings {
            gateway_timeout: timeout,
            ..Default::default()
        },
    );
    HeldHarness {
        store,
        gateway,
        engine: Arc::new(engine),
        entered,
    }
}

impl HeldHarness {
    async fn deliver(&self, event: WebhookEvent) -> EventEffect {
        let (body, signature) = self.gateway.signer.signed_webhook(&event).unwrap();
        self.engine.handle_webhook(&body, &signature).await.unwrap().effect
    }
}

fn card_deposit(name: &str, amount: &str) -> DepositCommand {
    DepositCommand {
        user_id: user(name),
        amount: dec(amount),
        currency: Currency::Usd,
        payment_method: PaymentMethod::Card,
        method_token: Some("tok_visa".to_string()),
        gateway_ref: None,
        notes: None,
    }
}

/// Charge webhook carrying our row id, as the processor sends it
fn charge_for(event_id: &str, gateway_ref: &str, id: TransactionId, amount: &str) -> WebhookEvent {
    WebhookEvent {
        user_id: Some(user("alice")),
        transaction_id: Some(id),
        ..charge_event(event_id, gateway_ref, amount)
    }
}

fn payout_event(event_id: &str, kind: WebhookEventKind, gateway_ref: &str, id: TransactionId) -> WebhookEvent {
    WebhookEvent {
        event_id: event_id.to_string(),
        kind,
        gateway_ref: gateway_ref.to_string(),
        amount: None,
        currency: None,
        user_id: Some(user("alice")),
        transaction_id: Some(id),
        failure_reason: Some("account closed".to_string()),
    }
}

#[tokio::test]
async fn webhook_during_charge_call_credits_once() {
    let mut h = held_harness("ch_held_1", Duration::from_secs(5)).await;
    let deposit = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.deposit(card_deposit("alice", "50")).await })
    };
    let id = h.entered.recv().await.unwrap();

    assert_eq!(
        h.deliver(charge_for("evt_a", "ch_held_1", id, "50")).await,
        EventEffect::Applied
    );
    h.gateway.release.notify_one();

    let tx = deposit.await.unwrap().unwrap();
    assert_eq!(tx.id, id);
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.gateway_ref.as_deref(), Some("ch_held_1"));
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("50"));
    assert_eq!(h.store.transaction_count().await, 1);
}

#[tokio::test]
async fn webhook_during_timed_out_charge_credits_once() {
    let mut h = held_harness("ch_held_2", Duration::from_millis(300)).await;
    let deposit = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.deposit(card_deposit("alice", "50")).await })
    };
    let id = h.entered.recv().await.unwrap();
    assert_eq!(
        h.deliver(charge_for("evt_a", "ch_held_2", id, "50")).await,
        EventEffect::Applied
    );

    // Never released: the call times out and reports the settled row
    let tx = deposit.await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);

    assert_eq!(
        h.deliver(charge_for("evt_b", "ch_held_2", id, "50")).await,
        EventEffect::Duplicate
    );
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("50"));
    assert_eq!(h.store.transaction_count().await, 1);
}

#[tokio::test]
async fn webhook_after_charge_timeout_settles_pending_row() {
    let mut h = held_harness("ch_held_3", Duration::from_millis(50)).await;
    let pending = h.engine.deposit(card_deposit("alice", "50")).await.unwrap();
    let id = h.entered.recv().await.unwrap();
    assert_eq!(pending.id, id);
    assert_eq!(pending.status, TransactionStatus::Pending);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, Decimal::ZERO);

    assert_eq!(
        h.deliver(charge_for("evt_a", "ch_held_3", id, "50")).await,
        EventEffect::Applied
    );
    assert_eq!(
        h.deliver(charge_for("evt_b", "ch_held_3", id, "50")).await,
        EventEffect::Duplicate
    );
    let row = h.engine.get_transaction(&user("alice"), id).await.unwrap();
    assert_eq!(row.status, TransactionStatus::Completed);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("50"));
    assert_eq!(h.store.transaction_count().await, 1);
}

#[tokio::test]
async fn payout_webhook_during_payout_call_reports_success() {
    let mut h = held_harness("po_held_1", Duration::from_secs(5)).await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "100", Currency::Usd).await;

    let withdrawal = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.withdraw(bank_withdraw("alice", "30")).await })
    };
    let id = h.entered.recv().await.unwrap();
    assert_eq!(
        h.deliver(payout_event("evt_p", WebhookEventKind::PayoutPaid, "po_held_1", id))
            .await,
        EventEffect::Applied
    );
    h.gateway.release.notify_one();

    let tx = withdrawal.await.unwrap().unwrap();
    assert_eq!(tx.id, id);
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("70"));
}

#[tokio::test]
async fn failed_payout_webhook_during_payout_call_reports_failure() {
    let mut h = held_harness("po_held_2", Duration::from_secs(5)).await;
    authorize(&h.engine, "alice").await;
    fund(&h.engine, "alice", "100", Currency::Usd).await;

    let withdrawal = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.withdraw(bank_withdraw("alice", "30")).await })
    };
    let id = h.entered.recv().await.unwrap();
    assert_eq!(
        h.deliver(payout_event("evt_p", WebhookEventKind::PayoutFailed, "po_held_2", id))
            .await,
        EventEffect::Applied
    );
    h.gateway.release.notify_one();

    let err = withdrawal.await.unwrap().unwrap_err();
    assert!(matches!(err, WalletError::PaymentGatewayError(_)));
    let row = h.engine.get_transaction(&user("alice"), id).await.unwrap();
    assert_eq!(row.status, TransactionStatus::Failed);
    assert_eq!(balance(&h.engine, "alice", Currency::Usd).await, dec("100"));
}
