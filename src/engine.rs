//! Transfer Engine
//!
//! Orchestrates every user-facing money movement on top of the ledger,
//! journal, verification gate and payment gateway.
//!
//! # Gateway-backed flows
//!
//! No balance lock is held across a processor call.
//!
//! - Deposit: journal a `pending` row, then charge. Success credits the row
//!   and completes it in one batch; a pending or indeterminate charge leaves
//!   it `pending` for the webhook; a declined charge marks it `failed`.
//! - Withdraw: reserve first (debit + `pending` row, committed), then pay out.
//!   A failed payout is compensated by crediting the reserve back and marking
//!   the row `failed` in the same batch.
//!
//! The row exists before the processor is called, so a webhook racing the
//! call settles that row. Both paths move it by status CAS; the loser reloads
//! and reports the winner's result.
//!
//! # Webhooks
//!
//! Settlement is idempotent twice over: processed event ids are remembered in
//! a [`TtlStore`], and every settlement is a status compare-and-swap, so a
//! replay that slips past the cache fails the CAS instead of moving money.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::cache::{DEFAULT_EVENT_TTL, MemoryTtlStore, TtlStore};
use crate::core_types::{RequestId, TransactionId, TransferId, UserId};
use crate::currency::{Currency, RateTable};
use crate::error::{WalletError, WalletResult};
use crate::journal::{EntryBuilder, HistoryPage, Journal, entry};
use crate::ledger::{DEFAULT_MAX_RETRIES, Ledger, LedgerBatch, LockTable};
use crate::models::{
    Account, MoneyRequest, PaymentMethod, RequestDirection, RequestStatus, Transaction,
    TransactionStatus, TransactionType, VerificationKind, VerificationRecord, VerificationStatus,
};
use crate::money::{round_money, validate_amount};
use crate::payment::{
    ChargeRequest, GatewayError, GatewayOutcome, GatewayStatus, PaymentGateway, PayoutRequest,
    WebhookEvent, webhook::WebhookEventKind,
};
use crate::store::{
    LedgerRepository, Page, RequestStatusUpdate, TransactionFilter, TransactionStatusUpdate,
    UserDirectory, VerificationRepository,
};
use crate::verification::VerificationGate;

/// Tunables
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on one processor call
    pub gateway_timeout: Duration,
    /// How long processed webhook event ids are remembered
    pub webhook_event_ttl: Duration,
    pub max_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(10),
            webhook_event_ttl: DEFAULT_EVENT_TTL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

// ============================================================================
// Commands & outcomes
// ============================================================================

/// Counterparty by user id or by email
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Id(UserId),
    Email(String),
}

impl Recipient {
    /// Anything containing `@` is treated as an email address
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.contains('@') {
            Recipient::Email(s.to_string())
        } else {
            Recipient::Id(UserId::new(s))
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepositCommand {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
    /// Card / bank token for a server-side charge
    pub method_token: Option<String>,
    /// Charge already created client-side (hosted checkout)
    pub gateway_ref: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WithdrawCommand {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub payment_method: PaymentMethod,
    pub destination: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendCommand {
    pub sender: UserId,
    pub recipient: Recipient,
    pub amount: Decimal,
    pub currency: Currency,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExchangeCommand {
    pub user_id: UserId,
    pub from: Currency,
    pub to: Currency,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct MoneyRequestCommand {
    pub requester: UserId,
    pub target: Recipient,
    pub amount: Decimal,
    pub currency: Currency,
    pub notes: Option<String>,
}

/// The `send` / `receive` pair of one transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub sent: Transaction,
    pub received: Transaction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOutcome {
    pub transaction: Transaction,
    pub converted_amount: Decimal,
    pub exchange_rate: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementOutcome {
    pub request: MoneyRequest,
    #[serde(flatten)]
    pub transfer: TransferOutcome,
}

/// What a webhook delivery did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventEffect {
    Applied,
    Duplicate,
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub event_id: String,
    pub event_type: String,
    pub effect: EventEffect,
}

// ============================================================================
// Engine
// ============================================================================

pub struct TransferEngine {
    ledger: Arc<Ledger>,
    journal: Journal,
    gate: Arc<VerificationGate>,
    rates: Arc<RateTable>,
    gateway: Arc<dyn PaymentGateway>,
    users: Arc<dyn UserDirectory>,
    seen_events: Arc<dyn TtlStore>,
    /// Serializes webhook settlement per processor object
    webhook_locks: LockTable<String>,
    settings: EngineSettings,
}

impl TransferEngine {
    pub fn new(
        ledger_repo: Arc<dyn LedgerRepository>,
        verification_repo: Arc<dyn VerificationRepository>,
        users: Arc<dyn UserDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        rates: Arc<RateTable>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            ledger: Arc::new(Ledger::new(ledger_repo.clone(), settings.max_retries)),
            journal: Journal::new(ledger_repo, settings.max_retries),
            gate: Arc::new(VerificationGate::new(verification_repo)),
            rates,
            gateway,
            users,
            seen_events: Arc::new(MemoryTtlStore::default()),
            webhook_locks: LockTable::new(),
            settings,
        }
    }

    /// Replace the in-process event de-duplication store
    pub fn with_event_store(mut self, store: Arc<dyn TtlStore>) -> Self {
        self.seen_events = store;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn gate(&self) -> &VerificationGate {
        &self.gate
    }

    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    fn repo(&self) -> &Arc<dyn LedgerRepository> {
        self.ledger.repository()
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub async fn get_account(&self, user_id: &UserId) -> WalletResult<Account> {
        self.ledger.get_or_create_account(user_id).await
    }

    pub async fn get_balance(&self, user_id: &UserId, currency: Currency) -> WalletResult<Decimal> {
        self.ledger.get_balance(user_id, currency).await
    }

    pub async fn history(
        &self,
        user_id: &UserId,
        filter: &TransactionFilter,
        page: Page,
    ) -> WalletResult<HistoryPage> {
        self.journal.query(user_id, filter, page).await
    }

    pub async fn get_transaction(
        &self,
        user_id: &UserId,
        id: TransactionId,
    ) -> WalletResult<Transaction> {
        self.journal.get(id, user_id).await
    }

    // ------------------------------------------------------------------------
    // Deposit
    // ------------------------------------------------------------------------

    pub async fn deposit(&self, cmd: DepositCommand) -> WalletResult<Transaction> {
        let amount = validate_amount(cmd.amount)?;
        let builder = entry(&cmd.user_id, TransactionType::Deposit, amount, cmd.currency)
            .method(cmd.payment_method)
            .notes(cmd.notes.clone());

        if !cmd.payment_method.is_processor_backed() {
            let tx = self
                .credit_new_row(&cmd.user_id, cmd.currency, amount, builder)
                .await?;
            tracing::info!(user_id = %cmd.user_id, reference = %tx.reference, %amount, currency = %cmd.currency, "Deposit completed");
            return Ok(tx);
        }

        // Hosted checkout: the charge exists already, the webhook settles it
        if let Some(gateway_ref) = cmd.gateway_ref.filter(|r| !r.trim().is_empty()) {
            if let Some(existing) = self.repo().find_by_gateway_ref(&gateway_ref).await? {
                if existing.owner_user_id != cmd.user_id {
                    return Err(WalletError::InvalidTransition(
                        "gateway reference belongs to another account".to_string(),
                    ));
                }
                return Ok(existing);
            }
            let tx = self
                .journal
                .record(
                    builder
                        .status(TransactionStatus::Pending)
                        .gateway_ref(Some(gateway_ref)),
                )
                .await?;
            tracing::info!(user_id = %cmd.user_id, reference = %tx.reference, "Deposit awaiting processor confirmation");
            return Ok(tx);
        }

        let method_token = cmd
            .method_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                WalletError::PaymentGatewayError("payment method token required".to_string())
            })?;

        let pending = self
            .journal
            .record(builder.status(TransactionStatus::Pending))
            .await?;
        let request = ChargeRequest {
            transaction_id: pending.id,
            user_id: cmd.user_id.clone(),
            amount,
            currency: cmd.currency,
            method_token,
        };

        match self.call_gateway(self.gateway.charge(&request)).await {
            Ok(GatewayOutcome {
                status: GatewayStatus::Succeeded,
                gateway_ref,
                ..
            }) => {
                let tx = match self.complete_deposit(&pending, &gateway_ref).await? {
                    Some(tx) => tx,
                    None => {
                        let tx = self.settled_elsewhere(pending.id, &gateway_ref).await?;
                        if tx.status == TransactionStatus::Failed {
                            return Err(WalletError::PaymentGatewayError(format!(
                                "{} failed at the processor",
                                tx.reference
                            )));
                        }
                        tx
                    }
                };
                tracing::info!(user_id = %cmd.user_id, reference = %tx.reference, %amount, currency = %cmd.currency, status = %tx.status, "Card deposit completed");
                Ok(tx)
            }
            Ok(GatewayOutcome {
                status: GatewayStatus::Pending,
                gateway_ref,
                ..
            }) => {
                let tx = self
                    .settle_status(&pending, TransactionStatus::Pending, gateway_ref)
                    .await?;
                tracing::info!(user_id = %cmd.user_id, reference = %tx.reference, "Charge pending at processor");
                Ok(tx)
            }
            Ok(GatewayOutcome {
                status: GatewayStatus::Failed,
                gateway_ref,
                failure_reason,
            }) => {
                let reason = failure_reason.unwrap_or_else(|| "charge failed".to_string());
                let tx = self
                    .settle_status(&pending, TransactionStatus::Failed, gateway_ref)
                    .await?;
                if tx.status != TransactionStatus::Failed {
                    return Ok(tx);
                }
                tracing::warn!(user_id = %cmd.user_id, reference = %tx.reference, %reason, "Charge declined");
                Err(WalletError::PaymentGatewayError(reason))
            }
            Err(e) if e.is_indeterminate() => {
                // The charge may exist; its webhook carries our transaction id
                let tx = self.load_transaction(pending.id).await?;
                tracing::warn!(user_id = %cmd.user_id, reference = %tx.reference, status = %tx.status, error = %e, "Charge outcome unknown");
                Ok(tx)
            }
            Err(e) => {
                if let Err(close) = self.transition(&pending, TransactionStatus::Failed, None).await {
                    tracing::warn!(reference = %pending.reference, error = %close, "Could not close deposit after charge error");
                }
                Err(e.into())
            }
        }
    }

    /// Users may abandon a deposit the processor has not confirmed yet
    pub async fn cancel_pending_deposit(
        &self,
        user_id: &UserId,
        id: TransactionId,
    ) -> WalletResult<Transaction> {
        let tx = self.journal.get(id, user_id).await?;
        if &tx.owner_user_id != user_id {
            return Err(WalletError::NotFound(format!("transaction {}", id)));
        }
        if tx.tx_type != TransactionType::Deposit || tx.status != TransactionStatus::Pending {
            return Err(WalletError::InvalidTransition(format!(
                "{} {} cannot be cancelled",
                tx.status, tx.tx_type
            )));
        }
        let cancelled = self
            .transition(&tx, TransactionStatus::Cancelled, None)
            .await?;
        tracing::info!(user_id = %user_id, reference = %tx.reference, "Pending deposit cancelled");
        Ok(cancelled)
    }

    // ------------------------------------------------------------------------
    // Withdraw
    // ------------------------------------------------------------------------

    pub async fn withdraw(&self, cmd: WithdrawCommand) -> WalletResult<Transaction> {
        let amount = validate_amount(cmd.amount)?;
        self.gate.require_authorized(&cmd.user_id).await?;

        let processor = cmd.payment_method.is_processor_backed();
        let destination = cmd.destination.filter(|d| !d.trim().is_empty());
        if processor && destination.is_none() {
            return Err(WalletError::InvalidRecipient(
                "payout destination required".to_string(),
            ));
        }

        let builder = entry(&cmd.user_id, TransactionType::Withdraw, amount, cmd.currency)
            .method(cmd.payment_method)
            .destination(destination.clone())
            .notes(cmd.notes)
            .status(if processor {
                TransactionStatus::Pending
            } else {
                TransactionStatus::Completed
            });

        let user = cmd.user_id.clone();
        let currency = cmd.currency;
        let reserved = self
            .ledger
            .execute(&[(user.clone(), currency)], |batch| {
                batch.debit(&user, currency, amount)?;
                let tx = builder.build();
                batch.record(tx.clone());
                Ok(tx)
            })
            .await?;

        if !processor {
            tracing::info!(user_id = %user, reference = %reserved.reference, %amount, %currency, "Withdrawal completed");
            return Ok(reserved);
        }
        tracing::info!(user_id = %user, reference = %reserved.reference, %amount, %currency, "Withdrawal reserved, paying out");

        let request = PayoutRequest {
            transaction_id: reserved.id,
            user_id: user.clone(),
            amount,
            currency,
            destination: destination.unwrap_or_default(),
        };

        match self.call_gateway(self.gateway.payout(&request)).await {
            Ok(GatewayOutcome {
                status: GatewayStatus::Succeeded,
                gateway_ref,
                ..
            }) => {
                let tx = self
                    .settle_status(&reserved, TransactionStatus::Completed, gateway_ref)
                    .await?;
                tracing::info!(user_id = %user, reference = %tx.reference, status = %tx.status, "Payout completed");
                Ok(tx)
            }
            Ok(GatewayOutcome {
                status: GatewayStatus::Pending,
                gateway_ref,
                ..
            }) => {
                let tx = self
                    .settle_status(&reserved, TransactionStatus::Processing, gateway_ref)
                    .await?;
                tracing::info!(user_id = %user, reference = %tx.reference, status = %tx.status, "Payout processing at processor");
                Ok(tx)
            }
            Ok(GatewayOutcome {
                status: GatewayStatus::Failed,
                gateway_ref,
                failure_reason,
            }) => {
                let reason = failure_reason.unwrap_or_else(|| "payout failed".to_string());
                self.fail_withdrawal(&reserved, Some(gateway_ref), reason).await
            }
            Err(e) if e.is_indeterminate() => {
                let tx = self.load_transaction(reserved.id).await?;
                tracing::warn!(user_id = %user, reference = %tx.reference, status = %tx.status, error = %e, "Payout outcome unknown, left for reconciliation");
                Ok(tx)
            }
            Err(e) => self.fail_withdrawal(&reserved, None, e.to_string()).await,
        }
    }

    /// Compensate after the processor refused a payout. A webhook that
    /// already settled the row wins.
    async fn fail_withdrawal(
        &self,
        reserved: &Transaction,
        gateway_ref: Option<String>,
        reason: String,
    ) -> WalletResult<Transaction> {
        match self
            .compensate_withdrawal(reserved, gateway_ref, &reason)
            .await
        {
            Ok(()) => Err(WalletError::PaymentGatewayError(reason)),
            Err(WalletError::InvalidTransition(_)) => {
                let tx = self.load_transaction(reserved.id).await?;
                match tx.status {
                    TransactionStatus::Failed | TransactionStatus::Cancelled => {
                        Err(WalletError::PaymentGatewayError(reason))
                    }
                    _ => Ok(tx),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Credit the reserve back and mark the row failed, atomically
    async fn compensate_withdrawal(
        &self,
        tx: &Transaction,
        gateway_ref: Option<String>,
        reason: &str,
    ) -> WalletResult<()> {
        let owner = tx.owner_user_id.clone();
        let currency = tx.currency_from;
        self.ledger
            .execute(&[(owner.clone(), currency)], |batch| {
                batch.credit(&owner, currency, tx.amount)?;
                batch.update_transaction(TransactionStatusUpdate {
                    id: tx.id,
                    expected: tx.status,
                    next: TransactionStatus::Failed,
                    gateway_ref: gateway_ref.clone(),
                });
                Ok(())
            })
            .await?;
        tracing::warn!(user_id = %owner, reference = %tx.reference, amount = %tx.amount, %currency, reason, "Withdrawal failed, reserve credited back");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Peer-to-peer
    // ------------------------------------------------------------------------

    pub async fn send_money(&self, cmd: SendCommand) -> WalletResult<TransferOutcome> {
        let amount = validate_amount(cmd.amount)?;
        self.gate.require_authorized(&cmd.sender).await?;
        let recipient = self.resolve_recipient(&cmd.sender, &cmd.recipient).await?;

        let sender = cmd.sender;
        let currency = cmd.currency;
        let notes = cmd.notes;
        let outcome = self
            .ledger
            .execute(
                &[(sender.clone(), currency), (recipient.clone(), currency)],
                |batch| stage_transfer(batch, &sender, &recipient, amount, currency, &notes, None),
            )
            .await?;
        tracing::info!(
            sender = %sender,
            recipient = %recipient,
            %amount,
            %currency,
            reference = %outcome.sent.reference,
            "Transfer completed"
        );
        Ok(outcome)
    }

    async fn resolve_recipient(&self, caller: &UserId, recipient: &Recipient) -> WalletResult<UserId> {
        let profile = match recipient {
            Recipient::Id(id) => self.users.find_by_id(id).await?,
            Recipient::Email(email) => self.users.find_by_email(email).await?,
        };
        let profile =
            profile.ok_or_else(|| WalletError::InvalidRecipient("recipient not found".to_string()))?;
        if &profile.user_id == caller {
            return Err(WalletError::InvalidRecipient(
                "cannot transfer to yourself".to_string(),
            ));
        }
        Ok(profile.user_id)
    }

    // ------------------------------------------------------------------------
    // Exchange
    // ------------------------------------------------------------------------

    pub async fn exchange(&self, cmd: ExchangeCommand) -> WalletResult<ExchangeOutcome> {
        if cmd.from == cmd.to {
            return Err(WalletError::InvalidExchange(
                "source and target currency must differ".to_string(),
            ));
        }
        let amount = validate_amount(cmd.amount)?;
        let rate = self.rates.try_rate(cmd.from, cmd.to).ok_or_else(|| {
            WalletError::UnsupportedCurrencyPair {
                from: cmd.from.to_string(),
                to: cmd.to.to_string(),
            }
        })?;
        let converted = round_money(amount * rate);
        if converted <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount(
                "amount too small to convert".to_string(),
            ));
        }

        let user = cmd.user_id;
        let (from, to) = (cmd.from, cmd.to);
        let transaction = self
            .ledger
            .execute(&[(user.clone(), from), (user.clone(), to)], |batch| {
                batch.debit(&user, from, amount)?;
                batch.credit(&user, to, converted)?;
                let tx = entry(&user, TransactionType::Exchange, amount, from)
                    .exchange(to, rate, converted)
                    .build();
                batch.record(tx.clone());
                Ok(tx)
            })
            .await?;
        tracing::info!(user_id = %user, %from, %to, %amount, %converted, %rate, reference = %transaction.reference, "Exchange completed");
        Ok(ExchangeOutcome {
            transaction,
            converted_amount: converted,
            exchange_rate: rate,
        })
    }

    // ------------------------------------------------------------------------
    // Money requests
    // ------------------------------------------------------------------------

    pub async fn request_money(&self, cmd: MoneyRequestCommand) -> WalletResult<MoneyRequest> {
        let amount = validate_amount(cmd.amount)?;
        let target = self.resolve_recipient(&cmd.requester, &cmd.target).await?;
        let now = chrono::Utc::now();
        let request = MoneyRequest {
            id: RequestId::new(),
            requester_user_id: cmd.requester.clone(),
            target_user_id: target,
            amount,
            currency: cmd.currency,
            notes: cmd.notes,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.ledger
            .execute(&[], |batch| {
                batch.insert_request(request.clone());
                Ok(())
            })
            .await?;
        tracing::info!(id = %request.id, requester = %request.requester_user_id, target = %request.target_user_id, %amount, "Money request created");
        Ok(request)
    }

    /// Settle a request addressed to `payer`; behaves like a transfer
    pub async fn pay_money_request(
        &self,
        payer: &UserId,
        id: RequestId,
    ) -> WalletResult<SettlementOutcome> {
        let request = self.request_addressed_to(payer, id).await?;
        if request.status != RequestStatus::Pending {
            return Err(WalletError::AlreadySettled);
        }
        self.gate.require_authorized(payer).await?;

        let requester = request.requester_user_id.clone();
        let currency = request.currency;
        let notes = request.notes.clone();
        let transfer = self
            .ledger
            .execute(
                &[(payer.clone(), currency), (requester.clone(), currency)],
                |batch| {
                    let outcome = stage_transfer(
                        batch,
                        payer,
                        &requester,
                        request.amount,
                        currency,
                        &notes,
                        Some(id),
                    )?;
                    batch.update_request(RequestStatusUpdate {
                        id,
                        expected: RequestStatus::Pending,
                        next: RequestStatus::Completed,
                    });
                    Ok(outcome)
                },
            )
            .await
            .map_err(settled_on_conflict)?;

        let request = self.load_request(id).await?;
        tracing::info!(%id, payer = %payer, requester = %requester, reference = %transfer.sent.reference, "Money request paid");
        Ok(SettlementOutcome { request, transfer })
    }

    pub async fn reject_money_request(
        &self,
        target: &UserId,
        id: RequestId,
    ) -> WalletResult<MoneyRequest> {
        let request = self.request_addressed_to(target, id).await?;
        if request.status != RequestStatus::Pending {
            return Err(WalletError::AlreadySettled);
        }
        self.ledger
            .execute(&[], |batch| {
                batch.update_request(RequestStatusUpdate {
                    id,
                    expected: RequestStatus::Pending,
                    next: RequestStatus::Rejected,
                });
                Ok(())
            })
            .await
            .map_err(settled_on_conflict)?;
        tracing::info!(%id, target = %target, "Money request rejected");
        self.load_request(id).await
    }

    pub async fn list_money_requests(
        &self,
        user_id: &UserId,
        direction: RequestDirection,
        status: Option<RequestStatus>,
    ) -> WalletResult<Vec<MoneyRequest>> {
        Ok(self
            .repo()
            .list_money_requests(user_id, direction, status)
            .await?)
    }

    async fn load_request(&self, id: RequestId) -> WalletResult<MoneyRequest> {
        self.repo()
            .get_money_request(id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("money request {}", id)))
    }

    /// Requests are only visible to their target here
    async fn request_addressed_to(&self, user_id: &UserId, id: RequestId) -> WalletResult<MoneyRequest> {
        let request = self.load_request(id).await?;
        if &request.target_user_id != user_id {
            return Err(WalletError::NotFound(format!("money request {}", id)));
        }
        Ok(request)
    }

    // ------------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------------

    pub async fn is_authorized(&self, user_id: &UserId) -> WalletResult<bool> {
        self.gate.is_authorized(user_id).await
    }

    pub async fn submit_verification(
        &self,
        user_id: &UserId,
        kind: VerificationKind,
        document_ref: &str,
    ) -> WalletResult<VerificationRecord> {
        self.gate.submit(user_id, kind, document_ref).await
    }

    pub async fn review_verification(
        &self,
        id: crate::core_types::VerificationId,
        kind: VerificationKind,
        status: VerificationStatus,
        notes: Option<String>,
    ) -> WalletResult<VerificationRecord> {
        self.gate.review(id, kind, status, notes).await
    }

    pub async fn list_verifications(
        &self,
        kind: Option<VerificationKind>,
        status: Option<VerificationStatus>,
    ) -> WalletResult<Vec<VerificationRecord>> {
        self.gate.list(kind, status).await
    }

    // ------------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------------

    /// Authenticate, de-duplicate and apply one processor callback
    pub async fn handle_webhook(&self, raw_payload: &[u8], signature: &str) -> WalletResult<WebhookAck> {
        let event = self
            .gateway
            .verify_webhook(raw_payload, signature)
            .map_err(|e| {
                tracing::warn!(error = %e, "Rejected webhook");
                WalletError::from(e)
            })?;

        let ack = |effect| WebhookAck {
            event_id: event.event_id.clone(),
            event_type: event.kind.as_str().to_string(),
            effect,
        };

        if self.seen_events.contains(&event.event_id).await {
            tracing::warn!(event_id = %event.event_id, "Duplicate webhook delivery acknowledged");
            return Ok(ack(EventEffect::Duplicate));
        }

        let _guard = self.webhook_locks.lock(event.gateway_ref.clone()).await;

        let effect = self.apply_event(&event).await?;
        self.seen_events
            .insert(&event.event_id, self.settings.webhook_event_ttl)
            .await;
        tracing::info!(event_id = %event.event_id, event_type = %event.kind.as_str(), gateway_ref = %event.gateway_ref, ?effect, "Webhook processed");
        Ok(ack(effect))
    }

    async fn apply_event(&self, event: &WebhookEvent) -> WalletResult<EventEffect> {
        let existing = match self.repo().find_by_gateway_ref(&event.gateway_ref).await? {
            Some(tx) => Some(tx),
            None => match event.transaction_id {
                Some(id) => self.repo().get_transaction(id).await?,
                None => None,
            },
        };

        match &event.kind {
            WebhookEventKind::ChargeSucceeded => self.settle_charge(event, existing).await,
            WebhookEventKind::ChargeFailed => self.fail_charge(event, existing).await,
            WebhookEventKind::PayoutPaid => self.settle_payout(event, existing).await,
            WebhookEventKind::PayoutFailed => self.fail_payout(event, existing).await,
            WebhookEventKind::Unhandled(kind) => {
                tracing::debug!(event_type = %kind, "Ignoring webhook event type");
                Ok(EventEffect::Ignored)
            }
        }
    }

    async fn settle_charge(
        &self,
        event: &WebhookEvent,
        existing: Option<Transaction>,
    ) -> WalletResult<EventEffect> {
        let Some(tx) = existing else {
            return self.record_unmatched_charge(event).await;
        };
        if tx.tx_type != TransactionType::Deposit {
            tracing::warn!(gateway_ref = %event.gateway_ref, reference = %tx.reference, "Charge event matched a non-deposit row");
            return Ok(EventEffect::Ignored);
        }
        if let Some(amount) = event.amount.filter(|a| *a != tx.amount) {
            tracing::warn!(reference = %tx.reference, recorded = %tx.amount, charged = %amount, "Charged amount differs from recorded deposit");
        }

        match tx.status {
            TransactionStatus::Completed => Ok(EventEffect::Duplicate),
            TransactionStatus::Pending | TransactionStatus::Processing => {
                match self.complete_deposit(&tx, &event.gateway_ref).await? {
                    Some(_) => {
                        tracing::info!(user_id = %tx.owner_user_id, reference = %tx.reference, amount = %tx.amount, currency = %tx.currency_from, "Deposit settled by webhook");
                        Ok(EventEffect::Applied)
                    }
                    None => Ok(EventEffect::Duplicate),
                }
            }
            TransactionStatus::Failed | TransactionStatus::Cancelled => {
                tracing::error!(reference = %tx.reference, status = %tx.status, gateway_ref = %event.gateway_ref, "Charge succeeded for a closed deposit, manual reconciliation required");
                Ok(EventEffect::Ignored)
            }
        }
    }

    /// Hosted-checkout charge we never saw: book it from metadata
    async fn record_unmatched_charge(&self, event: &WebhookEvent) -> WalletResult<EventEffect> {
        let (Some(user_id), Some(amount), Some(currency)) =
            (event.user_id.clone(), event.amount, event.currency)
        else {
            tracing::warn!(gateway_ref = %event.gateway_ref, "Unmatched charge without metadata ignored");
            return Ok(EventEffect::Ignored);
        };
        let amount = validate_amount(amount)?;
        let mut builder = entry(&user_id, TransactionType::Deposit, amount, currency)
            .method(PaymentMethod::Card)
            .gateway_ref(Some(event.gateway_ref.clone()));
        if let Some(id) = event.transaction_id {
            builder = builder.id(id);
        }
        match self
            .credit_new_row(&user_id, currency, amount, builder)
            .await
        {
            Ok(tx) => {
                tracing::info!(user_id = %user_id, reference = %tx.reference, %amount, %currency, "Deposit booked from webhook");
                Ok(EventEffect::Applied)
            }
            // Row id already taken: another path recorded this charge
            Err(WalletError::InvalidTransition(_)) => Ok(EventEffect::Duplicate),
            Err(e) => Err(e),
        }
    }

    async fn fail_charge(
        &self,
        event: &WebhookEvent,
        existing: Option<Transaction>,
    ) -> WalletResult<EventEffect> {
        let Some(tx) = existing.filter(|t| t.tx_type == TransactionType::Deposit) else {
            return Ok(EventEffect::Ignored);
        };
        match tx.status {
            TransactionStatus::Failed => Ok(EventEffect::Duplicate),
            TransactionStatus::Pending | TransactionStatus::Processing => {
                match self
                    .transition(&tx, TransactionStatus::Failed, Some(event.gateway_ref.clone()))
                    .await
                {
                    Ok(_) => {
                        tracing::warn!(reference = %tx.reference, reason = ?event.failure_reason, "Deposit charge failed");
                        Ok(EventEffect::Applied)
                    }
                    Err(WalletError::InvalidTransition(_)) => Ok(EventEffect::Duplicate),
                    Err(e) => Err(e),
                }
            }
            TransactionStatus::Completed => {
                tracing::error!(reference = %tx.reference, "Charge failed after deposit was credited, manual reconciliation required");
                Ok(EventEffect::Ignored)
            }
            TransactionStatus::Cancelled => Ok(EventEffect::Ignored),
        }
    }

    async fn settle_payout(
        &self,
        event: &WebhookEvent,
        existing: Option<Transaction>,
    ) -> WalletResult<EventEffect> {
        let Some(tx) = existing.filter(|t| t.tx_type == TransactionType::Withdraw) else {
            tracing::warn!(gateway_ref = %event.gateway_ref, "Payout event without matching withdrawal");
            return Ok(EventEffect::Ignored);
        };
        match tx.status {
            TransactionStatus::Completed => Ok(EventEffect::Duplicate),
            TransactionStatus::Pending | TransactionStatus::Processing => {
                match self
                    .transition(&tx, TransactionStatus::Completed, Some(event.gateway_ref.clone()))
                    .await
                {
                    Ok(_) => {
                        tracing::info!(reference = %tx.reference, "Payout confirmed by webhook");
                        Ok(EventEffect::Applied)
                    }
                    Err(WalletError::InvalidTransition(_)) => Ok(EventEffect::Duplicate),
                    Err(e) => Err(e),
                }
            }
            TransactionStatus::Failed | TransactionStatus::Cancelled => {
                tracing::error!(reference = %tx.reference, status = %tx.status, "Payout paid after the withdrawal was closed, manual reconciliation required");
                Ok(EventEffect::Ignored)
            }
        }
    }

    async fn fail_payout(
        &self,
        event: &WebhookEvent,
        existing: Option<Transaction>,
    ) -> WalletResult<EventEffect> {
        let Some(tx) = existing.filter(|t| t.tx_type == TransactionType::Withdraw) else {
            tracing::warn!(gateway_ref = %event.gateway_ref, "Payout event without matching withdrawal");
            return Ok(EventEffect::Ignored);
        };
        match tx.status {
            TransactionStatus::Failed => Ok(EventEffect::Duplicate),
            TransactionStatus::Pending | TransactionStatus::Processing => {
                let reason = event
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "payout failed".to_string());
                match self
                    .compensate_withdrawal(&tx, Some(event.gateway_ref.clone()), &reason)
                    .await
                {
                    Ok(()) => Ok(EventEffect::Applied),
                    Err(WalletError::InvalidTransition(_)) => Ok(EventEffect::Duplicate),
                    Err(e) => Err(e),
                }
            }
            TransactionStatus::Completed | TransactionStatus::Cancelled => {
                tracing::error!(reference = %tx.reference, status = %tx.status, "Payout failed after completion, manual reconciliation required");
                Ok(EventEffect::Ignored)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn call_gateway<F>(&self, call: F) -> Result<GatewayOutcome, GatewayError>
    where
        F: std::future::Future<Output = Result<GatewayOutcome, GatewayError>>,
    {
        tokio::time::timeout(self.settings.gateway_timeout, call)
            .await
            .unwrap_or(Err(GatewayError::Timeout))
    }

    /// Credit one slot and journal the row in the same batch
    async fn credit_new_row(
        &self,
        user_id: &UserId,
        currency: Currency,
        amount: Decimal,
        builder: EntryBuilder,
    ) -> WalletResult<Transaction> {
        self.ledger
            .execute(&[(user_id.clone(), currency)], |batch| {
                batch.credit(user_id, currency, amount)?;
                let tx = builder.build();
                batch.record(tx.clone());
                Ok(tx)
            })
            .await
    }

    /// Status CAS from the row's current status
    async fn transition(
        &self,
        tx: &Transaction,
        next: TransactionStatus,
        gateway_ref: Option<String>,
    ) -> WalletResult<Transaction> {
        if !tx.status.can_transition_to(next) {
            return Err(WalletError::InvalidTransition(format!(
                "{} -> {}",
                tx.status, next
            )));
        }
        self.swap_status(tx, next, gateway_ref).await?;
        self.load_transaction(tx.id).await
    }

    async fn swap_status(
        &self,
        tx: &Transaction,
        next: TransactionStatus,
        gateway_ref: Option<String>,
    ) -> WalletResult<()> {
        self.ledger
            .execute(&[], |batch| {
                batch.update_transaction(TransactionStatusUpdate {
                    id: tx.id,
                    expected: tx.status,
                    next,
                    gateway_ref: gateway_ref.clone(),
                });
                Ok(())
            })
            .await
    }

    /// Apply a synchronous processor result to a row a webhook may have
    /// settled meanwhile. `next == tx.status` only records the gateway ref.
    async fn settle_status(
        &self,
        tx: &Transaction,
        next: TransactionStatus,
        gateway_ref: String,
    ) -> WalletResult<Transaction> {
        if next != tx.status && !tx.status.can_transition_to(next) {
            return Err(WalletError::InvalidTransition(format!(
                "{} -> {}",
                tx.status, next
            )));
        }
        match self.swap_status(tx, next, Some(gateway_ref.clone())).await {
            Ok(()) => self.load_transaction(tx.id).await,
            Err(WalletError::InvalidTransition(_)) => {
                let current = self.settled_elsewhere(tx.id, &gateway_ref).await?;
                if current.status == TransactionStatus::Failed && next != TransactionStatus::Failed {
                    return Err(WalletError::PaymentGatewayError(format!(
                        "{} failed at the processor",
                        current.reference
                    )));
                }
                Ok(current)
            }
            Err(e) => Err(e),
        }
    }

    /// Credit a pending deposit and complete its row in one batch.
    /// `None` when another path moved the row first.
    async fn complete_deposit(
        &self,
        tx: &Transaction,
        gateway_ref: &str,
    ) -> WalletResult<Option<Transaction>> {
        let owner = tx.owner_user_id.clone();
        let currency = tx.currency_from;
        let result = self
            .ledger
            .execute(&[(owner.clone(), currency)], |batch| {
                batch.credit(&owner, currency, tx.amount)?;
                batch.update_transaction(TransactionStatusUpdate {
                    id: tx.id,
                    expected: tx.status,
                    next: TransactionStatus::Completed,
                    gateway_ref: Some(gateway_ref.to_string()),
                });
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(Some(self.load_transaction(tx.id).await?)),
            Err(WalletError::InvalidTransition(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reload a row whose CAS lost to a concurrent settlement
    async fn settled_elsewhere(&self, id: TransactionId, gateway_ref: &str) -> WalletResult<Transaction> {
        let tx = self.load_transaction(id).await?;
        if tx.gateway_ref.as_deref().is_some_and(|r| r != gateway_ref) {
            tracing::error!(reference = %tx.reference, recorded = ?tx.gateway_ref, reported = gateway_ref, "Processor reference mismatch, manual reconciliation required");
        }
        if tx.status == TransactionStatus::Cancelled {
            tracing::error!(reference = %tx.reference, gateway_ref, "Processor settled a cancelled row, manual reconciliation required");
            return Err(WalletError::InvalidTransition(format!(
                "transaction {} was cancelled",
                tx.reference
            )));
        }
        Ok(tx)
    }

    async fn load_transaction(&self, id: TransactionId) -> WalletResult<Transaction> {
        self.repo()
            .get_transaction(id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("transaction {}", id)))
    }
}

/// Stage a debit, a credit and the paired rows of one transfer
fn stage_transfer(
    batch: &mut LedgerBatch,
    sender: &UserId,
    recipient: &UserId,
    amount: Decimal,
    currency: Currency,
    notes: &Option<String>,
    request_id: Option<RequestId>,
) -> WalletResult<TransferOutcome> {
    batch.debit(sender, currency, amount)?;
    batch.credit(recipient, currency, amount)?;

    let transfer_id = TransferId::new();
    let mut sent = entry(sender, TransactionType::Send, amount, currency)
        .counterparty(recipient)
        .notes(notes.clone())
        .transfer(transfer_id);
    let mut received = entry(recipient, TransactionType::Receive, amount, currency)
        .counterparty(sender)
        .notes(notes.clone())
        .transfer(transfer_id);
    if let Some(id) = request_id {
        sent = sent.request(id);
        received = received.request(id);
    }

    let sent = sent.build();
    let received = received.build();
    batch.record(sent.clone());
    batch.record(received.clone());
    Ok(TransferOutcome { sent, received })
}

/// A lost request-status CAS means someone settled it first
fn settled_on_conflict(e: WalletError) -> WalletError {
    match e {
        WalletError::InvalidTransition(_) => WalletError::AlreadySettled,
        other => other,
    }
}
