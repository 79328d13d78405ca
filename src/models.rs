//! Ledger data model
//!
//! `Account` is owned by the ledger, `Transaction` by the journal and
//! `MoneyRequest` / `VerificationRecord` by their respective services. They
//! share `UserId` keys but are separate aggregates; every write touching more
//! than one of them goes through a single `CommitBatch`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{RequestId, TransactionId, TransferId, UserId, VerificationId};
use crate::currency::Currency;

// ============================================================================
// Enumerations
// ============================================================================

/// Kind of journaled money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Withdraw,
    Exchange,
    Send,
    Receive,
}

impl TransactionType {
    /// Leading letter of the human-readable reference
    pub fn initial(&self) -> char {
        match self {
            TransactionType::Deposit => 'D',
            TransactionType::Withdraw => 'W',
            TransactionType::Exchange => 'E',
            TransactionType::Send => 'S',
            TransactionType::Receive => 'R',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdraw => "withdraw",
            TransactionType::Exchange => "exchange",
            TransactionType::Send => "send",
            TransactionType::Receive => "receive",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deposit" => Ok(TransactionType::Deposit),
            "withdraw" => Ok(TransactionType::Withdraw),
            "exchange" => Ok(TransactionType::Exchange),
            "send" => Ok(TransactionType::Send),
            "receive" => Ok(TransactionType::Receive),
            _ => Err(format!("Invalid transaction type: {}", s)),
        }
    }
}

/// How money entered or left the wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Bank,
    #[default]
    Wallet,
    Cash,
}

impl PaymentMethod {
    /// Card and bank movements go through the external payment processor
    pub fn is_processor_backed(&self) -> bool {
        matches!(self, PaymentMethod::Card | PaymentMethod::Bank)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Bank => "bank",
            PaymentMethod::Wallet => "wallet",
            PaymentMethod::Cash => "cash",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "card" => Ok(PaymentMethod::Card),
            "bank" => Ok(PaymentMethod::Bank),
            "wallet" => Ok(PaymentMethod::Wallet),
            "cash" => Ok(PaymentMethod::Cash),
            _ => Err(format!("Invalid payment method: {}", s)),
        }
    }
}

/// Transaction lifecycle
///
/// ```text
/// PENDING ──┬──▶ COMPLETED
///           ├──▶ PROCESSING
///           ├──▶ FAILED
///           └──▶ CANCELLED
/// PROCESSING ──┬──▶ COMPLETED
///              └──▶ FAILED
/// ```
/// Synchronous wallet-funded operations are created directly as COMPLETED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "processing" => Ok(TransactionStatus::Processing),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

/// Money request lifecycle: `pending → completed | rejected`, both terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Completed,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Completed => "completed",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "completed" => Ok(RequestStatus::Completed),
            "rejected" => Ok(RequestStatus::Rejected),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

/// The two independent verification documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationKind {
    /// Passport / national identity document
    #[serde(alias = "passport")]
    Identity,
    /// Firearm license document
    #[serde(alias = "gun")]
    License,
}

impl VerificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationKind::Identity => "identity",
            VerificationKind::License => "license",
        }
    }

    /// The kind that must also be verified for the gate to open
    pub fn other(&self) -> VerificationKind {
        match self {
            VerificationKind::Identity => VerificationKind::License,
            VerificationKind::License => VerificationKind::Identity,
        }
    }
}

impl fmt::Display for VerificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "identity" | "passport" => Ok(VerificationKind::Identity),
            "license" | "gun" => Ok(VerificationKind::License),
            _ => Err(format!("Invalid verification kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Rejected,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VerificationStatus::Pending),
            "verified" => Ok(VerificationStatus::Verified),
            "rejected" => Ok(VerificationStatus::Rejected),
            _ => Err(format!("Invalid verification status: {}", s)),
        }
    }
}

// ============================================================================
// Account
// ============================================================================

/// One currency slot of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub currency: Currency,
    pub amount: Decimal,
    /// Optimistic-concurrency version, bumped on every committed write
    #[serde(skip)]
    pub version: i64,
}

/// Per-user multi-currency balance record
///
/// # Invariants
/// - One entry per supported currency, no duplicates
/// - Every `amount >= 0` after any committed operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user_id: UserId,
    pub balances: Vec<BalanceEntry>,
    /// Set by the verification gate when both documents are verified
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// A fresh account with every supported currency at zero
    pub fn zeroed(user_id: UserId) -> Self {
        Self {
            user_id,
            balances: Currency::ALL
                .iter()
                .map(|c| BalanceEntry {
                    currency: *c,
                    amount: crate::money::round_money(Decimal::ZERO),
                    version: 0,
                })
                .collect(),
            verified: false,
            created_at: Utc::now(),
        }
    }

    pub fn entry(&self, currency: Currency) -> Option<&BalanceEntry> {
        self.balances.iter().find(|b| b.currency == currency)
    }

    /// Balance in `currency`, zero when the entry is absent
    pub fn balance(&self, currency: Currency) -> Decimal {
        self.entry(currency).map(|b| b.amount).unwrap_or(Decimal::ZERO)
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// One journaled money movement
///
/// Immutable once created except for `status`, `gatewayRef` (and `updatedAt`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub owner_user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_user_id: Option<UserId>,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub fee: Decimal,
    /// Currency of `amount` (the source currency for an exchange)
    pub currency_from: Currency,
    /// Exchange only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_to: Option<Currency>,
    /// Exchange only, frozen at execution time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_rate: Option<Decimal>,
    /// Exchange only, the credited amount in `currency_to`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_amount: Option<Decimal>,
    pub payment_method: PaymentMethod,
    pub status: TransactionStatus,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Processor charge / payout id for card and bank movements
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_ref: Option<String>,
    /// Shared by the `send` and `receive` rows of one transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransferId>,
    /// Money request settled by this row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Does `user_id` own this row or appear as its counterparty?
    pub fn is_visible_to(&self, user_id: &UserId) -> bool {
        &self.owner_user_id == user_id || self.counterparty_user_id.as_ref() == Some(user_id)
    }
}

// ============================================================================
// Money request
// ============================================================================

/// A solicitation for payment, distinct from any Transaction until paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoneyRequest {
    pub id: RequestId,
    pub requester_user_id: UserId,
    pub target_user_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which side of a money request the caller is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestDirection {
    /// Requests addressed to the caller
    #[default]
    Incoming,
    /// Requests the caller has made
    Outgoing,
}

// ============================================================================
// Verification
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRecord {
    pub id: VerificationId,
    pub user_id: UserId,
    pub kind: VerificationKind,
    pub status: VerificationStatus,
    /// Opaque pointer into the external document store
    pub document_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// User directory
// ============================================================================

/// Minimal view of a user as exposed by the identity service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
}
