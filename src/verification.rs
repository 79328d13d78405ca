//! Verification Gate
//!
//! A user may withdraw or send money only when BOTH an identity document and
//! a license document have been verified by an administrator.
//!
//! [`VerificationGate::is_authorized`] is computed from the records
//! themselves and is the authoritative answer. The account-level `verified`
//! flag is a mirror kept current by [`GateRefresher`], which consumes the
//! [`VerificationEvent`] emitted by every review before the review returns.
//! Handler failures are retried and then logged; they never undo a committed
//! review. Re-applying the same review re-dispatches its event.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::core_types::{UserId, VerificationId};
use crate::error::{WalletError, WalletResult};
use crate::ledger::LockTable;
use crate::models::{VerificationKind, VerificationRecord, VerificationStatus};
use crate::store::{StoreError, VerificationRepository};

const HANDLER_ATTEMPTS: u32 = 3;

/// Emitted after a review changed a record's status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationEvent {
    Approved {
        user_id: UserId,
        kind: VerificationKind,
    },
    Rejected {
        user_id: UserId,
        kind: VerificationKind,
    },
    /// A previously verified record was rejected
    Revoked {
        user_id: UserId,
        kind: VerificationKind,
    },
}

impl VerificationEvent {
    pub fn user_id(&self) -> &UserId {
        match self {
            VerificationEvent::Approved { user_id, .. }
            | VerificationEvent::Rejected { user_id, .. }
            | VerificationEvent::Revoked { user_id, .. } => user_id,
        }
    }
}

#[async_trait]
pub trait VerificationEventHandler: Send + Sync {
    async fn handle(&self, event: &VerificationEvent) -> WalletResult<()>;
}

/// Both kinds verified?
pub fn both_verified(records: &[VerificationRecord]) -> bool {
    [VerificationKind::Identity, VerificationKind::License]
        .iter()
        .all(|kind| {
            records
                .iter()
                .any(|r| r.kind == *kind && r.status == VerificationStatus::Verified)
        })
}

/// Re-evaluates the gate and updates the account's `verified` flag
pub struct GateRefresher {
    repo: Arc<dyn VerificationRepository>,
}

impl GateRefresher {
    pub fn new(repo: Arc<dyn VerificationRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl VerificationEventHandler for GateRefresher {
    async fn handle(&self, event: &VerificationEvent) -> WalletResult<()> {
        let user_id = event.user_id();
        let records = self.repo.list_user_verifications(user_id).await?;
        let authorized = both_verified(&records);
        self.repo.set_user_verified(user_id, authorized).await?;
        tracing::info!(user_id = %user_id, authorized, ?event, "Verification gate refreshed");
        Ok(())
    }
}

pub struct VerificationGate {
    repo: Arc<dyn VerificationRepository>,
    handlers: Vec<Arc<dyn VerificationEventHandler>>,
    /// Serializes reviews per user so the mirrored flag follows the last review
    user_locks: LockTable<UserId>,
}

impl VerificationGate {
    /// Gate with the flag-mirroring handler registered
    pub fn new(repo: Arc<dyn VerificationRepository>) -> Self {
        let refresher: Arc<dyn VerificationEventHandler> = Arc::new(GateRefresher::new(repo.clone()));
        Self {
            repo,
            handlers: vec![refresher],
            user_locks: LockTable::new(),
        }
    }

    /// Register an additional event consumer
    pub fn subscribe(&mut self, handler: Arc<dyn VerificationEventHandler>) {
        self.handlers.push(handler);
    }

    pub async fn is_authorized(&self, user_id: &UserId) -> WalletResult<bool> {
        let records = self.repo.list_user_verifications(user_id).await?;
        Ok(both_verified(&records))
    }

    /// `VerificationRequired` unless both documents are verified
    pub async fn require_authorized(&self, user_id: &UserId) -> WalletResult<()> {
        if self.is_authorized(user_id).await? {
            Ok(())
        } else {
            Err(WalletError::VerificationRequired)
        }
    }

    /// File a document for review.
    ///
    /// At most one pending or verified record exists per kind; a rejected
    /// document may be resubmitted.
    pub async fn submit(
        &self,
        user_id: &UserId,
        kind: VerificationKind,
        document_ref: &str,
    ) -> WalletResult<VerificationRecord> {
        let document_ref = document_ref.trim();
        if document_ref.is_empty() {
            return Err(WalletError::InvalidTransition(
                "document reference is required".to_string(),
            ));
        }

        let _guard = self.user_locks.lock(user_id.clone()).await;

        let existing = self.repo.list_user_verifications(user_id).await?;
        if let Some(open) = existing
            .iter()
            .find(|r| r.kind == kind && r.status != VerificationStatus::Rejected)
        {
            return Err(WalletError::InvalidTransition(format!(
                "{} verification already {}",
                kind,
                open.status.as_str()
            )));
        }

        let record = VerificationRecord {
            id: VerificationId::new(),
            user_id: user_id.clone(),
            kind,
            status: VerificationStatus::Pending,
            document_ref: document_ref.to_string(),
            review_notes: None,
            created_at: Utc::now(),
            reviewed_at: None,
        };
        self.repo.insert_verification(record.clone()).await?;
        tracing::info!(user_id = %user_id, %kind, id = %record.id, "Verification submitted");
        Ok(record)
    }

    /// Administrator decision on a record.
    ///
    /// The gate is re-evaluated before this returns. Re-applying the current
    /// status leaves the record alone and only re-dispatches its event.
    pub async fn review(
        &self,
        id: VerificationId,
        kind: VerificationKind,
        decision: VerificationStatus,
        notes: Option<String>,
    ) -> WalletResult<VerificationRecord> {
        if decision == VerificationStatus::Pending {
            return Err(WalletError::InvalidTransition(
                "review must verify or reject".to_string(),
            ));
        }

        let owner = self.load_kind(id, kind).await?.user_id;
        let _guard = self.user_locks.lock(owner).await;

        let current = self.load_kind(id, kind).await?;
        if current.status == decision {
            // Repairs a mirror left stale by an earlier handler failure
            self.dispatch(&review_event(VerificationStatus::Pending, &current))
                .await;
            return Ok(current);
        }

        let updated = self
            .repo
            .update_verification_status(id, current.status, decision, notes, Utc::now())
            .await
            .map_err(|e| match e {
                StoreError::StatusConflict(_) => WalletError::ConcurrencyConflict,
                other => other.into(),
            })?;

        self.dispatch(&review_event(current.status, &updated)).await;
        Ok(updated)
    }

    pub async fn list(
        &self,
        kind: Option<VerificationKind>,
        status: Option<VerificationStatus>,
    ) -> WalletResult<Vec<VerificationRecord>> {
        Ok(self.repo.list_verifications(kind, status).await?)
    }

    pub async fn user_records(&self, user_id: &UserId) -> WalletResult<Vec<VerificationRecord>> {
        Ok(self.repo.list_user_verifications(user_id).await?)
    }

    async fn load_kind(
        &self,
        id: VerificationId,
        kind: VerificationKind,
    ) -> WalletResult<VerificationRecord> {
        self.repo
            .get_verification(id)
            .await?
            .filter(|r| r.kind == kind)
            .ok_or_else(|| WalletError::NotFound(format!("{} verification {}", kind, id)))
    }

    async fn dispatch(&self, event: &VerificationEvent) {
        for handler in &self.handlers {
            let mut attempt = 1;
            loop {
                match handler.handle(event).await {
                    Ok(()) => break,
                    Err(e) if attempt < HANDLER_ATTEMPTS => {
                        tracing::warn!(attempt, error = %e, ?event, "Verification event handler failed, retrying");
                        attempt += 1;
                    }
                    Err(e) => {
                        tracing::error!(attempts = attempt, error = %e, ?event, "Verification event handler gave up");
                        break;
                    }
                }
            }
        }
    }
}

/// Event for a record that moved from `previous` to its current status
fn review_event(previous: VerificationStatus, record: &VerificationRecord) -> VerificationEvent {
    let user_id = record.user_id.clone();
    let kind = record.kind;
    match (previous, record.status) {
        (_, VerificationStatus::Verified) => VerificationEvent::Approved { user_id, kind },
        (VerificationStatus::Verified, _) => VerificationEvent::Revoked { user_id, kind },
        _ => VerificationEvent::Rejected { user_id, kind },
    }
}
