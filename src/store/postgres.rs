//! PostgreSQL store
//!
//! One database transaction per [`CommitBatch`]. Balance rows use a
//! `version` column for compare-and-swap, journal rows rely on the unique
//! reference constraint, and status updates are `UPDATE .. WHERE status = $n`.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use super::schema::{REFERENCE_CONSTRAINT, SCHEMA_STATEMENTS, TRANSACTION_ID_CONSTRAINT};
use super::{
    CommitBatch, LedgerRepository, Page, StoreError, TransactionFilter, UserDirectory,
    VerificationRepository,
};
use crate::core_types::{RequestId, TransactionId, UserId, VerificationId};
use crate::currency::Currency;
use crate::models::{
    Account, BalanceEntry, MoneyRequest, RequestDirection, RequestStatus, Transaction,
    UserProfile, VerificationKind, VerificationRecord, VerificationStatus,
};

const TRANSACTION_COLUMNS: &str = "id, owner_user_id, counterparty_user_id, tx_type, amount, fee, \
     currency_from, currency_to, exchange_rate, converted_amount, payment_method, status, \
     reference, notes, gateway_ref, transfer_id, request_id, destination, created_at, updated_at";

const REQUEST_COLUMNS: &str = "id, requester_user_id, target_user_id, amount, currency, notes, \
     status, created_at, updated_at";

const VERIFICATION_COLUMNS: &str =
    "id, user_id, kind, status, document_ref, review_notes, created_at, reviewed_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Wallet schema initialized");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Register or refresh a directory entry
    pub async fn upsert_user(&self, profile: &UserProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO wallet_users_tb (user_id, email, display_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
                SET email = EXCLUDED.email, display_name = EXCLUDED.display_name
            "#,
        )
        .bind(profile.user_id.as_str())
        .bind(&profile.email)
        .bind(&profile.display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_col<T>(value: String, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| StoreError::Database(format!("bad value in column {}: {}", column, e)))
}

fn parse_opt_col<T>(value: Option<String>, column: &str) -> Result<Option<T>, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    value.map(|v| parse_col(v, column)).transpose()
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    Ok(Transaction {
        id: parse_col(row.try_get("id")?, "id")?,
        owner_user_id: UserId::new(row.try_get::<String, _>("owner_user_id")?),
        counterparty_user_id: row
            .try_get::<Option<String>, _>("counterparty_user_id")?
            .map(UserId::new),
        tx_type: parse_col(row.try_get("tx_type")?, "tx_type")?,
        amount: row.try_get("amount")?,
        fee: row.try_get("fee")?,
        currency_from: parse_col(row.try_get("currency_from")?, "currency_from")?,
        currency_to: parse_opt_col(row.try_get("currency_to")?, "currency_to")?,
        exchange_rate: row.try_get("exchange_rate")?,
        converted_amount: row.try_get("converted_amount")?,
        payment_method: parse_col(row.try_get("payment_method")?, "payment_method")?,
        status: parse_col(row.try_get("status")?, "status")?,
        reference: row.try_get("reference")?,
        notes: row.try_get("notes")?,
        gateway_ref: row.try_get("gateway_ref")?,
        transfer_id: parse_opt_col(row.try_get("transfer_id")?, "transfer_id")?,
        request_id: parse_opt_col(row.try_get("request_id")?, "request_id")?,
        destination: row.try_get("destination")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<MoneyRequest, StoreError> {
    Ok(MoneyRequest {
        id: parse_col(row.try_get("id")?, "id")?,
        requester_user_id: UserId::new(row.try_get::<String, _>("requester_user_id")?),
        target_user_id: UserId::new(row.try_get::<String, _>("target_user_id")?),
        amount: row.try_get("amount")?,
        currency: parse_col(row.try_get("currency")?, "currency")?,
        notes: row.try_get("notes")?,
        status: parse_col(row.try_get("status")?, "status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn verification_from_row(row: &PgRow) -> Result<VerificationRecord, StoreError> {
    Ok(VerificationRecord {
        id: parse_col(row.try_get("id")?, "id")?,
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        kind: parse_col(row.try_get("kind")?, "kind")?,
        status: parse_col(row.try_get("status")?, "status")?,
        document_ref: row.try_get("document_ref")?,
        review_notes: row.try_get("review_notes")?,
        created_at: row.try_get("created_at")?,
        reviewed_at: row.try_get("reviewed_at")?,
    })
}

fn profile_from_row(row: &PgRow) -> Result<UserProfile, StoreError> {
    Ok(UserProfile {
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
    })
}

/// Reference collisions are retryable, a reused id is not
fn map_insert_error(e: sqlx::Error, t: &Transaction) -> StoreError {
    #[allow(clippy::collapsible_if)]
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            match db.constraint() {
                Some(REFERENCE_CONSTRAINT) => {
                    return StoreError::DuplicateReference(t.reference.clone());
                }
                Some(TRANSACTION_ID_CONSTRAINT) => {
                    return StoreError::DuplicateTransaction(t.id.to_string());
                }
                _ => {}
            }
        }
    }
    e.into()
}

fn push_owner_filter(qb: &mut QueryBuilder<'_, Postgres>, owner: &UserId, filter: &TransactionFilter) {
    qb.push(" WHERE owner_user_id = ");
    qb.push_bind(owner.as_str().to_string());
    if let Some(tx_type) = filter.tx_type {
        qb.push(" AND tx_type = ");
        qb.push_bind(tx_type.as_str());
    }
    if let Some(currency) = filter.currency {
        qb.push(" AND (currency_from = ");
        qb.push_bind(currency.code());
        qb.push(" OR currency_to = ");
        qb.push_bind(currency.code());
        qb.push(")");
    }
}

// ============================================================================
// LedgerRepository
// ============================================================================

#[async_trait]
impl LedgerRepository for PgStore {
    async fn load_account(&self, user_id: &UserId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, verified, created_at FROM wallet_accounts_tb WHERE user_id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let balance_rows = sqlx::query(
            "SELECT currency, amount, version FROM wallet_balances_tb WHERE user_id = $1 ORDER BY currency",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut balances = Vec::with_capacity(balance_rows.len());
        for b in &balance_rows {
            balances.push(BalanceEntry {
                currency: parse_col::<Currency>(b.try_get("currency")?, "currency")?,
                amount: b.try_get("amount")?,
                version: b.try_get("version")?,
            });
        }

        Ok(Some(Account {
            user_id: user_id.clone(),
            balances,
            verified: row.try_get("verified")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn insert_account_if_absent(&self, account: Account) -> Result<Account, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO wallet_accounts_tb (user_id, verified, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(account.user_id.as_str())
        .bind(account.verified)
        .bind(account.created_at)
        .execute(&mut *tx)
        .await?;

        for entry in &account.balances {
            sqlx::query(
                r#"
                INSERT INTO wallet_balances_tb (user_id, currency, amount, version)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, currency) DO NOTHING
                "#,
            )
            .bind(account.user_id.as_str())
            .bind(entry.currency.code())
            .bind(entry.amount)
            .bind(entry.version)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.load_account(&account.user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {}", account.user_id)))
    }

    async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
        if let Some(dup) = batch.duplicate_reference_in_batch() {
            return Err(StoreError::DuplicateReference(dup.to_string()));
        }

        let mut tx = self.pool.begin().await?;

        for write in &batch.balances {
            let updated = sqlx::query(
                r#"
                UPDATE wallet_balances_tb
                SET amount = $1, version = version + 1
                WHERE user_id = $2 AND currency = $3 AND version = $4
                "#,
            )
            .bind(write.new_amount)
            .bind(write.user_id.as_str())
            .bind(write.currency.code())
            .bind(write.expected_version)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 1 {
                continue;
            }
            if write.expected_version != 0 {
                return Err(StoreError::VersionConflict);
            }
            // Slot never written before
            let inserted = sqlx::query(
                r#"
                INSERT INTO wallet_balances_tb (user_id, currency, amount, version)
                VALUES ($1, $2, $3, 1)
                ON CONFLICT (user_id, currency) DO NOTHING
                "#,
            )
            .bind(write.user_id.as_str())
            .bind(write.currency.code())
            .bind(write.new_amount)
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() == 0 {
                return Err(StoreError::VersionConflict);
            }
        }

        for t in &batch.new_transactions {
            sqlx::query(&format!(
                "INSERT INTO wallet_transactions_tb ({}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
                TRANSACTION_COLUMNS
            ))
            .bind(t.id.to_string())
            .bind(t.owner_user_id.as_str())
            .bind(t.counterparty_user_id.as_ref().map(|u| u.as_str().to_string()))
            .bind(t.tx_type.as_str())
            .bind(t.amount)
            .bind(t.fee)
            .bind(t.currency_from.code())
            .bind(t.currency_to.map(|c| c.code()))
            .bind(t.exchange_rate)
            .bind(t.converted_amount)
            .bind(t.payment_method.as_str())
            .bind(t.status.as_str())
            .bind(&t.reference)
            .bind(&t.notes)
            .bind(&t.gateway_ref)
            .bind(t.transfer_id.map(|id| id.to_string()))
            .bind(t.request_id.map(|id| id.to_string()))
            .bind(&t.destination)
            .bind(t.created_at)
            .bind(t.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, t))?;
        }

        for update in &batch.transaction_updates {
            let result = sqlx::query(
                r#"
                UPDATE wallet_transactions_tb
                SET status = $1, gateway_ref = COALESCE($2, gateway_ref), updated_at = NOW()
                WHERE id = $3 AND status = $4
                "#,
            )
            .bind(update.next.as_str())
            .bind(&update.gateway_ref)
            .bind(update.id.to_string())
            .bind(update.expected.as_str())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::StatusConflict(format!(
                    "transaction {} is no longer {}",
                    update.id, update.expected
                )));
            }
        }

        for r in &batch.new_requests {
            sqlx::query(&format!(
                "INSERT INTO wallet_money_requests_tb ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                REQUEST_COLUMNS
            ))
            .bind(r.id.to_string())
            .bind(r.requester_user_id.as_str())
            .bind(r.target_user_id.as_str())
            .bind(r.amount)
            .bind(r.currency.code())
            .bind(&r.notes)
            .bind(r.status.as_str())
            .bind(r.created_at)
            .bind(r.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for update in &batch.request_updates {
            let result = sqlx::query(
                r#"
                UPDATE wallet_money_requests_tb
                SET status = $1, updated_at = NOW()
                WHERE id = $2 AND status = $3
                "#,
            )
            .bind(update.next.as_str())
            .bind(update.id.to_string())
            .bind(update.expected.as_str())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::StatusConflict(format!(
                    "money request {} is no longer {}",
                    update.id,
                    update.expected.as_str()
                )));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallet_transactions_tb WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_by_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallet_transactions_tb WHERE gateway_ref = $1 ORDER BY created_at LIMIT 1",
            TRANSACTION_COLUMNS
        ))
        .bind(gateway_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn query_transactions(
        &self,
        owner: &UserId,
        filter: &TransactionFilter,
        page: Page,
    ) -> Result<(Vec<Transaction>, u64), StoreError> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM wallet_transactions_tb");
        push_owner_filter(&mut count_qb, owner, filter);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM wallet_transactions_tb",
            TRANSACTION_COLUMNS
        ));
        push_owner_filter(&mut qb, owner, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        qb.push_bind(page.page_size as i64);
        qb.push(" OFFSET ");
        qb.push_bind(page.offset() as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let transactions = rows
            .iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((transactions, total.max(0) as u64))
    }

    async fn get_money_request(&self, id: RequestId) -> Result<Option<MoneyRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallet_money_requests_tb WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_money_requests(
        &self,
        user_id: &UserId,
        direction: RequestDirection,
        status: Option<RequestStatus>,
    ) -> Result<Vec<MoneyRequest>, StoreError> {
        let column = match direction {
            RequestDirection::Incoming => "target_user_id",
            RequestDirection::Outgoing => "requester_user_id",
        };
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM wallet_money_requests_tb WHERE {} = ",
            REQUEST_COLUMNS, column
        ));
        qb.push_bind(user_id.as_str().to_string());
        if let Some(status) = status {
            qb.push(" AND status = ");
            qb.push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(request_from_row).collect()
    }
}

// ============================================================================
// VerificationRepository
// ============================================================================

#[async_trait]
impl VerificationRepository for PgStore {
    async fn insert_verification(&self, record: VerificationRecord) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO wallet_verifications_tb ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            VERIFICATION_COLUMNS
        ))
        .bind(record.id.to_string())
        .bind(record.user_id.as_str())
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(&record.document_ref)
        .bind(&record.review_notes)
        .bind(record.created_at)
        .bind(record.reviewed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_verification(
        &self,
        id: VerificationId,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM wallet_verifications_tb WHERE id = $1",
            VERIFICATION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(verification_from_row).transpose()
    }

    async fn list_user_verifications(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<VerificationRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM wallet_verifications_tb WHERE user_id = $1 ORDER BY created_at DESC",
            VERIFICATION_COLUMNS
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(verification_from_row).collect()
    }

    async fn list_verifications(
        &self,
        kind: Option<VerificationKind>,
        status: Option<VerificationStatus>,
    ) -> Result<Vec<VerificationRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM wallet_verifications_tb WHERE TRUE",
            VERIFICATION_COLUMNS
        ));
        if let Some(kind) = kind {
            qb.push(" AND kind = ");
            qb.push_bind(kind.as_str());
        }
        if let Some(status) = status {
            qb.push(" AND status = ");
            qb.push_bind(status.as_str());
        }
        qb.push(" ORDER BY created_at ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(verification_from_row).collect()
    }

    async fn update_verification_status(
        &self,
        id: VerificationId,
        expected: VerificationStatus,
        next: VerificationStatus,
        review_notes: Option<String>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<VerificationRecord, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE wallet_verifications_tb \
             SET status = $1, review_notes = $2, reviewed_at = $3 \
             WHERE id = $4 AND status = $5 \
             RETURNING {}",
            VERIFICATION_COLUMNS
        ))
        .bind(next.as_str())
        .bind(&review_notes)
        .bind(reviewed_at)
        .bind(id.to_string())
        .bind(expected.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => verification_from_row(&row),
            None => match self.get_verification(id).await? {
                Some(current) => Err(StoreError::StatusConflict(format!(
                    "verification {} is {}, expected {}",
                    id,
                    current.status.as_str(),
                    expected.as_str()
                ))),
                None => Err(StoreError::NotFound(format!("verification {}", id))),
            },
        }
    }

    async fn set_user_verified(&self, user_id: &UserId, verified: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO wallet_accounts_tb (user_id, verified)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET verified = EXCLUDED.verified
            "#,
        )
        .bind(user_id.as_str())
        .bind(verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_user_verified(&self, user_id: &UserId) -> Result<bool, StoreError> {
        let verified: Option<bool> =
            sqlx::query_scalar("SELECT verified FROM wallet_accounts_tb WHERE user_id = $1")
                .bind(user_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(verified.unwrap_or(false))
    }
}

// ============================================================================
// UserDirectory
// ============================================================================

#[async_trait]
impl UserDirectory for PgStore {
    async fn find_by_id(&self, user_id: &UserId) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, email, display_name FROM wallet_users_tb WHERE user_id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, email, display_name FROM wallet_users_tb WHERE LOWER(email) = LOWER($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }
}
