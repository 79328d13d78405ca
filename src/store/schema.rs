//! PostgreSQL schema, applied idempotently by [`super::PgStore::init_schema`]

pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS wallet_users_tb (
        user_id         TEXT PRIMARY KEY,
        email           TEXT NOT NULL UNIQUE,
        display_name    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallet_accounts_tb (
        user_id         TEXT PRIMARY KEY,
        verified        BOOLEAN NOT NULL DEFAULT FALSE,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallet_balances_tb (
        user_id         TEXT NOT NULL REFERENCES wallet_accounts_tb(user_id),
        currency        TEXT NOT NULL,
        amount          NUMERIC(30, 2) NOT NULL DEFAULT 0 CHECK (amount >= 0),
        version         BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, currency)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallet_transactions_tb (
        id                      TEXT NOT NULL,
        owner_user_id           TEXT NOT NULL,
        counterparty_user_id    TEXT,
        tx_type                 TEXT NOT NULL,
        amount                  NUMERIC(30, 2) NOT NULL,
        fee                     NUMERIC(30, 2) NOT NULL DEFAULT 0,
        currency_from           TEXT NOT NULL,
        currency_to             TEXT,
        exchange_rate           NUMERIC(30, 10),
        converted_amount        NUMERIC(30, 2),
        payment_method          TEXT NOT NULL,
        status                  TEXT NOT NULL,
        reference               TEXT NOT NULL,
        notes                   TEXT,
        gateway_ref             TEXT,
        transfer_id             TEXT,
        request_id              TEXT,
        destination             TEXT,
        created_at              TIMESTAMPTZ NOT NULL,
        updated_at              TIMESTAMPTZ NOT NULL,
        CONSTRAINT wallet_transactions_pkey PRIMARY KEY (id),
        CONSTRAINT wallet_transactions_reference_key UNIQUE (reference)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_wallet_tx_owner_created
        ON wallet_transactions_tb (owner_user_id, created_at DESC, id DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_wallet_tx_gateway_ref
        ON wallet_transactions_tb (gateway_ref) WHERE gateway_ref IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallet_money_requests_tb (
        id                  TEXT PRIMARY KEY,
        requester_user_id   TEXT NOT NULL,
        target_user_id      TEXT NOT NULL,
        amount              NUMERIC(30, 2) NOT NULL,
        currency            TEXT NOT NULL,
        notes               TEXT,
        status              TEXT NOT NULL,
        created_at          TIMESTAMPTZ NOT NULL,
        updated_at          TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallet_verifications_tb (
        id              TEXT PRIMARY KEY,
        user_id         TEXT NOT NULL,
        kind            TEXT NOT NULL,
        status          TEXT NOT NULL,
        document_ref    TEXT NOT NULL,
        review_notes    TEXT,
        created_at      TIMESTAMPTZ NOT NULL,
        reviewed_at     TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_wallet_verifications_user
        ON wallet_verifications_tb (user_id)
    "#,
];

/// Unique constraint guarding journal references
pub const REFERENCE_CONSTRAINT: &str = "wallet_transactions_reference_key";

pub const TRANSACTION_ID_CONSTRAINT: &str = "wallet_transactions_pkey";
