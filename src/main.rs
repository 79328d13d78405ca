//! Wallet Ledger service
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │   HTTP   │───▶│ Transfer │───▶│  Ledger  │───▶│  Store   │
//! │ Gateway  │    │  Engine  │    │ +Journal │    │ (PG/mem) │
//! └──────────┘    └────┬─────┘    └──────────┘    └──────────┘
//!                      │
//!                      ▼
//!                 ┌──────────┐
//!                 │ Payment  │
//!                 │ Gateway  │
//!                 └──────────┘
//! ```
//!
//! Usage: `wallet_ledger [--env dev] [--port 8080]`

use std::sync::Arc;

use anyhow::Context;

use wallet_ledger::cache::{MemoryTtlStore, TtlStore};
use wallet_ledger::config::{AppConfig, PaymentProvider};
use wallet_ledger::engine::{EngineSettings, TransferEngine};
use wallet_ledger::gateway::{self, auth::JwtKeys, state::AppState};
use wallet_ledger::payment::{HttpPaymentGateway, MockGateway, PaymentGateway};
use wallet_ledger::store::{MemoryStore, PgStore};
use wallet_ledger::{RateTable, logging};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

fn build_payment_gateway(config: &AppConfig) -> anyhow::Result<Arc<dyn PaymentGateway>> {
    let payment = &config.payment;
    Ok(match payment.provider {
        PaymentProvider::Mock => {
            tracing::warn!("Using the mock payment gateway");
            Arc::new(MockGateway::new(&payment.webhook_secret))
        }
        PaymentProvider::Http => Arc::new(
            HttpPaymentGateway::new(
                &payment.base_url,
                &payment.api_key,
                &payment.webhook_secret,
                payment.timeout(),
                payment.webhook_tolerance_secs,
            )
            .context("Failed to create payment processor client")?,
        ),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).context("Failed to load configuration")?;
    let _log_guard = logging::init_logging(&config);

    tracing::info!("Starting wallet ledger in {} mode", env);

    let rates = Arc::new(RateTable::with_overrides(&config.rates));
    let payment_gateway = build_payment_gateway(&config)?;
    let settings = EngineSettings {
        gateway_timeout: config.payment.timeout(),
        webhook_event_ttl: config.payment.webhook_event_ttl(),
        max_retries: config.ledger.max_retries,
    };
    let seen_events: Arc<dyn TtlStore> =
        Arc::new(MemoryTtlStore::new(config.payment.webhook_event_capacity));

    let (engine, pg_store) = match &config.postgres_url {
        Some(url) => {
            let store = Arc::new(
                PgStore::connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?,
            );
            store
                .init_schema()
                .await
                .context("Failed to initialise schema")?;
            tracing::info!("Using PostgreSQL ledger store");
            let engine = TransferEngine::new(
                store.clone(),
                store.clone(),
                store.clone(),
                payment_gateway,
                rates,
                settings,
            )
            .with_event_store(seen_events);
            (engine, Some(store))
        }
        None => {
            tracing::warn!("No postgres_url configured, balances live in memory only");
            let store = Arc::new(MemoryStore::new());
            let engine = TransferEngine::new(
                store.clone(),
                store.clone(),
                store,
                payment_gateway,
                rates,
                settings,
            )
            .with_event_store(seen_events);
            (engine, None)
        }
    };

    let mut state = AppState::new(
        Arc::new(engine),
        Arc::new(JwtKeys::new(&config.auth.jwt_secret)),
        &config.payment.signature_header,
    );
    if let Some(store) = pg_store {
        state = state.with_pg_store(store);
    }

    let port = get_port_override().unwrap_or(config.gateway.port);
    gateway::run_server(&config.gateway.host, port, Arc::new(state))
        .await
        .context("Server error")?;
    Ok(())
}
