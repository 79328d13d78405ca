use std::sync::Arc;

use crate::engine::TransferEngine;
use crate::store::PgStore;

use super::auth::JwtKeys;

/// Gateway application state (shared)
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TransferEngine>,
    /// Caller token verification
    pub jwt: Arc<JwtKeys>,
    /// Header carrying the processor's webhook signature
    pub signature_header: String,
    /// PostgreSQL store, pinged by the health check when configured
    pub pg_store: Option<Arc<PgStore>>,
}

impl AppState {
    pub fn new(engine: Arc<TransferEngine>, jwt: Arc<JwtKeys>, signature_header: &str) -> Self {
        Self {
            engine,
            jwt,
            signature_header: signature_header.to_lowercase(),
            pg_store: None,
        }
    }

    pub fn with_pg_store(mut self, store: Arc<PgStore>) -> Self {
        self.pg_store = Some(store);
        self
    }
}
