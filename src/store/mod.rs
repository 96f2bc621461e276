//! The relational store behind the gateway.
//!
//! The gateway reads keys, models and channels, and writes exactly two things:
//! the atomic balance debit (with its ledger entry and quota bump) and the
//! per-request usage log. Everything else (admin CRUD, top-ups) lives elsewhere.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{AuthRecord, ChannelRecord, Model, Transaction, UsageLog};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store state poisoned")]
    Poisoned,
    #[error("{0}")]
    Other(String),
}

/// Everything needed to charge one request in a single atomic step.
#[derive(Debug, Clone)]
pub struct DebitRequest {
    pub user_id: i64,
    pub api_key_id: i64,
    pub reference_id: String,
    pub revenue: Decimal,
    pub cost: Decimal,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    Charged(Transaction),
    /// The conditional decrement matched no row.
    InsufficientBalance,
    /// A transaction with this reference id already exists; nothing was charged.
    AlreadyCharged(Transaction),
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn find_api_key(&self, key_hash: &str) -> Result<Option<AuthRecord>, StoreError>;

    async fn find_model(&self, model_id: &str) -> Result<Option<Model>, StoreError>;

    async fn list_active_models(&self) -> Result<Vec<Model>, StoreError>;

    /// Active channels of active providers that serve `model_id`.
    async fn channels_for_model(&self, model_id: &str) -> Result<Vec<ChannelRecord>, StoreError>;

    async fn find_transaction(&self, reference_id: &str) -> Result<Option<Transaction>, StoreError>;

    /// Decrement the balance only if it covers `revenue`, append the signed
    /// transaction and bump the key's used quota, all or nothing.
    async fn debit(&self, req: DebitRequest) -> Result<DebitOutcome, StoreError>;

    async fn insert_usage_log(&self, log: UsageLog) -> Result<(), StoreError>;
}
