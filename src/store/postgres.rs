//! PostgreSQL store.
//!
//! Queries are built at runtime so the crate compiles without a live database.
//! Token counts are `BIGINT`, money is `NUMERIC`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::{DebitOutcome, DebitRequest, GatewayStore, StoreError};
use crate::models::{ApiKey, AuthRecord, ChannelRecord, Model, Transaction, User, UsageLog};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, sqlx::Error> {
    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        api_key_id: row.try_get("api_key_id")?,
        reference_id: row.try_get("reference_id")?,
        amount: row.try_get("amount")?,
        revenue: row.try_get("revenue")?,
        cost: row.try_get("cost")?,
        balance_after: row.try_get("balance_after")?,
        model: row.try_get("model")?,
        prompt_tokens: to_u64(row.try_get("prompt_tokens")?),
        completion_tokens: to_u64(row.try_get("completion_tokens")?),
        created_at: row.try_get("created_at")?,
    })
}

fn model_from_row(row: &PgRow) -> Result<Model, sqlx::Error> {
    Ok(Model {
        id: row.try_get("id")?,
        model_id: row.try_get("model_id")?,
        is_active: row.try_get("is_active")?,
        input_price: row.try_get("input_price")?,
        output_price: row.try_get("output_price")?,
    })
}

const TRANSACTION_COLUMNS: &str = "id, user_id, api_key_id, reference_id, amount, revenue, cost, \
     balance_after, model, prompt_tokens, completion_tokens, created_at";

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply pending migrations from `dir`. A missing directory is skipped.
    pub async fn migrate(&self, dir: &Path) -> Result<(), StoreError> {
        if !dir.exists() {
            warn!("Migrations directory not found: {}", dir.display());
            return Ok(());
        }
        let migrator = Migrator::new(dir).await?;
        migrator.run(&self.pool).await?;
        info!("Migrations complete");
        Ok(())
    }
}

#[async_trait]
impl GatewayStore for PgStore {
    async fn find_api_key(&self, key_hash: &str) -> Result<Option<AuthRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT k.id, k.user_id, k.is_active, k.expires_at, k.total_quota, k.used_quota, \
                    k.rate_limit_per_minute, k.model_whitelist, u.balance \
             FROM api_keys k JOIN users u ON u.id = k.user_id \
             WHERE k.key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let rate_limit: Option<i32> = row.try_get("rate_limit_per_minute")?;
        let whitelist: Option<Vec<String>> = row.try_get("model_whitelist")?;
        let api_key = ApiKey {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            is_active: row.try_get("is_active")?,
            expires_at: row.try_get("expires_at")?,
            total_quota: row.try_get("total_quota")?,
            used_quota: row.try_get("used_quota")?,
            rate_limit_per_minute: rate_limit.and_then(|v| u32::try_from(v).ok()),
            model_whitelist: whitelist.unwrap_or_default(),
        };
        let user = User {
            id: api_key.user_id,
            balance: row.try_get("balance")?,
        };
        Ok(Some(AuthRecord { api_key, user }))
    }

    async fn find_model(&self, model_id: &str) -> Result<Option<Model>, StoreError> {
        let row = sqlx::query(
            "SELECT id, model_id, is_active, input_price, output_price FROM models WHERE model_id = $1",
        )
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(model_from_row).transpose()?)
    }

    async fn list_active_models(&self) -> Result<Vec<Model>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, model_id, is_active, input_price, output_price FROM models \
             WHERE is_active ORDER BY model_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(model_from_row).collect::<Result<_, _>>()?)
    }

    async fn channels_for_model(&self, model_id: &str) -> Result<Vec<ChannelRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.id, p.name AS provider, c.encrypted_key, COALESCE(c.base_url, p.base_url, '') AS base_url, \
                    c.priority, c.weight, c.models \
             FROM channels c JOIN providers p ON p.id = c.provider_id \
             WHERE c.is_active AND p.is_active AND $1 = ANY(c.models)",
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;

        let mut channels = Vec::with_capacity(rows.len());
        for row in &rows {
            let weight: i32 = row.try_get("weight")?;
            channels.push(ChannelRecord {
                id: row.try_get("id")?,
                provider: row.try_get("provider")?,
                encrypted_key: row.try_get("encrypted_key")?,
                base_url: row.try_get("base_url")?,
                priority: row.try_get("priority")?,
                weight: u32::try_from(weight).unwrap_or(0),
                models: row.try_get("models")?,
            });
        }
        Ok(channels)
    }

    async fn find_transaction(&self, reference_id: &str) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference_id = $1"
        ))
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(transaction_from_row).transpose()?)
    }

    async fn debit(&self, req: DebitRequest) -> Result<DebitOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let balance: Option<Decimal> = sqlx::query_scalar(
            "UPDATE users SET balance = balance - $1, updated_at = now() \
             WHERE id = $2 AND balance >= $1 RETURNING balance",
        )
        .bind(req.revenue)
        .bind(req.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance_after) = balance else {
            tx.rollback().await?;
            return Ok(DebitOutcome::InsufficientBalance);
        };

        let inserted = sqlx::query(&format!(
            "INSERT INTO transactions ({TRANSACTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now()) \
             ON CONFLICT (reference_id) DO NOTHING \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(uuid::Uuid::new_v4())
        .bind(req.user_id)
        .bind(req.api_key_id)
        .bind(&req.reference_id)
        .bind(-req.revenue)
        .bind(req.revenue)
        .bind(req.cost)
        .bind(balance_after)
        .bind(&req.model)
        .bind(to_i64(req.prompt_tokens))
        .bind(to_i64(req.completion_tokens))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            // Lost a race with a concurrent charge for the same request.
            tx.rollback().await?;
            return match self.find_transaction(&req.reference_id).await? {
                Some(existing) => Ok(DebitOutcome::AlreadyCharged(existing)),
                None => Err(StoreError::Other(format!(
                    "transaction {} conflicted but was not found",
                    req.reference_id
                ))),
            };
        };
        let transaction = transaction_from_row(&row)?;

        sqlx::query(
            "UPDATE api_keys SET used_quota = CASE WHEN total_quota IS NULL THEN used_quota + $1 \
             ELSE LEAST(used_quota + $1, total_quota) END WHERE id = $2",
        )
            .bind(req.revenue)
            .bind(req.api_key_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(DebitOutcome::Charged(transaction))
    }

    async fn insert_usage_log(&self, log: UsageLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO usage_logs (id, request_id, user_id, api_key_id, model, channel_id, provider, \
                 status, is_stream, prompt_tokens, completion_tokens, total_tokens, revenue, latency_ms, \
                 error_message, client_ip, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(log.id)
        .bind(&log.request_id)
        .bind(log.user_id)
        .bind(log.api_key_id)
        .bind(&log.model)
        .bind(log.channel_id)
        .bind(&log.provider)
        .bind(log.status.as_str())
        .bind(log.is_stream)
        .bind(to_i64(log.prompt_tokens))
        .bind(to_i64(log.completion_tokens))
        .bind(to_i64(log.total_tokens))
        .bind(log.revenue)
        .bind(to_i64(log.latency_ms))
        .bind(&log.error_message)
        .bind(&log.client_ip)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
