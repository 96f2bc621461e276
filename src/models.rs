//! Records the gateway reads from and writes to its backing store, plus the
//! per-request [`GatewayContext`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A caller credential. Only the hash of the bearer token is ever stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    pub is_active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Spend cap in balance units; `None` means unlimited.
    #[serde(default)]
    pub total_quota: Option<Decimal>,
    #[serde(default)]
    pub used_quota: Decimal,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    /// Empty means every model is allowed.
    #[serde(default)]
    pub model_whitelist: Vec<String>,
}

impl ApiKey {
    pub fn allows_model(&self, model: &str) -> bool {
        self.model_whitelist.is_empty() || self.model_whitelist.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub balance: Decimal,
}

/// What the authenticator caches per token hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRecord {
    pub api_key: ApiKey,
    pub user: User,
}

/// Catalog entry. Prices are per 1K tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub id: i64,
    pub model_id: String,
    pub is_active: bool,
    pub input_price: Decimal,
    pub output_price: Decimal,
}

/// A channel as stored: the upstream credential is still sealed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelRecord {
    pub id: i64,
    pub provider: String,
    pub encrypted_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

/// A channel selected for one attempt, with its credential decrypted.
#[derive(Clone)]
pub struct Channel {
    pub id: i64,
    pub provider: String,
    pub api_key: String,
    pub base_url: String,
    pub priority: i32,
    pub weight: u32,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// Signed ledger entry. `reference_id` is the request id and is unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: uuid::Uuid,
    pub user_id: i64,
    pub api_key_id: i64,
    pub reference_id: String,
    /// Negative for a charge.
    pub amount: Decimal,
    pub revenue: Decimal,
    pub cost: Decimal,
    pub balance_after: Decimal,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Success,
    Failed,
}

impl UsageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Technical outcome of one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageLog {
    pub id: uuid::Uuid,
    pub request_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub model: String,
    pub channel_id: Option<i64>,
    pub provider: Option<String>,
    pub status: UsageStatus,
    pub is_stream: bool,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub revenue: Decimal,
    pub latency_ms: u64,
    pub error_message: Option<String>,
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything one request resolves along the pipeline. Never shared across requests.
#[derive(Debug, Clone)]
pub struct GatewayContext {
    pub request_id: String,
    pub started_at: Instant,
    pub api_key: ApiKey,
    pub user: User,
    pub model: Model,
    pub channel: Option<Channel>,
    pub client_ip: Option<String>,
    pub is_stream: bool,
    pub estimated_prompt_tokens: u64,
}

impl GatewayContext {
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
