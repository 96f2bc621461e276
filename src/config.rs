use crate::error::{GatewayError, Result};
use crate::models::{ApiKey, ChannelRecord, Model, User};
use crate::store::MemoryStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL. Without one the gateway runs on the in-memory store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub auth_ttl_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub channel_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Share of revenue booked as upstream cost.
    #[serde(default = "default_cost_ratio")]
    pub cost_ratio: Decimal,
    #[serde(default = "default_window_secs")]
    pub rate_limit_window_secs: u64,
    /// Per-IP limit for unauthenticated endpoints; 0 disables it.
    #[serde(default = "default_ip_limit")]
    pub ip_rate_limit_per_minute: u32,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Peers whose `X-Forwarded-For`/`X-Real-IP` headers are believed. Any
    /// other peer is identified by its socket address.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Mirror every usage record to this JSONL file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_file: Option<PathBuf>,
}

/// Records loaded into the in-memory store at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub api_keys: Vec<SeedApiKey>,
    #[serde(default)]
    pub models: Vec<SeedModel>,
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedApiKey {
    /// Plaintext bearer token; only its hash is kept.
    pub key: String,
    pub id: i64,
    pub user_id: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_quota: Option<Decimal>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub model_whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedModel {
    pub id: i64,
    pub model_id: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub input_price: Decimal,
    pub output_price: Decimal,
}

fn default_port() -> u16 {
    8080
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_upstream_timeout_secs() -> u64 {
    300
}

fn default_cost_ratio() -> Decimal {
    Decimal::new(7, 1)
}

fn default_window_secs() -> u64 {
    60
}

fn default_ip_limit() -> u32 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_stream_buffer() -> usize {
    32
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            gateway: GatewaySettings::default(),
            logging: LoggingConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            migrations_dir: default_migrations_dir(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            auth_ttl_secs: default_ttl_secs(),
            channel_ttl_secs: default_ttl_secs(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            cost_ratio: default_cost_ratio(),
            rate_limit_window_secs: default_window_secs(),
            ip_rate_limit_per_minute: default_ip_limit(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            stream_buffer: default_stream_buffer(),
            trusted_proxies: Vec::new(),
        }
    }
}

impl GatewaySettings {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl CacheConfig {
    pub fn auth_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_ttl_secs)
    }

    pub fn channel_ttl(&self) -> Duration {
        Duration::from_secs(self.channel_ttl_secs)
    }
}

impl SeedApiKey {
    pub fn to_api_key(&self) -> ApiKey {
        ApiKey {
            id: self.id,
            user_id: self.user_id,
            is_active: self.is_active,
            expires_at: self.expires_at,
            total_quota: self.total_quota,
            used_quota: Decimal::ZERO,
            rate_limit_per_minute: self.rate_limit_per_minute,
            model_whitelist: self.model_whitelist.clone(),
        }
    }
}

impl SeedModel {
    pub fn to_model(&self) -> Model {
        Model {
            id: self.id,
            model_id: self.model_id.clone(),
            is_active: self.is_active,
            input_price: self.input_price,
            output_price: self.output_price,
        }
    }
}

impl SeedConfig {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.api_keys.is_empty()
            && self.models.is_empty()
            && self.channels.is_empty()
    }

    /// Load every seed record into `store`.
    pub fn apply(&self, store: &MemoryStore) -> Result<()> {
        for user in &self.users {
            store.insert_user(user.clone())?;
        }
        for key in &self.api_keys {
            if !self.users.iter().any(|u| u.id == key.user_id) {
                return Err(GatewayError::config(format!(
                    "Seed API key {} references unknown user {}",
                    key.id, key.user_id
                )));
            }
            store.insert_api_key(&key.key, key.to_api_key())?;
        }
        for model in &self.models {
            store.insert_model(model.to_model())?;
        }
        for channel in &self.channels {
            store.insert_channel(channel.clone())?;
        }
        Ok(())
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir. With none found the
    /// defaults are used.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        tracing::warn!(
            searched = %candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "No config file found, using defaults"
        );
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.max_attempts == 0 {
            return Err(GatewayError::config("gateway.max_attempts must be at least 1"));
        }
        if self.gateway.cost_ratio < Decimal::ZERO || self.gateway.cost_ratio > Decimal::ONE {
            return Err(GatewayError::config(
                "gateway.cost_ratio must be between 0 and 1",
            ));
        }
        if self.gateway.stream_buffer == 0 {
            return Err(GatewayError::config("gateway.stream_buffer must be at least 1"));
        }
        Ok(())
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("llm-gateway.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("llm-gateway")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("llm-gateway").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("llm-gateway").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".llm-gateway.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GatewayStore;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
port = 9000

[cache]
auth_ttl_secs = 5

[gateway]
max_attempts = 2
cost_ratio = 0.65
trusted_proxies = ["127.0.0.1", "::1"]

[logging]
usage_file = "usage.jsonl"

[[seed.users]]
id = 1
balance = "10.5"

[[seed.api_keys]]
key = "sk-demo"
id = 1
user_id = 1
rate_limit_per_minute = 30
model_whitelist = ["gpt-4o-mini"]

[[seed.models]]
id = 1
model_id = "gpt-4o-mini"
input_price = "0.15"
output_price = "0.6"

[[seed.channels]]
id = 1
provider = "openai"
encrypted_key = "plain:sk-upstream"
priority = 10
weight = 2
models = ["gpt-4o-mini"]
"#;

    fn write(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "{content}").unwrap();
        f
    }

    #[test]
    fn test_load_config() {
        let f = write(SAMPLE);
        let config = GatewayConfig::load(f.path()).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.cache.auth_ttl(), Duration::from_secs(5));
        assert_eq!(config.cache.channel_ttl(), Duration::from_secs(30));
        assert_eq!(config.gateway.max_attempts, 2);
        assert_eq!(config.gateway.cost_ratio, Decimal::new(65, 2));
        assert_eq!(config.gateway.upstream_timeout_secs, 300);
        assert_eq!(
            config.gateway.trusted_proxies,
            vec![IpAddr::from([127, 0, 0, 1]), "::1".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(config.logging.usage_file, Some(PathBuf::from("usage.jsonl")));
        assert!(config.database.url.is_none());

        let key = &config.seed.api_keys[0];
        assert!(key.is_active);
        assert_eq!(key.rate_limit_per_minute, Some(30));
        assert_eq!(config.seed.channels[0].weight, 2);
        assert_eq!(config.seed.channels[0].base_url, "");
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let f = write("");
        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.gateway.max_attempts, 3);
        assert_eq!(config.gateway.cost_ratio, Decimal::new(7, 1));
        assert_eq!(config.gateway.ip_rate_limit_per_minute, 60);
        assert!(config.gateway.trusted_proxies.is_empty());
        assert!(config.seed.is_empty());
    }

    #[test]
    fn test_validation() {
        let f = write("[gateway]\nmax_attempts = 0\n");
        assert!(GatewayConfig::load(f.path()).is_err());

        let f = write("[gateway]\ncost_ratio = 1.5\n");
        let err = GatewayConfig::load(f.path()).unwrap_err();
        assert!(err.to_string().contains("cost_ratio"));
    }

    #[tokio::test]
    async fn test_seed_applies_to_store() {
        let f = write(SAMPLE);
        let config = GatewayConfig::load(f.path()).unwrap();
        let store = MemoryStore::new();
        config.seed.apply(&store).unwrap();

        let record = store
            .find_api_key(&crate::auth::hash_token("sk-demo"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.user.balance, Decimal::new(105, 1));
        assert!(record.api_key.allows_model("gpt-4o-mini"));
        assert!(!record.api_key.allows_model("gpt-4o"));
        assert_eq!(store.channels_for_model("gpt-4o-mini").await.unwrap().len(), 1);
    }

    #[test]
    fn test_seed_key_needs_user() {
        let mut seed = SeedConfig::default();
        seed.api_keys.push(SeedApiKey {
            key: "sk".into(),
            id: 1,
            user_id: 99,
            is_active: true,
            expires_at: None,
            total_quota: None,
            rate_limit_per_minute: None,
            model_whitelist: vec![],
        });
        assert!(seed.apply(&MemoryStore::new()).is_err());
    }
}
