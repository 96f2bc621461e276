//! Bearer-token authentication.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ReadThrough, SharedCache};
use crate::error::{GatewayError, Result};
use crate::models::AuthRecord;
use crate::store::GatewayStore;

/// One-way, deterministic lookup key for a bearer token (hex SHA-256).
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Extract the token from an `Authorization` header value.
pub fn parse_bearer(header: Option<&str>) -> Result<&str> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| GatewayError::invalid_api_key("Missing Authorization header"))?;

    let (scheme, token) = header
        .split_once(char::is_whitespace)
        .ok_or_else(|| GatewayError::invalid_api_key("Malformed Authorization header"))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(GatewayError::invalid_api_key(
            "Authorization header must use the Bearer scheme",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(GatewayError::invalid_api_key("Empty bearer token"));
    }
    Ok(token)
}

/// Check activation, expiry and quota at `now`.
pub fn validate(record: &AuthRecord, now: DateTime<Utc>) -> Result<()> {
    let key = &record.api_key;
    if !key.is_active {
        return Err(GatewayError::invalid_api_key("API key is disabled"));
    }
    if key.expires_at.is_some_and(|exp| exp <= now) {
        return Err(GatewayError::invalid_api_key("API key has expired"));
    }
    if key.total_quota.is_some_and(|total| key.used_quota >= total) {
        return Err(GatewayError::invalid_api_key("API key quota exhausted"));
    }
    Ok(())
}

pub struct Authenticator {
    store: Arc<dyn GatewayStore>,
    lookup: ReadThrough<AuthRecord>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn GatewayStore>, cache: Arc<dyn SharedCache>, ttl: Duration) -> Self {
        Self {
            store,
            lookup: ReadThrough::new(cache, "auth", ttl),
        }
    }

    /// Resolve an `Authorization` header to its key and owning user.
    pub async fn authenticate(&self, header: Option<&str>) -> Result<AuthRecord> {
        let token = parse_bearer(header)?;
        let key_hash = hash_token(token);

        let record = self
            .lookup
            .get_or_load(&key_hash, || async {
                self.store
                    .find_api_key(&key_hash)
                    .await
                    .map_err(GatewayError::from)
            })
            .await?
            .ok_or_else(|| GatewayError::invalid_api_key("Invalid API key"))?;

        validate(&record, Utc::now())?;
        Ok(record)
    }
}
