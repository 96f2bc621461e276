//! Sliding-window request limits per API key and per source IP.
//!
//! Both paths fail open: if the shared cache cannot be reached the request is
//! allowed and a warning is logged.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::cache::SharedCache;
use crate::error::{GatewayError, Result};
use crate::models::ApiKey;

pub struct RateLimiter {
    cache: Arc<dyn SharedCache>,
    window: Duration,
    ip_limit: u32,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Entry member: timestamp plus a random suffix so same-millisecond hits stay distinct.
fn member(now_ms: u64) -> String {
    format!("{now_ms}-{:08x}", rand::rng().random::<u32>())
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn SharedCache>, window: Duration, ip_limit: u32) -> Self {
        Self {
            cache,
            window,
            ip_limit,
        }
    }

    /// `Ok(true)` when the hit fits under `limit`. Cache errors are returned as-is.
    async fn hit(&self, key: &str, limit: u32, now_ms: u64) -> std::result::Result<bool, crate::cache::CacheError> {
        let before = self
            .cache
            .sliding_window_hit(key, self.window, now_ms, &member(now_ms))
            .await?;
        Ok(before < u64::from(limit))
    }

    pub async fn check_api_key(&self, key: &ApiKey) -> Result<()> {
        self.check_api_key_at(key, now_ms()).await
    }

    pub async fn check_api_key_at(&self, key: &ApiKey, now_ms: u64) -> Result<()> {
        let Some(limit) = key.rate_limit_per_minute.filter(|l| *l > 0) else {
            return Ok(());
        };
        match self.hit(&format!("ratelimit:key:{}", key.id), limit, now_ms).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(GatewayError::RateLimitExceeded {
                limit,
                window_secs: self.window.as_secs(),
            }),
            Err(e) => {
                warn!(api_key_id = key.id, error = %e, "rate limiter unavailable, allowing request");
                Ok(())
            }
        }
    }

    /// Whether an unauthenticated request from `ip` is allowed.
    pub async fn allow_ip(&self, ip: &str) -> bool {
        self.allow_ip_at(ip, now_ms()).await
    }

    pub async fn allow_ip_at(&self, ip: &str, now_ms: u64) -> bool {
        if self.ip_limit == 0 {
            return true;
        }
        match self.hit(&format!("ratelimit:ip:{ip}"), self.ip_limit, now_ms).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(ip, error = %e, "rate limiter unavailable, allowing request");
                true
            }
        }
    }
}
