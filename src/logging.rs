//! Per-request usage records.
//!
//! Every request that gets past authentication produces exactly one
//! [`UsageLog`], written to the store. Optionally each record is mirrored as a
//! JSON line to a local file. Logging never fails the request: write errors are
//! reported through `tracing` and swallowed.

use chrono::Utc;
use rust_decimal::Decimal;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::models::{GatewayContext, UsageLog, UsageStatus};
use crate::store::GatewayStore;
use crate::translate::openai_types::Usage;

/// Build the record for one finished request.
pub fn usage_entry(
    ctx: &GatewayContext,
    status: UsageStatus,
    usage: Usage,
    revenue: Decimal,
    error_message: Option<String>,
) -> UsageLog {
    UsageLog {
        id: uuid::Uuid::new_v4(),
        request_id: ctx.request_id.clone(),
        user_id: ctx.user.id,
        api_key_id: ctx.api_key.id,
        model: ctx.model.model_id.clone(),
        channel_id: ctx.channel.as_ref().map(|c| c.id),
        provider: ctx.channel.as_ref().map(|c| c.provider.clone()),
        status,
        is_stream: ctx.is_stream,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.prompt_tokens + usage.completion_tokens,
        revenue,
        latency_ms: ctx.elapsed_ms(),
        error_message,
        client_ip: ctx.client_ip.clone(),
        created_at: Utc::now(),
    }
}

/// Append-only JSONL copy of usage records.
struct JsonlMirror {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlMirror {
    fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write(&self, log: &UsageLog) -> std::io::Result<()> {
        let json = serde_json::to_string(log)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("usage mirror lock poisoned"))?;
        writeln!(writer, "{json}")?;
        writer.flush()
    }
}

#[derive(Clone)]
pub struct UsageLogger {
    store: Arc<dyn GatewayStore>,
    mirror: Option<Arc<JsonlMirror>>,
}

impl UsageLogger {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self {
            store,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, path: impl AsRef<Path>) -> std::io::Result<Self> {
        self.mirror = Some(Arc::new(JsonlMirror::open(path.as_ref())?));
        Ok(self)
    }

    pub async fn record(&self, log: UsageLog) {
        match log.status {
            UsageStatus::Success => info!(
                request_id = %log.request_id,
                model = %log.model,
                provider = log.provider.as_deref().unwrap_or("-"),
                stream = log.is_stream,
                prompt_tokens = log.prompt_tokens,
                completion_tokens = log.completion_tokens,
                revenue = %log.revenue,
                latency_ms = log.latency_ms,
                "request completed"
            ),
            UsageStatus::Failed => warn!(
                request_id = %log.request_id,
                model = %log.model,
                provider = log.provider.as_deref().unwrap_or("-"),
                latency_ms = log.latency_ms,
                error = log.error_message.as_deref().unwrap_or("-"),
                "request failed"
            ),
        }

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.write(&log) {
                warn!(request_id = %log.request_id, error = %e, "usage mirror write failed");
            }
        }

        let request_id = log.request_id.clone();
        if let Err(e) = self.store.insert_usage_log(log).await {
            error!(request_id = %request_id, error = %e, "failed to persist usage log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApiKey, Channel, Model, User};
    use crate::store::MemoryStore;
    use std::time::Instant;

    fn ctx() -> GatewayContext {
        GatewayContext {
            request_id: "req-42".to_string(),
            started_at: Instant::now(),
            api_key: ApiKey {
                id: 3,
                user_id: 1,
                is_active: true,
                expires_at: None,
                total_quota: None,
                used_quota: Decimal::ZERO,
                rate_limit_per_minute: None,
                model_whitelist: vec![],
            },
            user: User {
                id: 1,
                balance: Decimal::ONE,
            },
            model: Model {
                id: 5,
                model_id: "gpt-4o".to_string(),
                is_active: true,
                input_price: Decimal::ONE,
                output_price: Decimal::ONE,
            },
            channel: Some(Channel {
                id: 9,
                provider: "openai".to_string(),
                api_key: "sk-upstream".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                priority: 0,
                weight: 1,
            }),
            client_ip: Some("10.1.2.3".to_string()),
            is_stream: true,
            estimated_prompt_tokens: 12,
        }
    }

    #[test]
    fn test_entry_carries_context() {
        let log = usage_entry(
            &ctx(),
            UsageStatus::Failed,
            Usage::new(10, 5),
            Decimal::ZERO,
            Some("boom".to_string()),
        );
        assert_eq!(log.request_id, "req-42");
        assert_eq!(log.channel_id, Some(9));
        assert_eq!(log.provider.as_deref(), Some("openai"));
        assert_eq!(log.total_tokens, 15);
        assert!(log.is_stream);
        assert_eq!(log.client_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(log.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_record_persists_and_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("usage.jsonl");
        let store = Arc::new(MemoryStore::new());
        let logger = UsageLogger::new(store.clone()).with_mirror(&path).unwrap();

        let entry = usage_entry(&ctx(), UsageStatus::Success, Usage::new(1, 2), Decimal::ONE, None);
        logger.record(entry.clone()).await;

        assert_eq!(store.usage_logs().unwrap(), vec![entry.clone()]);
        let written = std::fs::read_to_string(&path).unwrap();
        let parsed: UsageLog = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(parsed, entry);
    }
}
