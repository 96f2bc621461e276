//! The request pipeline.
//!
//! validate -> authenticate -> rate limit -> resolve model -> pre-check ->
//! up to `max_attempts` channel attempts -> charge -> log.
//!
//! Streaming responses are handed back as soon as an upstream accepts the
//! request; charging and logging then run as a tracked background job once the
//! stream has drained.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::billing::BillingLedger;
use crate::cache::SharedCache;
use crate::config::GatewayConfig;
use crate::deferred::DeferredJobs;
use crate::error::{GatewayError, Result};
use crate::logging::{usage_entry, UsageLogger};
use crate::models::{Channel, ChannelRecord, GatewayContext, Model, UsageStatus};
use crate::rate_limit::RateLimiter;
use crate::router::ChannelRouter;
use crate::secrets::{CredentialDecryptor, EnvelopeDecryptor};
use crate::store::GatewayStore;
use crate::tokens::{estimate_text_tokens, estimate_tokens};
use crate::translate::openai_types::{ChatCompletionRequest, ChatCompletionResponse, ChunkContext, Usage};
use crate::translate::streaming::{pump, StreamOutcome, StreamTransformer};
use crate::translate::{Adapter, ProviderAdapter};

/// Per-request facts taken from the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub request_id: String,
    pub authorization: Option<String>,
    pub client_ip: Option<String>,
}

pub enum GatewayResponse {
    Json(ChatCompletionResponse),
    /// Ready-to-send SSE frames, closed after the terminal `[DONE]`.
    Stream(mpsc::Receiver<std::result::Result<Bytes, Infallible>>),
}

/// What a successful upstream attempt produced.
enum Answer {
    Complete(ChatCompletionResponse),
    Stream(reqwest::Response),
}

pub struct Gateway {
    store: Arc<dyn GatewayStore>,
    auth: Authenticator,
    limiter: RateLimiter,
    router: ChannelRouter,
    billing: BillingLedger,
    usage: UsageLogger,
    decryptor: Arc<dyn CredentialDecryptor>,
    client: reqwest::Client,
    jobs: DeferredJobs,
    max_attempts: u32,
    stream_buffer: usize,
}

impl Gateway {
    pub fn new(
        config: &GatewayConfig,
        store: Arc<dyn GatewayStore>,
        cache: Arc<dyn SharedCache>,
        client: reqwest::Client,
    ) -> Self {
        let settings = &config.gateway;
        Self {
            auth: Authenticator::new(store.clone(), cache.clone(), config.cache.auth_ttl()),
            limiter: RateLimiter::new(
                cache.clone(),
                settings.rate_limit_window(),
                settings.ip_rate_limit_per_minute,
            ),
            router: ChannelRouter::new(store.clone(), cache, config.cache.channel_ttl()),
            billing: BillingLedger::new(store.clone(), settings.cost_ratio),
            usage: UsageLogger::new(store.clone()),
            decryptor: Arc::new(EnvelopeDecryptor),
            client,
            jobs: DeferredJobs::new(),
            max_attempts: settings.max_attempts.max(1),
            stream_buffer: settings.stream_buffer.max(1),
            store,
        }
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn CredentialDecryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn with_usage_logger(mut self, usage: UsageLogger) -> Self {
        self.usage = usage;
        self
    }

    pub fn jobs(&self) -> &DeferredJobs {
        &self.jobs
    }

    pub async fn list_models(&self) -> Result<Vec<Model>> {
        Ok(self.store.list_active_models().await?)
    }

    pub async fn allow_ip(&self, ip: &str) -> bool {
        self.limiter.allow_ip(ip).await
    }

    /// Run one chat-completion request end to end.
    pub async fn handle(self: &Arc<Self>, meta: RequestMeta, body: &[u8]) -> Result<GatewayResponse> {
        let req = parse_request(body)?;

        let record = self.auth.authenticate(meta.authorization.as_deref()).await?;
        self.limiter.check_api_key(&record.api_key).await?;

        let model = self
            .store
            .find_model(&req.model)
            .await?
            .filter(|m| m.is_active)
            .ok_or_else(|| GatewayError::ModelNotFound {
                model: req.model.clone(),
            })?;
        if !record.api_key.allows_model(&model.model_id) {
            return Err(GatewayError::ModelNotAllowed {
                model: model.model_id,
            });
        }

        let ctx = GatewayContext {
            request_id: meta.request_id,
            started_at: Instant::now(),
            api_key: record.api_key,
            user: record.user,
            model,
            channel: None,
            client_ip: meta.client_ip,
            is_stream: req.is_stream(),
            estimated_prompt_tokens: estimate_tokens(&req.messages),
        };

        debug!(
            request_id = %ctx.request_id,
            model = %ctx.model.model_id,
            stream = ctx.is_stream,
            estimated_prompt_tokens = ctx.estimated_prompt_tokens,
            "request accepted"
        );

        if let Err(e) = self
            .billing
            .pre_check_balance(&ctx.user, &ctx.model, ctx.estimated_prompt_tokens)
        {
            self.log_failure(&ctx, Usage::new(0, 0), &e).await;
            return Err(e);
        }

        self.dispatch(ctx, req).await
    }

    async fn dispatch(self: &Arc<Self>, mut ctx: GatewayContext, req: ChatCompletionRequest) -> Result<GatewayResponse> {
        let mut excluded = HashSet::new();

        for attempt in 1..=self.max_attempts {
            let record = match self.router.select(&req.model, &excluded).await {
                Ok(record) => record,
                Err(GatewayError::NoAvailableChannel { .. }) => break,
                Err(e) => {
                    self.log_failure(&ctx, Usage::new(0, 0), &e).await;
                    return Err(e);
                }
            };
            excluded.insert(record.id);

            match self.attempt(&ctx, &req, &record).await {
                Ok((adapter, channel, answer)) => {
                    info!(
                        request_id = %ctx.request_id,
                        attempt,
                        channel_id = channel.id,
                        provider = %channel.provider,
                        "upstream accepted request"
                    );
                    ctx.channel = Some(channel);
                    return match answer {
                        Answer::Complete(resp) => self.finish_complete(ctx, resp).await,
                        Answer::Stream(resp) => Ok(self.start_stream(ctx, adapter, resp)),
                    };
                }
                Err(reason) => warn!(
                    request_id = %ctx.request_id,
                    attempt,
                    channel_id = record.id,
                    provider = %record.provider,
                    reason = %reason,
                    "channel failed, excluding"
                ),
            }
        }

        let err = GatewayError::NoAvailableChannel {
            model: req.model.clone(),
        };
        self.log_failure(&ctx, Usage::new(0, 0), &err).await;
        Err(err)
    }

    /// One upstream call on one channel. Every failure is a reason to exclude
    /// the channel and try the next one.
    async fn attempt(
        &self,
        ctx: &GatewayContext,
        req: &ChatCompletionRequest,
        record: &ChannelRecord,
    ) -> std::result::Result<(Adapter, Channel, Answer), String> {
        let (adapter, preset) = Adapter::for_provider(&record.provider).map_err(|e| e.to_string())?;
        let api_key = self
            .decryptor
            .decrypt(&record.encrypted_key)
            .map_err(|e| format!("credential unusable: {e}"))?;
        let base_url = if record.base_url.trim().is_empty() {
            preset.base_url.to_string()
        } else {
            record.base_url.clone()
        };

        let stream = ctx.is_stream;
        let url = adapter.build_url(&base_url, &api_key, &req.model, stream);
        let headers = adapter
            .build_headers(&api_key, stream)
            .map_err(|e| e.to_string())?;
        let body = adapter.transform_request(req).map_err(|e| e.to_string())?;

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            // The URL may carry the key as a query parameter.
            .map_err(|e| format!("request failed: {}", e.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("upstream returned {status}: {}", truncate(&text, 300)));
        }

        let channel = Channel {
            id: record.id,
            provider: record.provider.clone(),
            api_key,
            base_url,
            priority: record.priority,
            weight: record.weight,
        };

        if stream {
            return Ok((adapter, channel, Answer::Stream(response)));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| format!("unreadable response body: {}", e.without_url()))?;
        let mut completion = adapter
            .transform_response(&json, &req.model)
            .map_err(|e| e.to_string())?;
        if completion.usage.is_none() {
            completion.usage = adapter.extract_usage(&json);
        }
        Ok((adapter, channel, Answer::Complete(completion)))
    }

    async fn finish_complete(&self, ctx: GatewayContext, mut resp: ChatCompletionResponse) -> Result<GatewayResponse> {
        let usage = settle_usage(&ctx, &resp);
        resp.usage = Some(usage);

        match self.billing.charge_user(&ctx, usage).await {
            Ok(receipt) => {
                let entry = usage_entry(&ctx, UsageStatus::Success, usage, receipt.revenue, None);
                self.usage.record(entry).await;
                Ok(GatewayResponse::Json(resp))
            }
            Err(e) => {
                self.log_failure(&ctx, usage, &e).await;
                Err(e)
            }
        }
    }

    fn start_stream(self: &Arc<Self>, ctx: GatewayContext, adapter: Adapter, resp: reqwest::Response) -> GatewayResponse {
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let transformer = StreamTransformer::new(
            adapter,
            ChunkContext::new(&ctx.model.model_id),
            ctx.estimated_prompt_tokens,
        );
        let gateway = Arc::clone(self);

        self.jobs.spawn(async move {
            let outcome = pump(resp.bytes_stream(), transformer, tx).await;
            gateway.settle_stream(ctx, outcome).await;
        });

        GatewayResponse::Stream(rx)
    }

    /// Bill and log a finished stream. The response is already gone, so
    /// failures here are only recorded.
    async fn settle_stream(&self, ctx: GatewayContext, outcome: StreamOutcome) {
        if outcome.estimated {
            debug!(request_id = %ctx.request_id, "completion tokens estimated from streamed text");
        }
        if outcome.client_disconnected {
            info!(request_id = %ctx.request_id, "client disconnected, billing partial stream");
        }

        match self.billing.charge_user(&ctx, outcome.usage).await {
            Ok(receipt) => {
                let status = if outcome.error.is_some() {
                    UsageStatus::Failed
                } else {
                    UsageStatus::Success
                };
                let entry = usage_entry(&ctx, status, outcome.usage, receipt.revenue, outcome.error);
                self.usage.record(entry).await;
            }
            Err(e) => self.log_failure(&ctx, outcome.usage, &e).await,
        }
    }

    async fn log_failure(&self, ctx: &GatewayContext, usage: Usage, err: &GatewayError) {
        let entry = usage_entry(
            ctx,
            UsageStatus::Failed,
            usage,
            rust_decimal::Decimal::ZERO,
            Some(err.to_string()),
        );
        self.usage.record(entry).await;
    }
}

/// Token counts to bill for a completed response: reported usage where
/// present, local estimates otherwise.
fn settle_usage(ctx: &GatewayContext, resp: &ChatCompletionResponse) -> Usage {
    let reported = resp.usage.unwrap_or(Usage::new(0, 0));
    let prompt = if reported.prompt_tokens > 0 {
        reported.prompt_tokens
    } else {
        ctx.estimated_prompt_tokens
    };
    let completion = if reported.completion_tokens > 0 || resp.usage.is_some() {
        reported.completion_tokens
    } else {
        let text: String = resp
            .choices
            .iter()
            .filter_map(|c| c.message.content.as_deref())
            .collect();
        estimate_text_tokens(&text)
    };
    Usage::new(prompt, completion)
}

fn invalid(message: impl Into<String>, param: &str) -> GatewayError {
    GatewayError::invalid_request(message, Some(param))
}

fn check_range(value: Option<f64>, min: f64, max: f64, param: &str) -> Result<()> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(invalid(
            format!("`{param}` must be between {min} and {max}, got {v}"),
            param,
        )),
        _ => Ok(()),
    }
}

/// Parse and validate an inbound body, naming the offending field on failure.
pub fn parse_request(body: &[u8]) -> Result<ChatCompletionRequest> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::invalid_request(format!("Invalid JSON body: {e}"), None))?;
    let obj = value
        .as_object()
        .ok_or_else(|| GatewayError::invalid_request("Request body must be a JSON object", None))?;

    match obj.get("model") {
        Some(Value::String(m)) if !m.trim().is_empty() => {}
        _ => return Err(invalid("`model` must be a non-empty string", "model")),
    }
    let messages = match obj.get("messages") {
        Some(Value::Array(m)) if !m.is_empty() => m,
        _ => return Err(invalid("`messages` must be a non-empty array", "messages")),
    };
    for (i, message) in messages.iter().enumerate() {
        if !message.get("role").is_some_and(Value::is_string) {
            return Err(invalid(
                format!("messages[{i}] must have a string `role`"),
                &format!("messages[{i}].role"),
            ));
        }
    }
    for field in ["temperature", "top_p", "presence_penalty", "frequency_penalty"] {
        if obj.get(field).is_some_and(|v| !v.is_null() && !v.is_number()) {
            return Err(invalid(format!("`{field}` must be a number"), field));
        }
    }
    for field in ["max_tokens", "n"] {
        if obj.get(field).is_some_and(|v| !v.is_null() && !v.is_u64()) {
            return Err(invalid(format!("`{field}` must be a positive integer"), field));
        }
    }
    if obj.get("stream").is_some_and(|v| !v.is_null() && !v.is_boolean()) {
        return Err(invalid("`stream` must be a boolean", "stream"));
    }

    let req: ChatCompletionRequest = serde_json::from_value(value)
        .map_err(|e| GatewayError::invalid_request(format!("Invalid request: {e}"), None))?;

    check_range(req.temperature, 0.0, 2.0, "temperature")?;
    check_range(req.top_p, 0.0, 1.0, "top_p")?;
    check_range(req.presence_penalty, -2.0, 2.0, "presence_penalty")?;
    check_range(req.frequency_penalty, -2.0, 2.0, "frequency_penalty")?;
    if req.max_tokens == Some(0) {
        return Err(invalid("`max_tokens` must be at least 1", "max_tokens"));
    }
    if req.n.is_some_and(|n| !(1..=128).contains(&n)) {
        return Err(invalid("`n` must be between 1 and 128", "n"));
    }

    Ok(req)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param_of(body: &str) -> Option<String> {
        parse_request(body.as_bytes())
            .unwrap_err()
            .param()
            .map(str::to_string)
    }

    #[test]
    fn test_valid_request() {
        let req = parse_request(
            br#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}],"stream":true,"temperature":0.2,"stop":"x"}"#,
        )
        .unwrap();
        assert_eq!(req.model, "gpt-4o-mini");
        assert!(req.is_stream());
    }

    #[test]
    fn test_offending_field_is_named() {
        assert_eq!(param_of(r#"{"messages":[{"role":"user"}]}"#).as_deref(), Some("model"));
        assert_eq!(param_of(r#"{"model":" ","messages":[{"role":"user"}]}"#).as_deref(), Some("model"));
        assert_eq!(param_of(r#"{"model":"m","messages":[]}"#).as_deref(), Some("messages"));
        assert_eq!(param_of(r#"{"model":"m","messages":[{"content":"x"}]}"#).as_deref(), Some("messages[0].role"));
        assert_eq!(
            param_of(r#"{"model":"m","messages":[{"role":"user"}],"temperature":3}"#).as_deref(),
            Some("temperature")
        );
        assert_eq!(
            param_of(r#"{"model":"m","messages":[{"role":"user"}],"top_p":"high"}"#).as_deref(),
            Some("top_p")
        );
        assert_eq!(
            param_of(r#"{"model":"m","messages":[{"role":"user"}],"max_tokens":0}"#).as_deref(),
            Some("max_tokens")
        );
        assert_eq!(
            param_of(r#"{"model":"m","messages":[{"role":"user"}],"max_tokens":-5}"#).as_deref(),
            Some("max_tokens")
        );
        assert_eq!(
            param_of(r#"{"model":"m","messages":[{"role":"user"}],"frequency_penalty":-2.5}"#).as_deref(),
            Some("frequency_penalty")
        );
        assert_eq!(
            param_of(r#"{"model":"m","messages":[{"role":"user"}],"n":0}"#).as_deref(),
            Some("n")
        );
    }

    #[test]
    fn test_malformed_json() {
        let err = parse_request(b"{not json").unwrap_err();
        assert_eq!(err.code(), "invalid_request_error");
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert!(err.param().is_none());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
