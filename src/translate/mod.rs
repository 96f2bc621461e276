//! Provider adapters.
//!
//! Callers speak the unified (OpenAI-shaped) format. Each adapter converts a
//! unified request into one provider's native request, and converts that
//! provider's responses and stream events back. All adapters are stateless and
//! do no I/O; the proxy owns the HTTP calls.

pub mod anthropic;
pub mod anthropic_types;
pub mod gemini;
pub mod gemini_types;
pub mod openai;
pub mod openai_types;
pub mod streaming;

use reqwest::header::HeaderMap;

use crate::error::{GatewayError, Result};
use crate::providers::{ProviderKind, ProviderPreset};
use anthropic::AnthropicAdapter;
use gemini::GeminiAdapter;
use openai::OpenAiAdapter;
use openai_types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkContext, Usage};

/// Translation contract every provider implements.
pub trait ProviderAdapter {
    /// Upstream endpoint. Some providers put the model, and sometimes the key, in the URL.
    fn build_url(&self, base_url: &str, api_key: &str, model: &str, stream: bool) -> String;

    fn build_headers(&self, api_key: &str, stream: bool) -> Result<HeaderMap>;

    fn transform_request(&self, req: &ChatCompletionRequest) -> Result<serde_json::Value>;

    fn transform_response(
        &self,
        body: &serde_json::Value,
        model: &str,
    ) -> Result<ChatCompletionResponse>;

    /// Parse one line of the upstream event stream into at most one unified chunk.
    fn parse_stream_line(&self, line: &str, ctx: &ChunkContext) -> Option<ChatCompletionChunk>;

    /// Whether the line is the provider's own end-of-stream marker.
    fn is_end_marker(&self, line: &str) -> bool;

    fn extract_usage(&self, body: &serde_json::Value) -> Option<Usage>;
}

/// The closed set of adapters, one variant per provider family.
#[derive(Debug, Clone)]
pub enum Adapter {
    OpenAi(OpenAiAdapter),
    DeepSeek(OpenAiAdapter),
    Anthropic(AnthropicAdapter),
    Google(GeminiAdapter),
}

impl Adapter {
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::OpenAi => Self::OpenAi(OpenAiAdapter::openai()),
            ProviderKind::DeepSeek => Self::DeepSeek(OpenAiAdapter::deepseek()),
            ProviderKind::Anthropic => Self::Anthropic(AnthropicAdapter),
            ProviderKind::Google => Self::Google(GeminiAdapter),
        }
    }

    /// Resolve a channel's provider name to its adapter and preset.
    ///
    /// # Errors
    /// Returns `GatewayError::UnregisteredProvider` for any name outside the preset table.
    pub fn for_provider(name: &str) -> Result<(Self, &'static ProviderPreset)> {
        let preset = ProviderPreset::from_name(name).ok_or_else(|| {
            GatewayError::UnregisteredProvider {
                name: name.to_string(),
            }
        })?;
        Ok((Self::for_kind(preset.kind), preset))
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::OpenAi(_) => ProviderKind::OpenAi,
            Self::DeepSeek(_) => ProviderKind::DeepSeek,
            Self::Anthropic(_) => ProviderKind::Anthropic,
            Self::Google(_) => ProviderKind::Google,
        }
    }

    fn inner(&self) -> &dyn ProviderAdapter {
        match self {
            Self::OpenAi(a) | Self::DeepSeek(a) => a,
            Self::Anthropic(a) => a,
            Self::Google(a) => a,
        }
    }
}

impl ProviderAdapter for Adapter {
    fn build_url(&self, base_url: &str, api_key: &str, model: &str, stream: bool) -> String {
        self.inner().build_url(base_url, api_key, model, stream)
    }

    fn build_headers(&self, api_key: &str, stream: bool) -> Result<HeaderMap> {
        self.inner().build_headers(api_key, stream)
    }

    fn transform_request(&self, req: &ChatCompletionRequest) -> Result<serde_json::Value> {
        self.inner().transform_request(req)
    }

    fn transform_response(
        &self,
        body: &serde_json::Value,
        model: &str,
    ) -> Result<ChatCompletionResponse> {
        self.inner().transform_response(body, model)
    }

    fn parse_stream_line(&self, line: &str, ctx: &ChunkContext) -> Option<ChatCompletionChunk> {
        self.inner().parse_stream_line(line, ctx)
    }

    fn is_end_marker(&self, line: &str) -> bool {
        self.inner().is_end_marker(line)
    }

    fn extract_usage(&self, body: &serde_json::Value) -> Option<Usage> {
        self.inner().extract_usage(body)
    }
}

/// Payload of an SSE `data:` line. Bare JSON lines are accepted as-is; other
/// SSE fields (`event:`, `id:`, comments) yield `None`.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(rest) = line.strip_prefix("data:") {
        return Some(rest.trim());
    }
    if line.starts_with('{') || line.starts_with('[') {
        return Some(line);
    }
    None
}

pub(crate) fn header_value(value: &str) -> Result<reqwest::header::HeaderValue> {
    reqwest::header::HeaderValue::from_str(value)
        .map_err(|_| GatewayError::internal("credential contains characters not allowed in a header"))
}
