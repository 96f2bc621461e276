//! OpenAI-compatible upstreams. The unified format is already theirs, so this is
//! a near-identity passthrough. DeepSeek uses the same translation on a different path.

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};

use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkContext,
    StreamOptions, Usage,
};
use super::{header_value, sse_data, ProviderAdapter};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    path: &'static str,
}

impl OpenAiAdapter {
    pub fn openai() -> Self {
        Self {
            path: "/chat/completions",
        }
    }

    pub fn deepseek() -> Self {
        Self {
            path: "/v1/chat/completions",
        }
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn build_url(&self, base_url: &str, _api_key: &str, _model: &str, _stream: bool) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.path)
    }

    fn build_headers(&self, api_key: &str, _stream: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {api_key}"))?);
        headers.insert(CONTENT_TYPE, header_value("application/json")?);
        Ok(headers)
    }

    fn transform_request(&self, req: &ChatCompletionRequest) -> Result<serde_json::Value> {
        let mut upstream = req.clone();
        // Ask for usage in the final chunk so streamed requests can be billed.
        upstream.stream_options = req.is_stream().then_some(StreamOptions {
            include_usage: true,
        });
        Ok(serde_json::to_value(upstream)?)
    }

    fn transform_response(
        &self,
        body: &serde_json::Value,
        model: &str,
    ) -> Result<ChatCompletionResponse> {
        let mut resp: ChatCompletionResponse = serde_json::from_value(body.clone())
            .map_err(|e| GatewayError::upstream(format!("Unparseable completion: {e}")))?;
        resp.model = model.to_string();
        Ok(resp)
    }

    fn parse_stream_line(&self, line: &str, ctx: &ChunkContext) -> Option<ChatCompletionChunk> {
        let data = sse_data(line)?;
        if data == "[DONE]" {
            return None;
        }
        let mut chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable chunk");
                return None;
            }
        };
        chunk.model = ctx.model.clone();
        Some(chunk)
    }

    fn is_end_marker(&self, line: &str) -> bool {
        sse_data(line) == Some("[DONE]")
    }

    fn extract_usage(&self, body: &serde_json::Value) -> Option<Usage> {
        body.get("usage")
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::{ChatMessage, MessageContent};

    fn request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Some(MessageContent::Text("Hello".to_string())),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }],
            stream: Some(stream),
            stream_options: None,
            temperature: Some(0.2),
            top_p: None,
            max_tokens: Some(64),
            stop: None,
            n: None,
            presence_penalty: None,
            frequency_penalty: None,
            tools: Some(serde_json::json!([{"type": "function", "function": {"name": "f"}}])),
            tool_choice: None,
            user: None,
        }
    }

    #[test]
    fn test_passthrough_keeps_fields() {
        let body = OpenAiAdapter::openai().transform_request(&request(false)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["tools"][0]["function"]["name"], "f");
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_streaming_requests_inline_usage() {
        let body = OpenAiAdapter::openai().transform_request(&request(true)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_urls_differ_only_by_path() {
        let openai = OpenAiAdapter::openai().build_url("https://api.openai.com/v1/", "k", "m", false);
        assert_eq!(openai, "https://api.openai.com/v1/chat/completions");
        let deepseek = OpenAiAdapter::deepseek().build_url("https://api.deepseek.com", "k", "m", true);
        assert_eq!(deepseek, "https://api.deepseek.com/v1/chat/completions");
    }

    #[test]
    fn test_bearer_header() {
        let headers = OpenAiAdapter::openai().build_headers("sk-123", false).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-123");
    }

    #[test]
    fn test_parse_stream_line() {
        let adapter = OpenAiAdapter::openai();
        let ctx = ChunkContext::new("gpt-4o-mini");
        let line = r#"data: {"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o-mini-2024","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        let chunk = adapter.parse_stream_line(line, &ctx).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
        assert_eq!(chunk.model, "gpt-4o-mini");

        let usage_line = r#"data: {"id":"c1","object":"chat.completion.chunk","created":1,"model":"x","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#;
        let chunk = adapter.parse_stream_line(usage_line, &ctx).unwrap();
        assert_eq!(chunk.usage, Some(Usage::new(3, 5)));

        assert!(adapter.parse_stream_line("data: [DONE]", &ctx).is_none());
        assert!(adapter.is_end_marker("data: [DONE]"));
        assert!(adapter.parse_stream_line("data: not json", &ctx).is_none());
    }

    #[test]
    fn test_transform_response_and_usage() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
        });
        let adapter = OpenAiAdapter::openai();
        let resp = adapter.transform_response(&body, "gpt-4o-mini").unwrap();
        assert_eq!(resp.model, "gpt-4o-mini");
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello!"));
        assert_eq!(adapter.extract_usage(&body), Some(Usage::new(9, 2)));
    }
}
