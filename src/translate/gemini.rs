//! Translate unified requests into Gemini `generateContent` requests and back.
//!
//! Streaming uses a different endpoint (`streamGenerateContent?alt=sse`) and
//! carries the key as a query parameter; single-shot calls send it as a header.

use reqwest::header::{HeaderMap, CONTENT_TYPE};

use super::gemini_types::{Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part};
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Choice, ChoiceMessage,
    ChunkContext, ChunkDelta, Usage,
};
use super::{header_value, sse_data, ProviderAdapter};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiAdapter;

/// Map Gemini `finishReason` to a unified `finish_reason`.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" => "content_filter".to_string(),
        other => other.to_string(),
    }
}

fn text_part(text: String) -> Part {
    Part { text: Some(text) }
}

fn usage_of(resp: &GenerateContentResponse) -> Option<Usage> {
    resp.usage_metadata
        .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
}

impl ProviderAdapter for GeminiAdapter {
    fn build_url(&self, base_url: &str, api_key: &str, model: &str, stream: bool) -> String {
        let base = base_url.trim_end_matches('/');
        if stream {
            format!("{base}/models/{model}:streamGenerateContent?alt=sse&key={api_key}")
        } else {
            format!("{base}/models/{model}:generateContent")
        }
    }

    fn build_headers(&self, api_key: &str, stream: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value("application/json")?);
        if !stream {
            headers.insert("x-goog-api-key", header_value(api_key)?);
        }
        Ok(headers)
    }

    fn transform_request(&self, req: &ChatCompletionRequest) -> Result<serde_json::Value> {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for msg in &req.messages {
            if msg.role == "system" {
                system_parts.push(text_part(msg.text()));
                continue;
            }
            let role = if msg.role == "assistant" { "model" } else { "user" };
            contents.push(Content {
                role: Some(role.to_string()),
                parts: vec![text_part(msg.text())],
            });
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: system_parts,
            })
        };

        let generation_config = GenerationConfig {
            max_output_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stop_sequences: req.stop.as_ref().map(|s| s.to_vec()),
        };

        let native = GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: (!generation_config.is_empty()).then_some(generation_config),
        };
        Ok(serde_json::to_value(native)?)
    }

    fn transform_response(
        &self,
        body: &serde_json::Value,
        model: &str,
    ) -> Result<ChatCompletionResponse> {
        let resp: GenerateContentResponse = serde_json::from_value(body.clone())
            .map_err(|e| GatewayError::upstream(format!("Unparseable Gemini response: {e}")))?;

        let candidate = resp.candidates.first();
        let text = candidate.map(|c| c.text()).unwrap_or_default();
        let finish_reason = candidate
            .and_then(|c| c.finish_reason.as_deref())
            .map(map_finish_reason);

        Ok(ChatCompletionResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: Some(text),
                    tool_calls: None,
                },
                finish_reason,
            }],
            usage: usage_of(&resp),
        })
    }

    fn parse_stream_line(&self, line: &str, ctx: &ChunkContext) -> Option<ChatCompletionChunk> {
        let data = sse_data(line)?;
        let resp: GenerateContentResponse = serde_json::from_str(data).ok()?;

        let candidate = resp.candidates.first();
        let text = candidate.map(|c| c.text()).unwrap_or_default();
        let finish_reason = candidate
            .and_then(|c| c.finish_reason.as_deref())
            .map(map_finish_reason);
        let usage = usage_of(&resp);

        if text.is_empty() && finish_reason.is_none() && usage.is_none() {
            return None;
        }

        Some(ctx.chunk(
            ChunkDelta {
                content: (!text.is_empty()).then_some(text),
                ..ChunkDelta::default()
            },
            finish_reason,
            usage,
        ))
    }

    /// Gemini closes the connection instead of sending a marker.
    fn is_end_marker(&self, _line: &str) -> bool {
        false
    }

    fn extract_usage(&self, body: &serde_json::Value) -> Option<Usage> {
        let resp: GenerateContentResponse = serde_json::from_value(body.clone()).ok()?;
        usage_of(&resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::{ChatMessage, MessageContent, StopSequences};

    fn msg(role: &str, text: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: Some(MessageContent::Text(text.to_string())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![
                msg("system", "Be terse."),
                msg("user", "Hi"),
                msg("assistant", "Hello"),
                msg("user", "Bye"),
            ],
            stream: None,
            stream_options: None,
            temperature: Some(0.3),
            top_p: Some(0.9),
            max_tokens: Some(128),
            stop: Some(StopSequences::Many(vec!["a".into(), "b".into()])),
            n: None,
            presence_penalty: None,
            frequency_penalty: None,
            tools: None,
            tool_choice: None,
            user: None,
        }
    }

    #[test]
    fn test_request_shape() {
        let body = GeminiAdapter.transform_request(&request()).unwrap();

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be terse.");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "Hello");

        let config = &body["generationConfig"];
        assert_eq!(config["maxOutputTokens"], 128);
        assert_eq!(config["temperature"], 0.3);
        assert_eq!(config["topP"], 0.9);
        assert_eq!(config["stopSequences"][1], "b");
    }

    #[test]
    fn test_generation_config_omitted_when_empty() {
        let mut req = request();
        req.temperature = None;
        req.top_p = None;
        req.max_tokens = None;
        req.stop = None;
        let body = GeminiAdapter.transform_request(&req).unwrap();
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn test_key_placement_depends_on_streaming() {
        let base = "https://generativelanguage.googleapis.com/v1beta";

        let url = GeminiAdapter.build_url(base, "AIza", "gemini-2.0-flash", false);
        assert_eq!(url, format!("{base}/models/gemini-2.0-flash:generateContent"));
        let headers = GeminiAdapter.build_headers("AIza", false).unwrap();
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "AIza");

        let url = GeminiAdapter.build_url(base, "AIza", "gemini-2.0-flash", true);
        assert_eq!(
            url,
            format!("{base}/models/gemini-2.0-flash:streamGenerateContent?alt=sse&key=AIza")
        );
        let headers = GeminiAdapter.build_headers("AIza", true).unwrap();
        assert!(headers.get("x-goog-api-key").is_none());
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("STOP"), "stop");
        assert_eq!(map_finish_reason("MAX_TOKENS"), "length");
        assert_eq!(map_finish_reason("SAFETY"), "content_filter");
        assert_eq!(map_finish_reason("RECITATION"), "RECITATION");
    }

    #[test]
    fn test_transform_response() {
        let body = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}, {"text": "lo"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 2, "totalTokenCount": 9}
        });
        let resp = GeminiAdapter.transform_response(&body, "gemini-2.0-flash").unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello"));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage, Some(Usage::new(7, 2)));
    }

    #[test]
    fn test_parse_stream_line() {
        let ctx = ChunkContext::new("gemini-2.0-flash");
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"Hi"}],"role":"model"}}],"usageMetadata":{"promptTokenCount":4}}"#;
        let chunk = GeminiAdapter.parse_stream_line(line, &ctx).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
        assert_eq!(chunk.usage.unwrap().prompt_tokens, 4);

        let last = r#"data: {"candidates":[{"content":{"parts":[{"text":""}]},"finishReason":"MAX_TOKENS"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":9}}"#;
        let chunk = GeminiAdapter.parse_stream_line(last, &ctx).unwrap();
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("length"));
        assert!(chunk.choices[0].delta.content.is_none());

        assert!(GeminiAdapter.parse_stream_line("data: {}", &ctx).is_none());
    }
}
