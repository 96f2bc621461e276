//! Translate unified requests into Anthropic Messages requests and back.
//!
//! System messages move to the top-level `system` field (joined if there are
//! several); every other message becomes `user` unless it is `assistant`.

use reqwest::header::{HeaderMap, CONTENT_TYPE};

use super::anthropic_types::{Message, MessagesRequest, MessagesResponse, ResponseContentBlock, Role, StreamEvent};
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Choice, ChoiceMessage,
    ChunkContext, ChunkDelta, Usage,
};
use super::{header_value, sse_data, ProviderAdapter};
use crate::error::{GatewayError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Anthropic requires `max_tokens`; used when the caller leaves it unset.
const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicAdapter;

/// Map Anthropic `stop_reason` to a unified `finish_reason`.
pub fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        other => other.to_string(),
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn build_url(&self, base_url: &str, _api_key: &str, _model: &str, _stream: bool) -> String {
        format!("{}/v1/messages", base_url.trim_end_matches('/'))
    }

    fn build_headers(&self, api_key: &str, _stream: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", header_value(api_key)?);
        headers.insert("anthropic-version", header_value(ANTHROPIC_VERSION)?);
        headers.insert(CONTENT_TYPE, header_value("application/json")?);
        Ok(headers)
    }

    fn transform_request(&self, req: &ChatCompletionRequest) -> Result<serde_json::Value> {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for msg in &req.messages {
            if msg.role == "system" {
                system_parts.push(msg.text());
                continue;
            }
            let role = if msg.role == "assistant" {
                Role::Assistant
            } else {
                Role::User
            };
            messages.push(Message {
                role,
                content: msg.text(),
            });
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        };

        let native = MessagesRequest {
            model: req.model.clone(),
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: req.temperature,
            top_p: req.top_p,
            stop_sequences: req.stop.as_ref().map(|s| s.to_vec()),
            stream: req.stream.filter(|s| *s),
        };
        Ok(serde_json::to_value(native)?)
    }

    fn transform_response(
        &self,
        body: &serde_json::Value,
        model: &str,
    ) -> Result<ChatCompletionResponse> {
        let resp: MessagesResponse = serde_json::from_value(body.clone())
            .map_err(|e| GatewayError::upstream(format!("Unparseable Anthropic message: {e}")))?;

        let text = resp
            .content
            .iter()
            .filter_map(|b| match b {
                ResponseContentBlock::Text { text } => Some(text.as_str()),
                ResponseContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let id = if resp.id.is_empty() {
            format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
        } else {
            resp.id.clone()
        };

        Ok(ChatCompletionResponse {
            id,
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
                finish_reason: resp.stop_reason.as_deref().map(map_stop_reason),
            }],
            usage: resp
                .usage
                .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
        })
    }

    fn parse_stream_line(&self, line: &str, ctx: &ChunkContext) -> Option<ChatCompletionChunk> {
        let data = sse_data(line)?;
        let event: StreamEvent = serde_json::from_str(data).ok()?;
        let kind = event.kind().to_string();

        match kind.as_str() {
            "message_start" => {
                let prompt_tokens = event
                    .message
                    .as_ref()
                    .and_then(|m| m.usage)
                    .map(|u| u.input_tokens)
                    .unwrap_or(0);
                Some(ctx.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        ..ChunkDelta::default()
                    },
                    None,
                    Some(Usage::new(prompt_tokens, 0)),
                ))
            }
            "content_block_delta" => {
                let delta = event.delta?;
                if delta.delta_type.as_deref() != Some("text_delta") {
                    return None;
                }
                Some(ctx.chunk(
                    ChunkDelta {
                        content: Some(delta.text.unwrap_or_default()),
                        ..ChunkDelta::default()
                    },
                    None,
                    None,
                ))
            }
            "message_delta" => {
                let finish = event
                    .delta
                    .and_then(|d| d.stop_reason)
                    .map(|r| map_stop_reason(&r));
                let usage = event
                    .usage
                    .map(|u| Usage::new(u.input_tokens, u.output_tokens));
                Some(ctx.chunk(ChunkDelta::default(), finish, usage))
            }
            _ => None,
        }
    }

    fn is_end_marker(&self, line: &str) -> bool {
        match sse_data(line) {
            Some(data) => serde_json::from_str::<StreamEvent>(data)
                .map(|e| e.kind() == "message_stop")
                .unwrap_or(false),
            None => line.trim() == "event: message_stop",
        }
    }

    fn extract_usage(&self, body: &serde_json::Value) -> Option<Usage> {
        let usage = body.get("usage")?;
        let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        Some(Usage::new(input, output))
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

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude-sonnet-4".to_string(),
            messages,
            stream: Some(true),
            stream_options: None,
            temperature: Some(0.5),
            top_p: None,
            max_tokens: None,
            stop: Some(StopSequences::One("END".to_string())),
            n: None,
            presence_penalty: None,
            frequency_penalty: None,
            tools: None,
            tool_choice: None,
            user: None,
        }
    }

    #[test]
    fn test_system_messages_are_extracted_and_joined() {
        let req = request(vec![
            msg("system", "Be brief."),
            msg("user", "Hi"),
            msg("system", "Answer in French."),
            msg("assistant", "Bonjour"),
            msg("tool", "42"),
        ]);
        let body = AnthropicAdapter.transform_request(&req).unwrap();

        assert_eq!(body["system"], "Be brief.\nAnswer in French.");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stop_sequences"][0], "END");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_no_system_field_without_system_messages() {
        let body = AnthropicAdapter
            .transform_request(&request(vec![msg("user", "Hi")]))
            .unwrap();
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_text_delta_round_trip() {
        let ctx = ChunkContext::new("claude-sonnet-4");
        let line = r#"data: {"delta":{"type":"text_delta","text":"hi"}}"#;
        let chunk = AnthropicAdapter.parse_stream_line(line, &ctx).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));

        let typed = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"yo"}}"#;
        let chunk = AnthropicAdapter.parse_stream_line(typed, &ctx).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("yo"));
    }

    #[test]
    fn test_stream_usage_events() {
        let ctx = ChunkContext::new("claude-sonnet-4");
        let start = r#"data: {"type":"message_start","message":{"id":"msg_1","model":"claude","content":[],"usage":{"input_tokens":25,"output_tokens":1}}}"#;
        let chunk = AnthropicAdapter.parse_stream_line(start, &ctx).unwrap();
        assert_eq!(chunk.usage.unwrap().prompt_tokens, 25);
        assert_eq!(chunk.choices[0].delta.role.as_deref(), Some("assistant"));

        let delta = r#"data: {"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":15}}"#;
        let chunk = AnthropicAdapter.parse_stream_line(delta, &ctx).unwrap();
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(chunk.usage.unwrap().completion_tokens, 15);

        assert!(AnthropicAdapter
            .parse_stream_line("event: content_block_delta", &ctx)
            .is_none());
        assert!(AnthropicAdapter
            .parse_stream_line(r#"data: {"type":"ping"}"#, &ctx)
            .is_none());
        assert!(AnthropicAdapter.is_end_marker(r#"data: {"type":"message_stop"}"#));
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason("end_turn"), "stop");
        assert_eq!(map_stop_reason("stop_sequence"), "stop");
        assert_eq!(map_stop_reason("max_tokens"), "length");
        assert_eq!(map_stop_reason("tool_use"), "tool_use");
    }

    #[test]
    fn test_transform_response() {
        let body = serde_json::json!({
            "id": "msg_abc",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-20250514",
            "content": [{"type": "text", "text": "Hello"}, {"type": "tool_use", "id": "t", "name": "n", "input": {}}, {"type": "text", "text": " there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        });
        let resp = AnthropicAdapter.transform_response(&body, "claude-sonnet-4").unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello there"));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage, Some(Usage::new(12, 4)));
        assert_eq!(AnthropicAdapter.extract_usage(&body), Some(Usage::new(12, 4)));
    }

    #[test]
    fn test_headers() {
        let headers = AnthropicAdapter.build_headers("sk-ant", true).unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert_eq!(
            AnthropicAdapter.build_url("https://api.anthropic.com/", "k", "m", true),
            "https://api.anthropic.com/v1/messages"
        );
    }
}
