//! Heuristic token counting used before a request is sent upstream.
//!
//! No tokenizer is loaded: CJK characters count as 1/1.5 token each, everything
//! else as 1/4 token. Each message adds a fixed overhead for its role and framing,
//! and a conversation adds a small priming constant.

use crate::translate::openai_types::ChatMessage;

const TOKENS_PER_MESSAGE: u64 = 4;
const PRIMING_TOKENS: u64 = 2;
const CJK_CHARS_PER_TOKEN: f64 = 1.5;
const OTHER_CHARS_PER_TOKEN: f64 = 4.0;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3000..=0x303F       // CJK symbols and punctuation
        | 0x3040..=0x309F     // Hiragana
        | 0x30A0..=0x30FF     // Katakana
        | 0x3400..=0x4DBF     // CJK extension A
        | 0x4E00..=0x9FFF     // CJK unified ideographs
        | 0xAC00..=0xD7AF     // Hangul syllables
        | 0xF900..=0xFAFF     // CJK compatibility ideographs
        | 0xFF00..=0xFFEF     // Halfwidth and fullwidth forms
        | 0x20000..=0x2A6DF   // CJK extension B
        | 0x2A700..=0x2EBEF)  // CJK extensions C-F
}

/// Estimate the tokens in a piece of text, rounded up.
pub fn estimate_text_tokens(text: &str) -> u64 {
    let (cjk, other) = text.chars().fold((0u64, 0u64), |(cjk, other), c| {
        if is_cjk(c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });

    let estimate = cjk as f64 / CJK_CHARS_PER_TOKEN + other as f64 / OTHER_CHARS_PER_TOKEN;
    // Guard against float noise turning an exact integer into the next one.
    let rounded = (estimate - 1e-9).ceil();
    if rounded <= 0.0 {
        0
    } else {
        rounded as u64
    }
}

/// Estimate the prompt tokens of a whole conversation.
pub fn estimate_tokens(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|m| TOKENS_PER_MESSAGE + estimate_text_tokens(&m.text()))
        .sum::<u64>()
        + PRIMING_TOKENS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::MessageContent;

    fn message(content: &str) -> ChatMessage {
        ChatMessage {
            role: "user".to_string(),
            content: Some(MessageContent::Text(content.to_string())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn test_empty_conversation_is_priming_only() {
        assert_eq!(estimate_tokens(&[]), 2);
    }

    #[test]
    fn test_empty_message_is_overhead_only() {
        assert_eq!(estimate_tokens(&[message("")]), 4 + 2);

        let no_content = ChatMessage {
            content: None,
            ..message("")
        };
        assert_eq!(estimate_tokens(&[no_content]), 4 + 2);
    }

    #[test]
    fn test_pure_cjk_text() {
        // 7 ideographs -> ceil(7 / 1.5) = 5
        let text = "你好世界大家好";
        assert_eq!(estimate_text_tokens(text), 5);
        assert_eq!(estimate_tokens(&[message(text)]), 5 + 4 + 2);

        // 3 ideographs -> exactly 2, not 3
        assert_eq!(estimate_text_tokens("日本語"), 2);
    }

    #[test]
    fn test_ascii_text() {
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
        assert_eq!(estimate_text_tokens(""), 0);
    }

    #[test]
    fn test_mixed_text() {
        // 3 CJK (2.0) + 4 ascii (1.0) = 3
        assert_eq!(estimate_text_tokens("中文字abcd"), 3);
        // Hangul counts as wide
        assert_eq!(estimate_text_tokens("한국어"), 2);
    }
}
