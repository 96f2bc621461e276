//! Built-in provider presets.
//!
//! A channel names its provider by string. The preset table maps that name to
//! the adapter family that speaks its wire format and a default base URL, so a
//! channel only needs a credential unless it points somewhere custom.

/// The adapter families the gateway can translate for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    DeepSeek,
}

#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub kind: ProviderKind,
    pub base_url: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "openai",
        kind: ProviderKind::OpenAi,
        base_url: "https://api.openai.com/v1",
    },
    ProviderPreset {
        name: "openrouter",
        kind: ProviderKind::OpenAi,
        base_url: "https://openrouter.ai/api/v1",
    },
    ProviderPreset {
        name: "fireworks",
        kind: ProviderKind::OpenAi,
        base_url: "https://api.fireworks.ai/inference/v1",
    },
    ProviderPreset {
        name: "grok",
        kind: ProviderKind::OpenAi,
        base_url: "https://api.x.ai/v1",
    },
    ProviderPreset {
        name: "together",
        kind: ProviderKind::OpenAi,
        base_url: "https://api.together.xyz/v1",
    },
    ProviderPreset {
        name: "groq",
        kind: ProviderKind::OpenAi,
        base_url: "https://api.groq.com/openai/v1",
    },
    ProviderPreset {
        name: "anthropic",
        kind: ProviderKind::Anthropic,
        base_url: "https://api.anthropic.com",
    },
    ProviderPreset {
        name: "claude",
        kind: ProviderKind::Anthropic,
        base_url: "https://api.anthropic.com",
    },
    ProviderPreset {
        name: "google",
        kind: ProviderKind::Google,
        base_url: "https://generativelanguage.googleapis.com/v1beta",
    },
    ProviderPreset {
        name: "gemini",
        kind: ProviderKind::Google,
        base_url: "https://generativelanguage.googleapis.com/v1beta",
    },
    ProviderPreset {
        name: "deepseek",
        kind: ProviderKind::DeepSeek,
        base_url: "https://api.deepseek.com",
    },
];

impl ProviderPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        let name = name.trim().to_lowercase();
        PRESETS.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_providers() {
        assert!(ProviderPreset::from_name("openai").is_some());
        assert!(ProviderPreset::from_name("fireworks").is_some());
        assert!(ProviderPreset::from_name("OpenRouter").is_some()); // case-insensitive
        assert!(ProviderPreset::from_name("unknown_provider").is_none());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            ProviderPreset::from_name("claude").map(|p| p.kind),
            Some(ProviderKind::Anthropic)
        );
        assert_eq!(
            ProviderPreset::from_name("gemini").map(|p| p.kind),
            Some(ProviderKind::Google)
        );
        assert_eq!(
            ProviderPreset::from_name("deepseek").map(|p| p.kind),
            Some(ProviderKind::DeepSeek)
        );
    }

    #[test]
    fn test_openai_compatible_names_share_the_openai_kind() {
        for name in ["openrouter", "fireworks", "grok", "together", "groq"] {
            let preset = ProviderPreset::from_name(name).unwrap();
            assert_eq!(preset.kind, ProviderKind::OpenAi, "{name}");
        }
    }
}
