//! Built-in presets for the supported backend protocol families.
//!
//! Each preset defines the default endpoint, the request path, how credentials are
//! attached and how streamed responses are framed. A route names its family in
//! config and the preset fills in the rest.

use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of wire protocol families the router speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Flat-delta chat completions
    OpenAi,
    /// Typed lifecycle-event messages
    Anthropic,
    /// Newline-delimited native chat
    Ollama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Sse,
    Ndjson,
}

#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub protocol: Protocol,
    pub name: &'static str,
    pub default_endpoint: &'static str,
    pub path: &'static str,
    pub auth: AuthStyle,
    pub framing: Framing,
    pub default_api_key_env: Option<&'static str>,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        protocol: Protocol::OpenAi,
        name: "openai",
        default_endpoint: "https://api.openai.com/v1",
        path: "/chat/completions",
        auth: AuthStyle::Bearer,
        framing: Framing::Sse,
        default_api_key_env: Some("OPENAI_API_KEY"),
    },
    ProviderPreset {
        protocol: Protocol::Anthropic,
        name: "anthropic",
        default_endpoint: "https://api.anthropic.com",
        path: "/v1/messages",
        auth: AuthStyle::ApiKeyHeader,
        framing: Framing::Sse,
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
    },
    ProviderPreset {
        protocol: Protocol::Ollama,
        name: "ollama",
        default_endpoint: "http://localhost:11434",
        path: "/api/chat",
        auth: AuthStyle::Bearer,
        framing: Framing::Ndjson,
        default_api_key_env: None,
    },
];

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

impl Protocol {
    pub fn from_name(name: &str) -> Result<Self> {
        ProviderPreset::from_name(name)
            .map(|p| p.protocol)
            .ok_or_else(|| {
                RouterError::config(format!(
                    "Unknown backend kind '{}'. Known kinds: openai, anthropic, ollama",
                    name
                ))
            })
    }

    #[must_use]
    pub fn preset(self) -> &'static ProviderPreset {
        match self {
            Protocol::OpenAi => &PRESETS[0],
            Protocol::Anthropic => &PRESETS[1],
            Protocol::Ollama => &PRESETS[2],
        }
    }

    #[must_use]
    pub fn framing(self) -> Framing {
        self.preset().framing
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.preset().name)
    }
}

impl ProviderPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        PRESETS.iter().find(|p| p.name == name.to_lowercase())
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_kinds() {
        assert_eq!(Protocol::from_name("openai").unwrap(), Protocol::OpenAi);
        assert_eq!(Protocol::from_name("Anthropic").unwrap(), Protocol::Anthropic); // case-insensitive
        assert!(matches!(
            Protocol::from_name("bedrock"),
            Err(RouterError::Configuration { .. })
        ));
    }

    #[test]
    fn test_preset_lookup_matches_table() {
        for preset in ProviderPreset::all() {
            assert_eq!(preset.protocol.preset().name, preset.name);
        }
    }

    #[test]
    fn test_only_native_uses_ndjson() {
        assert_eq!(Protocol::Ollama.framing(), Framing::Ndjson);
        assert_eq!(Protocol::OpenAi.framing(), Framing::Sse);
        assert_eq!(Protocol::Anthropic.framing(), Framing::Sse);
    }
}
