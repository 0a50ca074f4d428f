//! Protocol-neutral request and response representation.
//!
//! Every supported wire format is decoded into these types and encoded back out of
//! them. The mutation pipeline operates on their JSON form, so field names here are
//! the paths users write in config (`$.metadata`, `$.messages[0].content`, ...).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" | "developer" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" | "function" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

impl ImageSource {
    /// Splits `data:<media>;base64,<payload>` URIs, anything else is kept as a URL.
    pub fn from_uri(uri: &str) -> Self {
        if let Some(rest) = uri.strip_prefix("data:") {
            if let Some((media_type, data)) = rest.split_once(";base64,") {
                return ImageSource::Base64 {
                    media_type: media_type.to_string(),
                    data: data.to_string(),
                };
            }
        }
        ImageSource::Url {
            url: uri.to_string(),
        }
    }

    pub fn to_uri(&self) -> String {
        match self {
            ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
            ImageSource::Url { url } => url.clone(),
        }
    }
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(text)],
        }
    }

    /// Concatenation of all text parts.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    None,
    Tool { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    /// Logical model name as the caller sent it
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl CanonicalRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            sampling: SamplingParams::default(),
            stream: false,
            max_output_tokens: None,
            tools: Vec::new(),
            tool_choice: None,
            metadata: None,
        }
    }

    /// System messages joined, in order.
    pub fn system_text(&self) -> Option<String> {
        let parts: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::joined_text)
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    pub fn user_id(&self) -> Option<String> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

/// Token counters. `None` means the backend did not report the counter,
/// which is not the same as reporting zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

impl Usage {
    pub fn is_unset(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none()
    }

    /// Later reports win, unset counters never erase known ones.
    pub fn merge(&mut self, other: Usage) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub usage: Usage,
}

impl CanonicalResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkDelta {
    Text {
        text: String,
    },
    /// Incremental tool call; `id`/`name` are set on the first fragment only.
    ToolCall {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalChunk {
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChunkDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CanonicalChunk {
    pub fn empty(sequence: u64) -> Self {
        Self {
            sequence,
            id: None,
            model: None,
            role: None,
            delta: None,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn text(sequence: u64, text: impl Into<String>) -> Self {
        Self {
            delta: Some(ChunkDelta::Text { text: text.into() }),
            ..Self::empty(sequence)
        }
    }

    /// Nothing a caller-side encoder could render.
    pub fn is_blank(&self) -> bool {
        self.id.is_none()
            && self.model.is_none()
            && self.role.is_none()
            && self.delta.is_none()
            && self.finish_reason.is_none()
            && self.usage.is_none()
    }
}

/// Hands out strictly increasing chunk sequence numbers for one stream.
#[derive(Debug, Default)]
pub struct SequenceCounter(u64);

impl SequenceCounter {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// Mutable access to every free-text field, used by pattern rules.
pub trait TextFields {
    fn for_each_text_mut(&mut self, f: &mut dyn FnMut(&mut String));
}

impl TextFields for CanonicalRequest {
    fn for_each_text_mut(&mut self, f: &mut dyn FnMut(&mut String)) {
        for msg in &mut self.messages {
            for part in &mut msg.content {
                match part {
                    ContentPart::Text { text } => f(text),
                    ContentPart::ToolResult { content, .. } => f(content),
                    ContentPart::Image { .. } | ContentPart::ToolUse { .. } => {}
                }
            }
        }
    }
}

impl TextFields for CanonicalResponse {
    fn for_each_text_mut(&mut self, f: &mut dyn FnMut(&mut String)) {
        for part in &mut self.content {
            if let ContentPart::Text { text } = part {
                f(text);
            }
        }
    }
}

impl TextFields for CanonicalChunk {
    fn for_each_text_mut(&mut self, f: &mut dyn FnMut(&mut String)) {
        if let Some(ChunkDelta::Text { text }) = &mut self.delta {
            f(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_merge_keeps_known_counters() {
        let mut usage = Usage {
            input_tokens: Some(12),
            output_tokens: None,
        };
        usage.merge(Usage {
            input_tokens: None,
            output_tokens: Some(0),
        });
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(0));
        assert!(!usage.is_unset());
        assert!(Usage::default().is_unset());
    }

    #[test]
    fn test_system_text_joins_in_order() {
        let req = CanonicalRequest::new(
            "m",
            vec![
                Message::text(Role::System, "a"),
                Message::text(Role::User, "hi"),
                Message::text(Role::System, "b"),
            ],
        );
        assert_eq!(req.system_text().as_deref(), Some("a\nb"));
    }

    #[test]
    fn test_image_source_from_uri() {
        assert_eq!(
            ImageSource::from_uri("data:image/png;base64,AAAA"),
            ImageSource::Base64 {
                media_type: "image/png".to_string(),
                data: "AAAA".to_string()
            }
        );
        let url = ImageSource::from_uri("https://example.com/cat.png");
        assert_eq!(url.to_uri(), "https://example.com/cat.png");
    }

    #[test]
    fn test_sequence_counter_strictly_increases() {
        let mut seq = SequenceCounter::default();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
    }
}
