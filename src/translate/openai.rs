//! Adapter for the flat-delta chat completions protocol.
//!
//! Requests carry a flat message list (system prompt included as a message), responses
//! carry `choices[0].message`, and streams are SSE `data:` lines holding partial
//! `delta` objects terminated by a literal `[DONE]`.

use serde_json::{json, Value};

use super::canonical::{
    CanonicalChunk, CanonicalRequest, CanonicalResponse, ChunkDelta as CanonicalDelta,
    ContentPart as CanonicalPart, FinishReason, ImageSource, Message, Role, SamplingParams,
    SequenceCounter, ToolChoice, ToolDefinition, Usage,
};
use super::framing::Frame;
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatContent,
    ChatErrorResponse, ChatFunction, ChatMessage, ChatTool, ChatToolCall, ChatToolCallFunction,
    ChatToolChoice, ChatToolChoiceFunction, ChatToolChoiceSpecific, ChatUsage, Choice,
    ChoiceMessage, ChunkChoice, ChunkDelta, ChunkToolCall, ChunkToolCallFunction, ContentPart,
    ImageUrlDetail, StopSequences, StreamOptions,
};
use super::streaming::DecodedFrame;
use crate::error::{Result, RouterError};

pub const DONE_SENTINEL: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn decode_request(body: Value) -> Result<CanonicalRequest> {
    let req: ChatCompletionRequest = serde_json::from_value(body).map_err(|e| {
        RouterError::invalid_request(format!("Malformed chat completion request: {e}"))
    })?;

    let messages = req
        .messages
        .into_iter()
        .map(decode_message)
        .collect::<Result<Vec<_>>>()?;

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| ToolDefinition {
            name: t.function.name,
            description: t.function.description,
            parameters: t.function.parameters,
        })
        .collect();

    let mut metadata = req.metadata;
    if let Some(user) = req.user {
        let map = metadata.get_or_insert_with(|| json!({}));
        if let Some(obj) = map.as_object_mut() {
            obj.entry("user_id").or_insert(Value::String(user));
        }
    }

    Ok(CanonicalRequest {
        model: req.model,
        messages,
        sampling: SamplingParams {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: None,
            stop: req.stop.map(StopSequences::into_vec).unwrap_or_default(),
        },
        stream: req.stream.unwrap_or(false),
        max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
        tools,
        tool_choice: req.tool_choice.map(decode_tool_choice),
        metadata,
    })
}

fn decode_message(msg: ChatMessage) -> Result<Message> {
    let role = Role::parse(&msg.role).ok_or_else(|| {
        RouterError::invalid_request(format!("Unknown message role '{}'", msg.role))
    })?;

    if role == Role::Tool {
        return Ok(Message {
            role,
            content: vec![CanonicalPart::ToolResult {
                tool_use_id: msg.tool_call_id.unwrap_or_default(),
                content: msg.content.map(content_text).unwrap_or_default(),
                is_error: false,
            }],
        });
    }

    let has_tool_calls = msg.tool_calls.as_ref().is_some_and(|c| !c.is_empty());
    let mut content = Vec::new();
    match msg.content {
        Some(ChatContent::Text(text)) => {
            if !(text.is_empty() && has_tool_calls) {
                content.push(CanonicalPart::Text { text });
            }
        }
        Some(ChatContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => content.push(CanonicalPart::Text { text }),
                    ContentPart::ImageUrl { image_url } => content.push(CanonicalPart::Image {
                        source: ImageSource::from_uri(&image_url.url),
                    }),
                }
            }
        }
        None => {}
    }

    for call in msg.tool_calls.unwrap_or_default() {
        content.push(CanonicalPart::ToolUse {
            id: call.id,
            name: call.function.name,
            input: parse_arguments(&call.function.arguments),
        });
    }

    Ok(Message { role, content })
}

fn content_text(content: ChatContent) -> String {
    match content {
        ChatContent::Text(t) => t,
        ChatContent::Parts(parts) => parts
            .into_iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Tool arguments arrive as a JSON string; keep the raw text if it doesn't parse.
fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

fn decode_tool_choice(choice: ChatToolChoice) -> ToolChoice {
    match choice {
        ChatToolChoice::String(s) => match s.as_str() {
            "required" => ToolChoice::Any,
            "none" => ToolChoice::None,
            _ => ToolChoice::Auto,
        },
        ChatToolChoice::Specific(spec) => ToolChoice::Tool {
            name: spec.function.name,
        },
    }
}

pub fn encode_request(req: &CanonicalRequest, model: &str) -> Result<Value> {
    let mut messages = Vec::new();
    for msg in &req.messages {
        encode_message(msg, &mut messages);
    }

    let tools = if req.tools.is_empty() {
        None
    } else {
        Some(
            req.tools
                .iter()
                .map(|t| ChatTool {
                    tool_type: "function".to_string(),
                    function: ChatFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        )
    };

    let body = ChatCompletionRequest {
        model: model.to_string(),
        messages,
        max_tokens: req.max_output_tokens,
        max_completion_tokens: None,
        temperature: req.sampling.temperature,
        top_p: req.sampling.top_p,
        stream: Some(req.stream),
        stream_options: req.stream.then_some(StreamOptions {
            include_usage: true,
        }),
        tools,
        tool_choice: req.tool_choice.as_ref().map(encode_tool_choice),
        stop: if req.sampling.stop.is_empty() {
            None
        } else {
            Some(StopSequences::Many(req.sampling.stop.clone()))
        },
        user: req.user_id(),
        metadata: None,
    };

    Ok(serde_json::to_value(body)?)
}

fn chat_message(role: &str, content: Option<ChatContent>) -> ChatMessage {
    ChatMessage {
        role: role.to_string(),
        content,
        tool_calls: None,
        tool_call_id: None,
        name: None,
    }
}

/// One canonical message can expand into several chat messages: tool results
/// each become their own `tool` role message.
fn encode_message(msg: &Message, out: &mut Vec<ChatMessage>) {
    match msg.role {
        Role::System => out.push(chat_message(
            "system",
            Some(ChatContent::Text(msg.joined_text())),
        )),
        Role::User | Role::Tool => encode_user_parts(msg.role, &msg.content, out),
        Role::Assistant => out.push(encode_assistant_parts(&msg.content)),
    }
}

fn encode_user_parts(role: Role, parts: &[CanonicalPart], out: &mut Vec<ChatMessage>) {
    let start = out.len();
    let mut content_parts: Vec<ContentPart> = Vec::new();

    for part in parts {
        match part {
            CanonicalPart::Text { text } => {
                content_parts.push(ContentPart::Text { text: text.clone() });
            }
            CanonicalPart::Image { source } => {
                content_parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: source.to_uri(),
                        detail: None,
                    },
                });
            }
            CanonicalPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Flush accumulated parts first so ordering is preserved
                if !content_parts.is_empty() {
                    out.push(chat_message(
                        "user",
                        Some(collapse_content_parts(&content_parts)),
                    ));
                    content_parts.clear();
                }
                let prefix = if *is_error { "ERROR: " } else { "" };
                out.push(ChatMessage {
                    tool_call_id: Some(tool_use_id.clone()),
                    ..chat_message("tool", Some(ChatContent::Text(format!("{prefix}{content}"))))
                });
            }
            CanonicalPart::ToolUse { .. } => {}
        }
    }

    if !content_parts.is_empty() {
        out.push(chat_message(
            "user",
            Some(collapse_content_parts(&content_parts)),
        ));
    }

    if out.len() == start && role == Role::User {
        out.push(chat_message("user", Some(ChatContent::Text(String::new()))));
    }
}

fn encode_assistant_parts(parts: &[CanonicalPart]) -> ChatMessage {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for part in parts {
        match part {
            CanonicalPart::Text { text } => text_parts.push(text),
            CanonicalPart::ToolUse { id, name, input } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: arguments_string(input),
                },
            }),
            CanonicalPart::Image { .. } | CanonicalPart::ToolResult { .. } => {}
        }
    }

    ChatMessage {
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        ..chat_message(
            "assistant",
            if text_parts.is_empty() {
                None
            } else {
                Some(ChatContent::Text(text_parts.concat()))
            },
        )
    }
}

fn arguments_string(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn collapse_content_parts(parts: &[ContentPart]) -> ChatContent {
    if let [ContentPart::Text { text }] = parts {
        return ChatContent::Text(text.clone());
    }
    ChatContent::Parts(parts.to_vec())
}

fn encode_tool_choice(choice: &ToolChoice) -> ChatToolChoice {
    match choice {
        ToolChoice::Auto => ChatToolChoice::String("auto".to_string()),
        ToolChoice::Any => ChatToolChoice::String("required".to_string()),
        ToolChoice::None => ChatToolChoice::String("none".to_string()),
        ToolChoice::Tool { name } => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name: name.clone() },
        }),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

pub fn finish_reason_str(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Stop => "stop".to_string(),
        FinishReason::Length => "length".to_string(),
        FinishReason::ToolCalls => "tool_calls".to_string(),
        FinishReason::ContentFilter => "content_filter".to_string(),
        FinishReason::Other(other) => other.clone(),
    }
}

fn usage_from(usage: &ChatUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
    }
}

fn chat_usage(usage: Usage) -> ChatUsage {
    let total_tokens = match (usage.input_tokens, usage.output_tokens) {
        (Some(i), Some(o)) => Some(i + o),
        _ => None,
    };
    ChatUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens,
    }
}

pub fn decode_response(body: &[u8]) -> Result<CanonicalResponse> {
    let resp: ChatCompletionResponse = serde_json::from_slice(body)
        .map_err(|e| RouterError::decode(format!("Malformed chat completion response: {e}")))?;

    let mut content = Vec::new();
    let mut finish_reason = None;

    if let Some(choice) = resp.choices.into_iter().next() {
        // Reasoning models may put the whole answer in reasoning_content
        let text = choice
            .message
            .content
            .filter(|s| !s.is_empty())
            .or(choice.message.reasoning_content.filter(|s| !s.is_empty()));
        if let Some(text) = text {
            content.push(CanonicalPart::Text { text });
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            content.push(CanonicalPart::ToolUse {
                id: call.id,
                name: call.function.name,
                input: parse_arguments(&call.function.arguments),
            });
        }
        finish_reason = choice.finish_reason.as_deref().map(parse_finish_reason);
    }

    Ok(CanonicalResponse {
        id: resp.id,
        model: resp.model,
        role: Role::Assistant,
        content,
        finish_reason,
        usage: resp.usage.as_ref().map(usage_from).unwrap_or_default(),
    })
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

pub fn encode_response(resp: &CanonicalResponse) -> Result<Value> {
    let text = resp.text();
    let tool_calls: Vec<ChatToolCall> = resp
        .content
        .iter()
        .filter_map(|p| match p {
            CanonicalPart::ToolUse { id, name, input } => Some(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: arguments_string(input),
                },
            }),
            _ => None,
        })
        .collect();

    let id = if resp.id.starts_with("chatcmpl-") {
        resp.id.clone()
    } else {
        format!("chatcmpl-{}", resp.id.trim_start_matches("msg_"))
    };

    let body = ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(text)
                },
                reasoning_content: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: Some(
                resp.finish_reason
                    .as_ref()
                    .map_or_else(|| "stop".to_string(), finish_reason_str),
            ),
        }],
        usage: if resp.usage.is_unset() {
            None
        } else {
            Some(chat_usage(resp.usage))
        },
    };

    Ok(serde_json::to_value(body)?)
}

pub fn encode_error(err: &RouterError) -> Value {
    json!({
        "error": {
            "message": err.caller_message(),
            "type": err.error_type(),
            "code": err.upstream_status(),
        }
    })
}

pub fn upstream_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ChatErrorResponse>(body)
        .ok()
        .map(|e| e.error.message)
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Turns `data:` frames into canonical chunks.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    started: bool,
}

impl ChunkDecoder {
    pub fn decode(&mut self, frame: &Frame, seq: &mut SequenceCounter) -> Result<DecodedFrame> {
        let data = frame.data.trim();
        if data == DONE_SENTINEL {
            return Ok(DecodedFrame::done());
        }

        let value: Value = serde_json::from_str(data)
            .map_err(|e| RouterError::decode(format!("Malformed stream chunk: {e}")))?;
        if let Some(message) = upstream_error_message(data) {
            return Err(RouterError::upstream(502, message, data));
        }
        let chunk: ChatCompletionChunk = serde_json::from_value(value)
            .map_err(|e| RouterError::decode(format!("Malformed stream chunk: {e}")))?;

        let first = !self.started;
        self.started = true;

        let mut deltas = Vec::new();
        let mut role = None;
        let mut finish_reason = None;

        if let Some(choice) = chunk.choices.into_iter().next() {
            role = choice.delta.role.as_deref().and_then(Role::parse);
            let text = choice
                .delta
                .content
                .filter(|s| !s.is_empty())
                .or(choice.delta.reasoning_content.filter(|s| !s.is_empty()));
            if let Some(text) = text {
                deltas.push(CanonicalDelta::Text { text });
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = tc
                    .function
                    .map(|f| (f.name, f.arguments.unwrap_or_default()))
                    .unwrap_or_default();
                deltas.push(CanonicalDelta::ToolCall {
                    index: usize::try_from(tc.index).unwrap_or_default(),
                    id: tc.id,
                    name,
                    arguments,
                });
            }
            finish_reason = choice.finish_reason.as_deref().map(parse_finish_reason);
        }

        let mut chunks: Vec<CanonicalChunk> = deltas
            .into_iter()
            .map(|delta| CanonicalChunk {
                delta: Some(delta),
                ..CanonicalChunk::empty(0)
            })
            .collect();
        if chunks.is_empty() {
            chunks.push(CanonicalChunk::empty(0));
        }

        if let Some(head) = chunks.first_mut() {
            head.role = role;
            if first {
                head.id = Some(chunk.id).filter(|s| !s.is_empty());
                head.model = Some(chunk.model).filter(|s| !s.is_empty());
            }
        }
        if let Some(tail) = chunks.last_mut() {
            tail.finish_reason = finish_reason;
            tail.usage = chunk.usage.as_ref().map(usage_from);
        }

        chunks.retain(|c| !c.is_blank());
        for c in &mut chunks {
            c.sequence = seq.next();
        }
        Ok(DecodedFrame::chunks(chunks))
    }
}

/// Renders canonical chunks as flat-delta `data:` frames.
///
/// Usage is held back and sent in a trailing chunk with empty `choices`, followed by
/// the `[DONE]` sentinel.
#[derive(Debug)]
pub struct ChunkEncoder {
    id: String,
    model: String,
    created: u64,
    sent_role: bool,
    sent_finish: bool,
    usage: Usage,
    finished: bool,
}

impl ChunkEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: unix_now(),
            sent_role: false,
            sent_finish: false,
            usage: Usage::default(),
            finished: false,
        }
    }

    pub fn encode(&mut self, chunk: &CanonicalChunk) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        if let Some(usage) = chunk.usage {
            self.usage.merge(usage);
        }

        let mut delta = ChunkDelta::default();
        match &chunk.delta {
            Some(CanonicalDelta::Text { text }) if !text.is_empty() => {
                delta.content = Some(text.clone());
            }
            Some(CanonicalDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            }) => {
                delta.tool_calls = Some(vec![ChunkToolCall {
                    index: *index as u64,
                    id: id.clone(),
                    call_type: id.as_ref().map(|_| "function".to_string()),
                    function: Some(ChunkToolCallFunction {
                        name: name.clone(),
                        arguments: Some(arguments.clone()),
                    }),
                }]);
            }
            _ => {}
        }

        let finish_reason = chunk.finish_reason.as_ref().map(finish_reason_str);
        let has_payload = delta.content.is_some() || delta.tool_calls.is_some();
        if !has_payload && finish_reason.is_none() && (self.sent_role || chunk.role.is_none()) {
            return Vec::new();
        }

        if !self.sent_role {
            delta.role = Some("assistant".to_string());
            self.sent_role = true;
        }
        if finish_reason.is_some() {
            self.sent_finish = true;
        }

        vec![self.frame(delta, finish_reason)]
    }

    /// Terminal frames: a synthesized finish if none was seen, usage, then `[DONE]`.
    pub fn finish(&mut self) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut frames = Vec::new();
        if !self.sent_finish {
            let mut delta = ChunkDelta::default();
            if !self.sent_role {
                delta.role = Some("assistant".to_string());
                self.sent_role = true;
            }
            frames.push(self.frame(delta, Some("stop".to_string())));
        }
        if !self.usage.is_unset() {
            let chunk = ChatCompletionChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: Vec::new(),
                usage: Some(chat_usage(self.usage)),
            };
            frames.push(Frame::data(
                serde_json::to_string(&chunk).unwrap_or_default(),
            ));
        }
        frames.push(Frame::data(DONE_SENTINEL));
        frames
    }

    pub fn error(&mut self, err: &RouterError) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![Frame::data(encode_error(err).to_string())]
    }

    fn frame(&self, delta: ChunkDelta, finish_reason: Option<String>) -> Frame {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        };
        Frame::data(serde_json::to_string(&chunk).unwrap_or_default())
    }
}
