//! Adapter for the typed-event messages protocol.
//!
//! The system prompt is a top-level field, `max_tokens` is mandatory and roles must
//! alternate between `user` and `assistant`. Streams are SSE with an `event:` name per
//! lifecycle step: `message_start`, `content_block_start`, `content_block_delta`,
//! `content_block_stop`, `message_delta`, `message_stop`.

use std::collections::HashMap;

use serde_json::{json, Value};

use super::anthropic_types::{
    ContentBlock, Delta, ErrorResponse, ImageSource as BlockImageSource, Message as WireMessage,
    MessageContent, MessageDeltaBody, MessagesRequest, MessagesResponse, ResponseContentBlock,
    Role as WireRole, StreamEvent, SystemContent, Tool, ToolChoice as WireToolChoice,
    ToolResultContent, Usage as WireUsage,
};
use super::canonical::{
    CanonicalChunk, CanonicalRequest, CanonicalResponse, ChunkDelta, ContentPart, FinishReason,
    ImageSource, Message, Role, SamplingParams, SequenceCounter, ToolChoice, ToolDefinition,
    Usage,
};
use super::framing::Frame;
use super::streaming::DecodedFrame;
use crate::error::{Result, RouterError};

/// Used when the caller's protocol had no output limit; the messages API requires one.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn decode_request(body: Value) -> Result<CanonicalRequest> {
    let req: MessagesRequest = serde_json::from_value(body)
        .map_err(|e| RouterError::invalid_request(format!("Malformed messages request: {e}")))?;

    let mut messages = Vec::new();
    if let Some(ref system) = req.system {
        messages.push(Message::text(Role::System, system.as_text()));
    }
    for msg in &req.messages {
        messages.push(decode_message(msg));
    }

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|t| ToolDefinition {
            name: t.name,
            description: t.description,
            parameters: t.input_schema,
        })
        .collect();

    Ok(CanonicalRequest {
        model: req.model,
        messages,
        sampling: SamplingParams {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop: req.stop_sequences.unwrap_or_default(),
        },
        stream: req.stream.unwrap_or(false),
        max_output_tokens: Some(req.max_tokens),
        tools,
        tool_choice: req.tool_choice.map(|c| match c {
            WireToolChoice::Auto => ToolChoice::Auto,
            WireToolChoice::Any => ToolChoice::Any,
            WireToolChoice::None => ToolChoice::None,
            WireToolChoice::Tool { name } => ToolChoice::Tool { name },
        }),
        metadata: req.metadata,
    })
}

fn decode_message(msg: &WireMessage) -> Message {
    let role = match msg.role {
        WireRole::User => Role::User,
        WireRole::Assistant => Role::Assistant,
    };
    let content = msg
        .content
        .blocks()
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(ContentPart::Text { text }),
            ContentBlock::Image { source } => Some(ContentPart::Image {
                source: match source {
                    BlockImageSource::Base64 { media_type, data } => {
                        ImageSource::Base64 { media_type, data }
                    }
                    BlockImageSource::Url { url } => ImageSource::Url { url },
                },
            }),
            ContentBlock::ToolUse { id, name, input } => {
                Some(ContentPart::ToolUse { id, name, input })
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(ContentPart::ToolResult {
                tool_use_id,
                content: tool_result_text(content.as_ref()),
                is_error: is_error.unwrap_or(false),
            }),
            ContentBlock::Thinking { .. } => None,
        })
        .collect();
    Message { role, content }
}

fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        Some(ToolResultContent::Text(t)) => t.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

pub fn encode_request(req: &CanonicalRequest, model: &str) -> Result<Value> {
    // Consecutive same-role messages are merged, the API wants strict alternation
    let mut turns: Vec<(WireRole, Vec<ContentBlock>)> = Vec::new();
    for msg in &req.messages {
        let role = match msg.role {
            Role::System => continue,
            Role::Assistant => WireRole::Assistant,
            Role::User | Role::Tool => WireRole::User,
        };
        let blocks: Vec<ContentBlock> = msg.content.iter().filter_map(encode_part).collect();
        if blocks.is_empty() {
            continue;
        }
        match turns.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }

    if turns.is_empty() {
        return Err(RouterError::invalid_request(
            "Request has no user or assistant content",
        ));
    }

    let messages = turns
        .into_iter()
        .map(|(role, blocks)| {
            let content = match <[ContentBlock; 1]>::try_from(blocks) {
                Ok([ContentBlock::Text { text }]) => MessageContent::Text(text),
                Ok([other]) => MessageContent::Blocks(vec![other]),
                Err(blocks) => MessageContent::Blocks(blocks),
            };
            WireMessage { role, content }
        })
        .collect();

    let tools = if req.tools.is_empty() {
        None
    } else {
        Some(
            req.tools
                .iter()
                .map(|t| Tool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect(),
        )
    };

    let body = MessagesRequest {
        model: model.to_string(),
        max_tokens: req.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: req.system_text().map(SystemContent::Text),
        stream: Some(req.stream),
        temperature: req.sampling.temperature,
        top_p: req.sampling.top_p,
        top_k: req.sampling.top_k,
        tools,
        tool_choice: req.tool_choice.as_ref().map(|c| match c {
            ToolChoice::Auto => WireToolChoice::Auto,
            ToolChoice::Any => WireToolChoice::Any,
            ToolChoice::None => WireToolChoice::None,
            ToolChoice::Tool { name } => WireToolChoice::Tool { name: name.clone() },
        }),
        metadata: req.user_id().map(|user_id| json!({ "user_id": user_id })),
        stop_sequences: if req.sampling.stop.is_empty() {
            None
        } else {
            Some(req.sampling.stop.clone())
        },
    };

    Ok(serde_json::to_value(body)?)
}

fn encode_part(part: &ContentPart) -> Option<ContentBlock> {
    match part {
        ContentPart::Text { text } if text.is_empty() => None,
        ContentPart::Text { text } => Some(ContentBlock::Text { text: text.clone() }),
        ContentPart::Image { source } => Some(ContentBlock::Image {
            source: match source {
                ImageSource::Base64 { media_type, data } => BlockImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                ImageSource::Url { url } => BlockImageSource::Url { url: url.clone() },
            },
        }),
        ContentPart::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: match input {
                // Unparseable arguments from a flat-delta caller
                Value::String(raw) => json!({ "raw": raw }),
                other => other.clone(),
            },
        }),
        ContentPart::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(ContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: Some(ToolResultContent::Text(content.clone())),
            is_error: is_error.then_some(true),
        }),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn parse_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

pub fn stop_reason_str(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Stop | FinishReason::ContentFilter => "end_turn".to_string(),
        FinishReason::Length => "max_tokens".to_string(),
        FinishReason::ToolCalls => "tool_use".to_string(),
        FinishReason::Other(other) => other.clone(),
    }
}

fn usage_from(usage: &WireUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    }
}

fn wire_usage(usage: Usage) -> WireUsage {
    WireUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: None,
    }
}

pub fn decode_response(body: &[u8]) -> Result<CanonicalResponse> {
    let resp: MessagesResponse = serde_json::from_slice(body)
        .map_err(|e| RouterError::decode(format!("Malformed messages response: {e}")))?;

    let content = resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseContentBlock::Text { text } => Some(ContentPart::Text { text }),
            ResponseContentBlock::ToolUse { id, name, input } => {
                Some(ContentPart::ToolUse { id, name, input })
            }
            ResponseContentBlock::Thinking { .. } | ResponseContentBlock::Unknown => None,
        })
        .collect();

    Ok(CanonicalResponse {
        id: resp.id,
        model: resp.model,
        role: Role::Assistant,
        content,
        finish_reason: resp.stop_reason.as_deref().map(parse_stop_reason),
        usage: usage_from(&resp.usage),
    })
}

pub fn encode_response(resp: &CanonicalResponse) -> Result<Value> {
    let mut content: Vec<ResponseContentBlock> = resp
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if !text.is_empty() => {
                Some(ResponseContentBlock::Text { text: text.clone() })
            }
            ContentPart::ToolUse { id, name, input } => Some(ResponseContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect();

    // Clients expect at least one content block
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let id = if resp.id.starts_with("msg_") {
        resp.id.clone()
    } else {
        format!("msg_{}", resp.id.trim_start_matches("chatcmpl-"))
    };

    let body = MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model.clone(),
        stop_reason: Some(
            resp.finish_reason
                .as_ref()
                .map_or_else(|| "end_turn".to_string(), stop_reason_str),
        ),
        stop_sequence: None,
        usage: wire_usage(resp.usage),
    };

    Ok(serde_json::to_value(body)?)
}

fn wire_error_type(err: &RouterError) -> &'static str {
    match err.error_type() {
        "transport_error" | "decode_error" | "internal_error" | "cancelled" => "api_error",
        other => other,
    }
}

pub fn encode_error(err: &RouterError) -> Value {
    serde_json::to_value(ErrorResponse::new(
        wire_error_type(err),
        err.caller_message(),
    ))
    .unwrap_or_default()
}

pub fn upstream_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .map(|e| e.error.message)
}

fn stream_error_status(error_type: &str) -> u16 {
    match error_type {
        "invalid_request_error" => 400,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 502,
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Folds lifecycle events into flat canonical chunks.
///
/// Block bookkeeping events (`content_block_stop`, `ping`) carry nothing a flat
/// consumer needs and are dropped. Tool blocks are renumbered densely so the first
/// tool call is index 0 regardless of how many text blocks came before it.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    tool_blocks: HashMap<usize, usize>,
    tool_count: usize,
}

impl ChunkDecoder {
    pub fn decode(&mut self, frame: &Frame, seq: &mut SequenceCounter) -> Result<DecodedFrame> {
        let event: StreamEvent = serde_json::from_str(&frame.data)
            .map_err(|e| RouterError::decode(format!("Malformed stream event: {e}")))?;

        let mut chunks = Vec::new();
        match event {
            StreamEvent::MessageStart { message } => {
                let usage = usage_from(&message.usage);
                chunks.push(CanonicalChunk {
                    id: Some(message.id).filter(|s| !s.is_empty()),
                    model: Some(message.model).filter(|s| !s.is_empty()),
                    role: Some(Role::Assistant),
                    usage: (!usage.is_unset()).then_some(usage),
                    ..CanonicalChunk::empty(0)
                });
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ResponseContentBlock::Text { text } if !text.is_empty() => {
                    chunks.push(CanonicalChunk::text(0, text));
                }
                ResponseContentBlock::ToolUse { id, name, input } => {
                    let ordinal = self.tool_count;
                    self.tool_count += 1;
                    self.tool_blocks.insert(index, ordinal);
                    let arguments = match input {
                        Value::Null => String::new(),
                        Value::Object(ref map) if map.is_empty() => String::new(),
                        other => other.to_string(),
                    };
                    chunks.push(CanonicalChunk {
                        delta: Some(ChunkDelta::ToolCall {
                            index: ordinal,
                            id: Some(id),
                            name: Some(name),
                            arguments,
                        }),
                        ..CanonicalChunk::empty(0)
                    });
                }
                _ => {}
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } if !text.is_empty() => {
                    chunks.push(CanonicalChunk::text(0, text));
                }
                Delta::InputJsonDelta { partial_json } if !partial_json.is_empty() => {
                    if let Some(&ordinal) = self.tool_blocks.get(&index) {
                        chunks.push(CanonicalChunk {
                            delta: Some(ChunkDelta::ToolCall {
                                index: ordinal,
                                id: None,
                                name: None,
                                arguments: partial_json,
                            }),
                            ..CanonicalChunk::empty(0)
                        });
                    }
                }
                _ => {}
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let usage = usage_from(&usage);
                chunks.push(CanonicalChunk {
                    finish_reason: delta.stop_reason.as_deref().map(parse_stop_reason),
                    usage: (!usage.is_unset()).then_some(usage),
                    ..CanonicalChunk::empty(0)
                });
            }
            StreamEvent::MessageStop => return Ok(DecodedFrame::done()),
            StreamEvent::Error { error } => {
                return Err(RouterError::upstream(
                    stream_error_status(&error.error_type),
                    error.message,
                    frame.data.clone(),
                ));
            }
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping | StreamEvent::Unknown => {}
        }

        chunks.retain(|c| !c.is_blank());
        for c in &mut chunks {
            c.sequence = seq.next();
        }
        Ok(DecodedFrame::chunks(chunks))
    }
}

/// Synthesizes the typed event lifecycle from flat canonical chunks.
///
/// `message_start` goes out before the first content, a text block is opened on
/// the first text delta, and each new tool call opens its own block. A finish reason
/// closes open blocks but `message_delta`/`message_stop` wait for [`finish`], since
/// flat-delta upstreams report usage in a chunk after the finish reason.
///
/// [`finish`]: ChunkEncoder::finish
#[derive(Debug)]
pub struct ChunkEncoder {
    model: String,
    msg_id: String,
    started: bool,
    finished: bool,
    next_block: usize,
    text_block: Option<usize>,
    /// Tool ordinal to block index
    tool_blocks: HashMap<usize, usize>,
    open_tool_blocks: Vec<usize>,
    stop_reason: Option<String>,
    usage: Usage,
}

impl ChunkEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            msg_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            finished: false,
            next_block: 0,
            text_block: None,
            tool_blocks: HashMap::new(),
            open_tool_blocks: Vec::new(),
            stop_reason: None,
            usage: Usage::default(),
        }
    }

    pub fn encode(&mut self, chunk: &CanonicalChunk) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        if let Some(usage) = chunk.usage {
            self.usage.merge(usage);
        }

        let mut events = Vec::new();
        if !self.started {
            events.push(self.message_start());
            self.started = true;
        }

        match &chunk.delta {
            Some(ChunkDelta::Text { text }) if !text.is_empty() => {
                let index = match self.text_block {
                    Some(index) => index,
                    None => {
                        self.close_tool_blocks(&mut events);
                        let index = self.open_block(
                            ResponseContentBlock::Text {
                                text: String::new(),
                            },
                            &mut events,
                        );
                        self.text_block = Some(index);
                        index
                    }
                };
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::TextDelta { text: text.clone() },
                });
            }
            Some(ChunkDelta::ToolCall {
                index: ordinal,
                id,
                name,
                arguments,
            }) => {
                let known = self.tool_blocks.get(ordinal).copied();
                let block = match (id, known) {
                    (None, Some(block)) => block,
                    _ => {
                        self.close_text_block(&mut events);
                        let block = self.open_block(
                            ResponseContentBlock::ToolUse {
                                id: id.clone().unwrap_or_else(|| {
                                    format!("toolu_{}", uuid::Uuid::new_v4().simple())
                                }),
                                name: name.clone().unwrap_or_default(),
                                input: json!({}),
                            },
                            &mut events,
                        );
                        self.tool_blocks.insert(*ordinal, block);
                        self.open_tool_blocks.push(block);
                        block
                    }
                };
                if !arguments.is_empty() {
                    events.push(StreamEvent::ContentBlockDelta {
                        index: block,
                        delta: Delta::InputJsonDelta {
                            partial_json: arguments.clone(),
                        },
                    });
                }
            }
            _ => {}
        }

        if let Some(ref reason) = chunk.finish_reason {
            self.close_text_block(&mut events);
            self.close_tool_blocks(&mut events);
            self.stop_reason = Some(stop_reason_str(reason));
        }

        events.iter().map(event_frame).collect()
    }

    /// Closes whatever is open and emits `message_delta` + `message_stop`.
    /// Also used when the upstream ended without its own terminal marker.
    pub fn finish(&mut self) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if !self.started {
            events.push(self.message_start());
            self.started = true;
        }
        self.close_text_block(&mut events);
        self.close_tool_blocks(&mut events);

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(
                    self.stop_reason
                        .take()
                        .unwrap_or_else(|| "end_turn".to_string()),
                ),
                stop_sequence: None,
            },
            usage: wire_usage(Usage {
                input_tokens: None,
                output_tokens: self.usage.output_tokens,
            }),
        });
        events.push(StreamEvent::MessageStop);

        events.iter().map(event_frame).collect()
    }

    pub fn error(&mut self, err: &RouterError) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![Frame::named("error", encode_error(err).to_string())]
    }

    fn message_start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: wire_usage(Usage {
                    input_tokens: self.usage.input_tokens,
                    output_tokens: Some(0),
                }),
            },
        }
    }

    fn open_block(&mut self, block: ResponseContentBlock, events: &mut Vec<StreamEvent>) -> usize {
        let index = self.next_block;
        self.next_block += 1;
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: block,
        });
        index
    }

    fn close_text_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.text_block.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn close_tool_blocks(&mut self, events: &mut Vec<StreamEvent>) {
        for index in self.open_tool_blocks.drain(..) {
            events.push(StreamEvent::ContentBlockStop { index });
        }
        self.tool_blocks.clear();
    }
}

fn event_frame(event: &StreamEvent) -> Frame {
    Frame::named(
        event.event_name(),
        serde_json::to_string(event).unwrap_or_default(),
    )
}
