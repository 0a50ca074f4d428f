//! Adapter for the native Ollama chat protocol.
//!
//! Messages carry plain string content with images as a side list of base64
//! payloads. Tool calls have no ids and their arguments are JSON objects rather
//! than strings. Streams are newline-delimited JSON where every line repeats the
//! full envelope and the last one has `done: true`.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::canonical::{
    CanonicalChunk, CanonicalRequest, CanonicalResponse, ChunkDelta, ContentPart, FinishReason,
    ImageSource, Message, Role, SamplingParams, SequenceCounter, ToolDefinition, Usage,
};
use super::framing::Frame;
use super::ollama_types::{
    ChatMessage, ChatRequest, ChatResponse, ErrorResponse, Options, Tool, ToolCall,
    ToolCallFunction, ToolFunction,
};
use super::streaming::DecodedFrame;
use crate::error::{Result, RouterError};

fn call_id(n: usize) -> String {
    format!("call_{n}")
}

/// Raw base64 images carry no media type, sniff it from the magic bytes.
fn sniff_media_type(data: &str) -> &'static str {
    if data.starts_with("/9j/") {
        "image/jpeg"
    } else if data.starts_with("R0lGOD") {
        "image/gif"
    } else if data.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/png"
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn decode_request(body: Value) -> Result<CanonicalRequest> {
    let req: ChatRequest = serde_json::from_value(body)
        .map_err(|e| RouterError::invalid_request(format!("Malformed chat request: {e}")))?;

    let mut messages = Vec::with_capacity(req.messages.len());
    // Tool results answer the preceding assistant's calls in order
    let mut pending_results = 0usize;
    let mut calls_seen = 0usize;

    for msg in req.messages {
        let role = Role::parse(&msg.role).ok_or_else(|| {
            RouterError::invalid_request(format!("Unknown message role '{}'", msg.role))
        })?;

        if role == Role::Tool {
            let id = call_id(calls_seen.saturating_sub(pending_results));
            pending_results = pending_results.saturating_sub(1);
            messages.push(Message {
                role,
                content: vec![ContentPart::ToolResult {
                    tool_use_id: id,
                    content: msg.content,
                    is_error: false,
                }],
            });
            continue;
        }

        let mut content = Vec::new();
        if !msg.content.is_empty() {
            content.push(ContentPart::Text { text: msg.content });
        }
        for data in msg.images.unwrap_or_default() {
            content.push(ContentPart::Image {
                source: ImageSource::Base64 {
                    media_type: sniff_media_type(&data).to_string(),
                    data,
                },
            });
        }
        let calls = msg.tool_calls.unwrap_or_default();
        pending_results = calls.len();
        for call in calls {
            content.push(ContentPart::ToolUse {
                id: call_id(calls_seen),
                name: call.function.name,
                input: call.function.arguments,
            });
            calls_seen += 1;
        }
        messages.push(Message { role, content });
    }

    let options = req.options.unwrap_or_default();
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

    Ok(CanonicalRequest {
        model: req.model,
        messages,
        sampling: SamplingParams {
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            stop: options.stop.unwrap_or_default(),
        },
        // Ollama streams unless told otherwise
        stream: req.stream.unwrap_or(true),
        max_output_tokens: options.num_predict,
        tools,
        tool_choice: None,
        metadata: None,
    })
}

pub fn encode_request(req: &CanonicalRequest, model: &str) -> Result<Value> {
    let mut messages = Vec::new();
    for msg in &req.messages {
        let mut text = Vec::new();
        let mut images = Vec::new();
        let mut tool_calls = Vec::new();

        for part in &msg.content {
            match part {
                ContentPart::Text { text: t } => text.push(t.as_str()),
                ContentPart::Image {
                    source: ImageSource::Base64 { data, .. },
                } => images.push(data.clone()),
                // Remote images can't be expressed natively
                ContentPart::Image { .. } => {}
                ContentPart::ToolUse { name, input, .. } => tool_calls.push(ToolCall {
                    function: ToolCallFunction {
                        name: name.clone(),
                        arguments: match input {
                            Value::String(raw) => {
                                serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
                            }
                            other => other.clone(),
                        },
                    },
                }),
                ContentPart::ToolResult { content, .. } => messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: content.clone(),
                    ..ChatMessage::default()
                }),
            }
        }

        if text.is_empty() && images.is_empty() && tool_calls.is_empty() {
            continue;
        }
        messages.push(ChatMessage {
            role: match msg.role {
                Role::Tool => "user".to_string(),
                other => other.as_str().to_string(),
            },
            content: text.concat(),
            images: (!images.is_empty()).then_some(images),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            thinking: None,
        });
    }

    let options = Options {
        temperature: req.sampling.temperature,
        top_p: req.sampling.top_p,
        top_k: req.sampling.top_k,
        num_predict: req.max_output_tokens,
        stop: if req.sampling.stop.is_empty() {
            None
        } else {
            Some(req.sampling.stop.clone())
        },
    };

    let tools = if req.tools.is_empty() {
        None
    } else {
        Some(
            req.tools
                .iter()
                .map(|t| Tool {
                    tool_type: "function".to_string(),
                    function: ToolFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        )
    };

    let body = ChatRequest {
        model: model.to_string(),
        messages,
        stream: Some(req.stream),
        options: (!options.is_empty()).then_some(options),
        tools,
    };
    Ok(serde_json::to_value(body)?)
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn parse_done_reason(reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    if has_tool_calls {
        return FinishReason::ToolCalls;
    }
    match reason {
        None | Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some(other) => FinishReason::Other(other.to_string()),
    }
}

pub fn done_reason_str(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Length => "length".to_string(),
        FinishReason::Other(other) => other.clone(),
        FinishReason::Stop | FinishReason::ToolCalls | FinishReason::ContentFilter => {
            "stop".to_string()
        }
    }
}

fn usage_from(resp: &ChatResponse) -> Usage {
    Usage {
        input_tokens: resp.prompt_eval_count,
        output_tokens: resp.eval_count,
    }
}

pub fn decode_response(body: &[u8]) -> Result<CanonicalResponse> {
    let resp: ChatResponse = serde_json::from_slice(body)
        .map_err(|e| RouterError::decode(format!("Malformed chat response: {e}")))?;

    let usage = usage_from(&resp);
    let message = resp.message.unwrap_or_default();
    let text = if message.content.is_empty() {
        resp.response.unwrap_or_default()
    } else {
        message.content
    };

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentPart::Text { text });
    }
    let calls = message.tool_calls.unwrap_or_default();
    let has_tool_calls = !calls.is_empty();
    for (n, call) in calls.into_iter().enumerate() {
        content.push(ContentPart::ToolUse {
            id: call_id(n),
            name: call.function.name,
            input: call.function.arguments,
        });
    }

    Ok(CanonicalResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        model: resp.model,
        role: Role::Assistant,
        content,
        finish_reason: Some(parse_done_reason(
            resp.done_reason.as_deref(),
            has_tool_calls,
        )),
        usage,
    })
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

pub fn encode_response(resp: &CanonicalResponse) -> Result<Value> {
    let tool_calls: Vec<ToolCall> = resp
        .content
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolUse { name, input, .. } => Some(ToolCall {
                function: ToolCallFunction {
                    name: name.clone(),
                    arguments: input.clone(),
                },
            }),
            _ => None,
        })
        .collect();

    let body = ChatResponse {
        model: resp.model.clone(),
        created_at: timestamp(),
        message: Some(ChatMessage {
            role: "assistant".to_string(),
            content: resp.text(),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            ..ChatMessage::default()
        }),
        response: None,
        done: true,
        done_reason: Some(
            resp.finish_reason
                .as_ref()
                .map_or_else(|| "stop".to_string(), done_reason_str),
        ),
        prompt_eval_count: resp.usage.input_tokens,
        eval_count: resp.usage.output_tokens,
    };
    Ok(serde_json::to_value(body)?)
}

pub fn encode_error(err: &RouterError) -> Value {
    json!({ "error": err.caller_message() })
}

pub fn upstream_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .map(|e| e.error)
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ChunkDecoder {
    started: bool,
    tool_calls: usize,
}

impl ChunkDecoder {
    pub fn decode(&mut self, frame: &Frame, seq: &mut SequenceCounter) -> Result<DecodedFrame> {
        if let Some(message) = upstream_error_message(&frame.data) {
            return Err(RouterError::upstream(502, message, frame.data.clone()));
        }
        let line: ChatResponse = serde_json::from_str(&frame.data)
            .map_err(|e| RouterError::decode(format!("Malformed stream line: {e}")))?;

        let first = !self.started;
        self.started = true;
        let usage = usage_from(&line);
        let message = line.message.unwrap_or_default();

        let mut chunks = Vec::new();
        let text = if message.content.is_empty() {
            line.response.unwrap_or_default()
        } else {
            message.content
        };
        if !text.is_empty() {
            chunks.push(CanonicalChunk::text(0, text));
        }
        for call in message.tool_calls.unwrap_or_default() {
            let index = self.tool_calls;
            self.tool_calls += 1;
            chunks.push(CanonicalChunk {
                delta: Some(ChunkDelta::ToolCall {
                    index,
                    id: Some(call_id(index)),
                    name: Some(call.function.name),
                    arguments: call.function.arguments.to_string(),
                }),
                ..CanonicalChunk::empty(0)
            });
        }

        if first {
            let mut head = chunks.first().cloned().unwrap_or_else(|| CanonicalChunk::empty(0));
            head.model = Some(line.model).filter(|s| !s.is_empty());
            head.role = Some(Role::Assistant);
            match chunks.first_mut() {
                Some(slot) => *slot = head,
                None => chunks.push(head),
            }
        }

        if line.done {
            chunks.push(CanonicalChunk {
                finish_reason: Some(parse_done_reason(
                    line.done_reason.as_deref(),
                    self.tool_calls > 0,
                )),
                usage: (!usage.is_unset()).then_some(usage),
                ..CanonicalChunk::empty(0)
            });
        }

        chunks.retain(|c| !c.is_blank());
        for c in &mut chunks {
            c.sequence = seq.next();
        }
        Ok(DecodedFrame {
            chunks,
            done: line.done,
        })
    }
}

#[derive(Debug, Default)]
struct PendingToolCall {
    name: String,
    arguments: String,
}

/// Renders canonical chunks as native NDJSON lines.
///
/// The native format has no partial tool calls, so tool call fragments are
/// assembled and sent whole when the message finishes. Text goes out per chunk.
#[derive(Debug)]
pub struct ChunkEncoder {
    model: String,
    tool_calls: BTreeMap<usize, PendingToolCall>,
    done_reason: Option<String>,
    usage: Usage,
    finished: bool,
}

impl ChunkEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            tool_calls: BTreeMap::new(),
            done_reason: None,
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
        if let Some(ref reason) = chunk.finish_reason {
            self.done_reason = Some(done_reason_str(reason));
        }

        match &chunk.delta {
            Some(ChunkDelta::Text { text }) if !text.is_empty() => {
                vec![self.line(ChatMessage {
                    role: "assistant".to_string(),
                    content: text.clone(),
                    ..ChatMessage::default()
                })]
            }
            Some(ChunkDelta::ToolCall {
                index,
                name,
                arguments,
                ..
            }) => {
                let pending = self.tool_calls.entry(*index).or_default();
                if let Some(name) = name {
                    pending.name.clone_from(name);
                }
                pending.arguments.push_str(arguments);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut frames = Vec::new();
        if !self.tool_calls.is_empty() {
            let calls = std::mem::take(&mut self.tool_calls)
                .into_values()
                .map(|p| ToolCall {
                    function: ToolCallFunction {
                        name: p.name,
                        arguments: if p.arguments.trim().is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&p.arguments)
                                .unwrap_or(Value::String(p.arguments))
                        },
                    },
                })
                .collect();
            frames.push(self.line(ChatMessage {
                role: "assistant".to_string(),
                tool_calls: Some(calls),
                ..ChatMessage::default()
            }));
        }

        let done = ChatResponse {
            model: self.model.clone(),
            created_at: timestamp(),
            message: Some(ChatMessage {
                role: "assistant".to_string(),
                ..ChatMessage::default()
            }),
            response: None,
            done: true,
            done_reason: Some(
                self.done_reason
                    .take()
                    .unwrap_or_else(|| "stop".to_string()),
            ),
            prompt_eval_count: self.usage.input_tokens,
            eval_count: self.usage.output_tokens,
        };
        frames.push(Frame::data(
            serde_json::to_string(&done).unwrap_or_default(),
        ));
        frames
    }

    pub fn error(&mut self, err: &RouterError) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![Frame::data(encode_error(err).to_string())]
    }

    fn line(&self, message: ChatMessage) -> Frame {
        let line = ChatResponse {
            model: self.model.clone(),
            created_at: timestamp(),
            message: Some(message),
            done: false,
            ..ChatResponse::default()
        };
        Frame::data(serde_json::to_string(&line).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request_defaults_to_streaming() {
        let body = json!({
            "model": "local",
            "messages": [
                {"role": "user", "content": "describe", "images": ["/9j/AAAA"]}
            ],
            "options": {"temperature": 0.2, "num_predict": 32}
        });
        let req = decode_request(body).unwrap();
        assert!(req.stream);
        assert_eq!(req.max_output_tokens, Some(32));
        assert_eq!(req.sampling.temperature, Some(0.2));
        assert!(matches!(
            &req.messages[0].content[1],
            ContentPart::Image { source: ImageSource::Base64 { media_type, .. } }
                if media_type == "image/jpeg"
        ));
    }

    #[test]
    fn test_tool_results_follow_call_order() {
        let body = json!({
            "model": "local",
            "stream": false,
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": "", "tool_calls": [
                    {"function": {"name": "a", "arguments": {}}},
                    {"function": {"name": "b", "arguments": {}}}
                ]},
                {"role": "tool", "content": "sunny"},
                {"role": "tool", "content": "windy"}
            ]
        });
        let req = decode_request(body).unwrap();
        let ids: Vec<&str> = req.messages[2..]
            .iter()
            .filter_map(|m| match &m.content[0] {
                ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["call_0", "call_1"]);
    }

    #[test]
    fn test_encode_request_moves_sampling_into_options() {
        let mut req = CanonicalRequest::new("local", vec![Message::text(Role::User, "hi")]);
        req.sampling.top_k = Some(40);
        req.max_output_tokens = Some(100);

        let body = encode_request(&req, "llama3").unwrap();
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["top_k"], 40);
        assert_eq!(body["options"]["num_predict"], 100);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_decode_response_counts() {
        let body = json!({
            "model": "llama3",
            "created_at": "2024-01-01T00:00:00Z",
            "message": {"role": "assistant", "content": "Hello"},
            "done": true,
            "done_reason": "length",
            "prompt_eval_count": 9,
            "eval_count": 3
        });
        let resp = decode_response(body.to_string().as_bytes()).unwrap();
        assert_eq!(resp.text(), "Hello");
        assert_eq!(resp.finish_reason, Some(FinishReason::Length));
        assert_eq!(resp.usage.input_tokens, Some(9));
        assert_eq!(resp.usage.output_tokens, Some(3));
    }

    #[test]
    fn test_chunk_decoder_done_line() {
        let mut decoder = ChunkDecoder::default();
        let mut seq = SequenceCounter::default();

        let first = decoder
            .decode(
                &Frame::data(r#"{"model":"llama3","message":{"role":"assistant","content":"Hi"},"done":false}"#),
                &mut seq,
            )
            .unwrap();
        assert!(!first.done);
        assert_eq!(first.chunks.len(), 1);
        assert_eq!(first.chunks[0].model.as_deref(), Some("llama3"));

        let last = decoder
            .decode(
                &Frame::data(r#"{"model":"llama3","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":4,"eval_count":1}"#),
                &mut seq,
            )
            .unwrap();
        assert!(last.done);
        assert_eq!(last.chunks.len(), 1);
        assert_eq!(last.chunks[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(last.chunks[0].usage.unwrap().output_tokens, Some(1));
    }

    #[test]
    fn test_chunk_encoder_assembles_tool_calls() {
        let mut encoder = ChunkEncoder::new("local");
        assert!(encoder
            .encode(&CanonicalChunk {
                delta: Some(ChunkDelta::ToolCall {
                    index: 0,
                    id: Some("call_a".to_string()),
                    name: Some("lookup".to_string()),
                    arguments: "{\"q\":".to_string(),
                }),
                ..CanonicalChunk::empty(1)
            })
            .is_empty());
        encoder.encode(&CanonicalChunk {
            delta: Some(ChunkDelta::ToolCall {
                index: 0,
                id: None,
                name: None,
                arguments: "\"x\"}".to_string(),
            }),
            ..CanonicalChunk::empty(2)
        });

        let frames = encoder.finish();
        assert_eq!(frames.len(), 2);
        let calls: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(
            calls["message"]["tool_calls"][0]["function"]["arguments"]["q"],
            "x"
        );
        let done: Value = serde_json::from_str(&frames[1].data).unwrap();
        assert_eq!(done["done"], true);
        assert_eq!(done["done_reason"], "stop");
    }

    #[test]
    fn test_error_line() {
        let mut encoder = ChunkEncoder::new("local");
        let frames = encoder.error(&RouterError::decode("bad"));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.contains("\"error\""));
    }
}
