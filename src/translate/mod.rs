//! Translation between the supported wire protocols.
//!
//! Every protocol is decoded into the canonical representation in [`canonical`] and
//! encoded back out of it, so any caller protocol can be served by any backend.
//! All functions here are pure (no I/O).

pub mod anthropic;
pub mod anthropic_types;
pub mod canonical;
/// Legacy text completions, carried over the flat-delta chat path.
pub mod completions;
pub mod framing;
pub mod ollama;
pub mod ollama_types;
pub mod openai;
pub mod openai_types;
pub mod streaming;

use serde_json::Value;

use crate::error::{Result, RouterError};
use crate::providers::Protocol;
use canonical::{CanonicalRequest, CanonicalResponse};
use streaming::{StreamDecoder, StreamEncoder};

impl Protocol {
    /// Decode a caller's request body. Rejects requests without any messages.
    pub fn decode_request(self, body: Value) -> Result<CanonicalRequest> {
        let req = match self {
            Protocol::OpenAi => openai::decode_request(body)?,
            Protocol::Anthropic => anthropic::decode_request(body)?,
            Protocol::Ollama => ollama::decode_request(body)?,
        };
        if req.messages.is_empty() {
            return Err(RouterError::invalid_request(
                "Request must contain at least one message",
            ));
        }
        Ok(req)
    }

    /// Encode for a backend; `model` is the name the backend knows the model by.
    pub fn encode_request(self, req: &CanonicalRequest, model: &str) -> Result<Value> {
        match self {
            Protocol::OpenAi => openai::encode_request(req, model),
            Protocol::Anthropic => anthropic::encode_request(req, model),
            Protocol::Ollama => ollama::encode_request(req, model),
        }
    }

    pub fn decode_response(self, body: &[u8]) -> Result<CanonicalResponse> {
        match self {
            Protocol::OpenAi => openai::decode_response(body),
            Protocol::Anthropic => anthropic::decode_response(body),
            Protocol::Ollama => ollama::decode_response(body),
        }
    }

    pub fn encode_response(self, resp: &CanonicalResponse) -> Result<Value> {
        match self {
            Protocol::OpenAi => openai::encode_response(resp),
            Protocol::Anthropic => anthropic::encode_response(resp),
            Protocol::Ollama => ollama::encode_response(resp),
        }
    }

    /// Error body in this protocol's shape.
    pub fn encode_error(self, err: &RouterError) -> Value {
        match self {
            Protocol::OpenAi => openai::encode_error(err),
            Protocol::Anthropic => anthropic::encode_error(err),
            Protocol::Ollama => ollama::encode_error(err),
        }
    }

    /// Pull the human-readable message out of a backend's error body.
    pub fn upstream_error_message(self, body: &str) -> Option<String> {
        match self {
            Protocol::OpenAi => openai::upstream_error_message(body),
            Protocol::Anthropic => anthropic::upstream_error_message(body),
            Protocol::Ollama => ollama::upstream_error_message(body),
        }
    }

    pub fn stream_decoder(self) -> StreamDecoder {
        StreamDecoder::new(self)
    }

    pub fn stream_encoder(self, model: &str) -> StreamEncoder {
        StreamEncoder::new(self, model)
    }
}
