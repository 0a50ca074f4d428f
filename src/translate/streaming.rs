//! Protocol-independent streaming state machines.
//!
//! [`StreamDecoder`] turns raw upstream reads into canonical chunks; [`StreamEncoder`]
//! turns canonical chunks into caller frames. Both dispatch to the per-protocol
//! adapters, which own the lifecycle bookkeeping of their wire format.

use super::canonical::{CanonicalChunk, SequenceCounter};
use super::framing::{Frame, FrameDecoder};
use super::{anthropic, ollama, openai};
use crate::error::{Result, RouterError};
use crate::providers::Protocol;

/// What one upstream frame contributed.
#[derive(Debug, Default)]
pub struct DecodedFrame {
    pub chunks: Vec<CanonicalChunk>,
    /// The upstream sent its terminal marker
    pub done: bool,
}

impl DecodedFrame {
    pub fn chunks(chunks: Vec<CanonicalChunk>) -> Self {
        Self {
            chunks,
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            chunks: Vec::new(),
            done: true,
        }
    }
}

#[derive(Debug)]
enum ChunkDecoder {
    OpenAi(openai::ChunkDecoder),
    Anthropic(anthropic::ChunkDecoder),
    Ollama(ollama::ChunkDecoder),
}

impl ChunkDecoder {
    fn decode(&mut self, frame: &Frame, seq: &mut SequenceCounter) -> Result<DecodedFrame> {
        match self {
            ChunkDecoder::OpenAi(d) => d.decode(frame, seq),
            ChunkDecoder::Anthropic(d) => d.decode(frame, seq),
            ChunkDecoder::Ollama(d) => d.decode(frame, seq),
        }
    }
}

/// Incremental decoder for one upstream stream.
///
/// Frames after the terminal marker are ignored. Sequence numbers are assigned
/// here and strictly increase for the lifetime of the stream.
#[derive(Debug)]
pub struct StreamDecoder {
    frames: FrameDecoder,
    chunks: ChunkDecoder,
    sequence: SequenceCounter,
    complete: bool,
}

impl StreamDecoder {
    pub fn new(protocol: Protocol) -> Self {
        let chunks = match protocol {
            Protocol::OpenAi => ChunkDecoder::OpenAi(openai::ChunkDecoder::default()),
            Protocol::Anthropic => ChunkDecoder::Anthropic(anthropic::ChunkDecoder::default()),
            Protocol::Ollama => ChunkDecoder::Ollama(ollama::ChunkDecoder::default()),
        };
        Self {
            frames: FrameDecoder::new(protocol.framing()),
            chunks,
            sequence: SequenceCounter::default(),
            complete: false,
        }
    }

    /// Feed one network read.
    pub fn feed(&mut self, bytes: &[u8]) -> Decoded {
        let (frames, error) = self.frames.feed(bytes);
        self.decode_frames(frames, error)
    }

    /// Flush whatever the upstream left unterminated when its body ended.
    pub fn finish(&mut self) -> Decoded {
        let (frames, error) = self.frames.finish();
        self.decode_frames(frames, error)
    }

    /// True once the upstream's own terminal marker was seen.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn decode_frames(&mut self, frames: Vec<Frame>, framing_error: Option<RouterError>) -> Decoded {
        let mut out = Decoded::default();
        for frame in frames {
            if self.complete {
                return out;
            }
            match self.chunks.decode(&frame, &mut self.sequence) {
                Ok(decoded) => {
                    out.chunks.extend(decoded.chunks);
                    self.complete = decoded.done;
                }
                Err(err) => {
                    out.error = Some(err);
                    return out;
                }
            }
        }
        if !self.complete {
            out.error = framing_error;
        }
        out
    }
}

/// Chunks decoded from one read. Events before a failing one are kept, in
/// arrival order, next to the error that ended decoding.
#[derive(Debug, Default)]
pub struct Decoded {
    pub chunks: Vec<CanonicalChunk>,
    pub error: Option<RouterError>,
}

impl Decoded {
    pub fn failed(err: RouterError) -> Self {
        Self {
            chunks: Vec::new(),
            error: Some(err),
        }
    }
}

#[derive(Debug)]
enum ChunkEncoder {
    OpenAi(openai::ChunkEncoder),
    Anthropic(anthropic::ChunkEncoder),
    Ollama(ollama::ChunkEncoder),
}

/// Encoder for one caller-facing stream.
///
/// Every stream it produces ends in exactly one of [`finish`](Self::finish) or
/// [`error`](Self::error); whichever comes first wins and the other yields nothing.
#[derive(Debug)]
pub struct StreamEncoder {
    inner: ChunkEncoder,
}

impl StreamEncoder {
    /// `model` is the name the caller asked for, echoed in every frame.
    pub fn new(protocol: Protocol, model: &str) -> Self {
        let inner = match protocol {
            Protocol::OpenAi => ChunkEncoder::OpenAi(openai::ChunkEncoder::new(model)),
            Protocol::Anthropic => ChunkEncoder::Anthropic(anthropic::ChunkEncoder::new(model)),
            Protocol::Ollama => ChunkEncoder::Ollama(ollama::ChunkEncoder::new(model)),
        };
        Self { inner }
    }

    pub fn encode(&mut self, chunk: &CanonicalChunk) -> Vec<Frame> {
        match &mut self.inner {
            ChunkEncoder::OpenAi(e) => e.encode(chunk),
            ChunkEncoder::Anthropic(e) => e.encode(chunk),
            ChunkEncoder::Ollama(e) => e.encode(chunk),
        }
    }

    pub fn finish(&mut self) -> Vec<Frame> {
        match &mut self.inner {
            ChunkEncoder::OpenAi(e) => e.finish(),
            ChunkEncoder::Anthropic(e) => e.finish(),
            ChunkEncoder::Ollama(e) => e.finish(),
        }
    }

    pub fn error(&mut self, err: &RouterError) -> Vec<Frame> {
        match &mut self.inner {
            ChunkEncoder::OpenAi(e) => e.error(err),
            ChunkEncoder::Anthropic(e) => e.error(err),
            ChunkEncoder::Ollama(e) => e.error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::canonical::{ChunkDelta, FinishReason};

    #[test]
    fn test_decoder_ignores_frames_after_done() {
        let mut decoder = StreamDecoder::new(Protocol::OpenAi);
        let chunks = decoder
            .feed(b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"},\"finish_reason\":null}]}\n\ndata: [DONE]\n\ndata: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"late\"},\"finish_reason\":null}]}\n\n")
            .chunks;
        assert_eq!(chunks.len(), 1);
        assert!(decoder.is_complete());
    }

    #[test]
    fn test_decoder_handles_split_reads() {
        let mut decoder = StreamDecoder::new(Protocol::Ollama);
        let line = b"{\"model\":\"m\",\"message\":{\"role\":\"assistant\",\"content\":\"hey\"},\"done\":false}\n";
        let (a, b) = line.split_at(20);
        assert!(decoder.feed(a).chunks.is_empty());
        let decoded = decoder.feed(b);
        assert!(decoded.error.is_none());
        let chunks = decoded.chunks;
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].delta,
            Some(ChunkDelta::Text {
                text: "hey".to_string()
            })
        );
        assert!(!decoder.is_complete());
    }

    #[test]
    fn test_typed_to_flat_end_to_end() {
        let mut decoder = StreamDecoder::new(Protocol::Anthropic);
        let mut encoder = StreamEncoder::new(Protocol::OpenAi, "smart");
        let upstream = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude\",\"usage\":{\"input_tokens\":3,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );

        let mut frames = Vec::new();
        for chunk in decoder.feed(upstream.as_bytes()).chunks {
            frames.extend(encoder.encode(&chunk));
        }
        assert!(decoder.is_complete());
        frames.extend(encoder.finish());

        let last = frames.last().unwrap();
        assert_eq!(last.data, "[DONE]");
        let contents: Vec<serde_json::Value> = frames[..frames.len() - 1]
            .iter()
            .map(|f| serde_json::from_str(&f.data).unwrap())
            .collect();
        assert!(contents
            .iter()
            .any(|c| c["choices"][0]["delta"]["content"] == "Hi"));
        assert!(contents
            .iter()
            .any(|c| c["choices"][0]["finish_reason"] == "stop"));
        let usage = contents.iter().find(|c| c.get("usage").is_some()).unwrap();
        assert_eq!(usage["usage"]["prompt_tokens"], 3);
        assert_eq!(usage["usage"]["completion_tokens"], 4);
    }

    #[test]
    fn test_malformed_event_keeps_earlier_events_in_read() {
        let mut decoder = StreamDecoder::new(Protocol::OpenAi);
        let decoded = decoder.feed(
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"},\"finish_reason\":null}]}\n\ndata: {garbage\n\n",
        );
        assert_eq!(decoded.chunks.len(), 1);
        assert_eq!(
            decoded.chunks[0].delta,
            Some(ChunkDelta::Text {
                text: "Hello".to_string()
            })
        );
        assert!(matches!(decoded.error, Some(RouterError::Decode { .. })));
    }

    #[test]
    fn test_upstream_error_event_after_deltas() {
        let mut decoder = StreamDecoder::new(Protocol::Anthropic);
        let upstream = concat!(
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: error\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        let decoded = decoder.feed(upstream.as_bytes());
        let texts: Vec<_> = decoded
            .chunks
            .iter()
            .filter_map(|c| match &c.delta {
                Some(ChunkDelta::Text { text }) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["Hel", "lo"]);
        let err = decoded.error.unwrap();
        assert_eq!(err.caller_message(), "Overloaded");
    }

    #[test]
    fn test_huge_tool_index_maps_to_one_block() {
        for index in ["4294967296", "18446744073709551615"] {
            let mut decoder = StreamDecoder::new(Protocol::OpenAi);
            let mut encoder = StreamEncoder::new(Protocol::Anthropic, "fast");
            let upstream = format!(
                concat!(
                    "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"tool_calls\":[{{\"index\":{i},\"id\":\"call_1\",\"function\":{{\"name\":\"lookup\",\"arguments\":\"{{\\\"q\\\"\"}}}}]}},\"finish_reason\":null}}]}}\n\n",
                    "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"tool_calls\":[{{\"index\":{i},\"function\":{{\"arguments\":\":1}}\"}}}}]}},\"finish_reason\":\"tool_calls\"}}]}}\n\n",
                ),
                i = index
            );
            let decoded = decoder.feed(upstream.as_bytes());
            assert!(decoded.error.is_none(), "{index}");

            let mut frames = Vec::new();
            for chunk in &decoded.chunks {
                frames.extend(encoder.encode(chunk));
            }
            frames.extend(encoder.finish());

            let events: Vec<serde_json::Value> = frames
                .iter()
                .map(|f| serde_json::from_str(&f.data).unwrap())
                .collect();
            let starts = events
                .iter()
                .filter(|e| e["type"] == "content_block_start")
                .count();
            assert_eq!(starts, 1, "{index}");
            let partial: String = events
                .iter()
                .filter(|e| e["delta"]["type"] == "input_json_delta")
                .map(|e| e["delta"]["partial_json"].as_str().unwrap().to_string())
                .collect();
            assert_eq!(partial, "{\"q\":1}", "{index}");
        }
    }

    #[test]
    fn test_encoder_terminal_is_exclusive() {
        let mut encoder = StreamEncoder::new(Protocol::Ollama, "m");
        let chunk = CanonicalChunk {
            finish_reason: Some(FinishReason::Stop),
            ..CanonicalChunk::empty(1)
        };
        encoder.encode(&chunk);
        assert_eq!(encoder.finish().len(), 1);
        assert!(encoder.error(&RouterError::decode("late")).is_empty());
    }
}
