//! Wire framing for streamed bodies: server-sent events and newline-delimited JSON.
//!
//! [`FrameDecoder`] is fed raw reads as they arrive. A read may end in the middle of
//! a line (or of a UTF-8 sequence); the tail is kept and completed by the next read.
//! A read may also carry several events, all of which are returned at once.

use crate::error::RouterError;
use crate::providers::Framing;
use bytes::Bytes;

/// One framed event, either decoded from upstream or about to be written to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn to_bytes(&self, framing: Framing) -> Bytes {
        match framing {
            Framing::Sse => {
                let mut out = String::with_capacity(self.data.len() + 32);
                if let Some(ref event) = self.event {
                    out.push_str("event: ");
                    out.push_str(event);
                    out.push('\n');
                }
                for line in self.data.split('\n') {
                    out.push_str("data: ");
                    out.push_str(line);
                    out.push('\n');
                }
                out.push('\n');
                Bytes::from(out)
            }
            Framing::Ndjson => Bytes::from(format!("{}\n", self.data)),
        }
    }
}

#[derive(Debug, Default)]
struct PendingEvent {
    event: Option<String>,
    data: Vec<String>,
}

impl PendingEvent {
    fn take(&mut self) -> Option<Frame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(Frame { event, data })
    }
}

/// Incremental decoder; one instance per upstream stream.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    buffer: Vec<u8>,
    pending: PendingEvent,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
            pending: PendingEvent::default(),
        }
    }

    /// Feed one read; returns every event completed by it. A line that is not
    /// valid UTF-8 stops decoding, and the events before it are still returned.
    pub fn feed(&mut self, bytes: &[u8]) -> (Vec<Frame>, Option<RouterError>) {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(line) => frames.extend(self.process_line(&line)),
                Err(e) => return (frames, Some(not_utf8(e))),
            }
        }
        (frames, None)
    }

    /// Flush at end of input: a final unterminated line still counts.
    pub fn finish(&mut self) -> (Vec<Frame>, Option<RouterError>) {
        let mut frames = Vec::new();
        let mut error = None;
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            match String::from_utf8(rest) {
                Ok(line) => frames.extend(self.process_line(line.trim_end_matches('\r'))),
                Err(e) => error = Some(not_utf8(e)),
            }
        }
        frames.extend(self.pending.take());
        (frames, error)
    }

    /// Bytes held back waiting for the rest of an event.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.pending.data.iter().map(String::len).sum::<usize>()
    }

    fn process_line(&mut self, line: &str) -> Option<Frame> {
        match self.framing {
            Framing::Ndjson => {
                let line = line.trim();
                if line.is_empty() {
                    None
                } else {
                    Some(Frame::data(line))
                }
            }
            Framing::Sse => {
                if line.is_empty() {
                    return self.pending.take();
                }
                if line.starts_with(':') {
                    return None;
                }
                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };
                match field {
                    "event" => self.pending.event = Some(value.to_string()),
                    "data" => self.pending.data.push(value.to_string()),
                    _ => {}
                }
                None
            }
        }
    }
}

fn not_utf8(e: std::string::FromUtf8Error) -> RouterError {
    RouterError::decode(format!("Stream is not valid UTF-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_event_split_across_reads() {
        let mut decoder = FrameDecoder::new(Framing::Sse);

        let (frames, err) = decoder.feed(b"event: message_start\ndata: {\"a\"");
        assert!(frames.is_empty() && err.is_none());
        assert!(decoder.buffered() > 0);

        let (frames, _) = decoder.feed(b":1}\n\n");
        assert_eq!(frames, vec![Frame::named("message_start", "{\"a\":1}")]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_sse_multiple_events_in_one_read() {
        let mut decoder = FrameDecoder::new(Framing::Sse);
        let (frames, err) =
            decoder.feed(b"data: one\n\n: keep-alive\n\ndata: two\r\n\r\ndata: thr");
        assert!(err.is_none());
        assert_eq!(frames, vec![Frame::data("one"), Frame::data("two")]);

        let (frames, _) = decoder.feed(b"ee\n\n");
        assert_eq!(frames, vec![Frame::data("three")]);
    }

    #[test]
    fn test_split_utf8_sequence_is_carried() {
        let mut decoder = FrameDecoder::new(Framing::Ndjson);
        let bytes = "{\"t\":\"é\"}\n".as_bytes();
        // Split inside the two-byte 'é'
        let cut = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.feed(&bytes[..cut]).0.is_empty());
        let (frames, err) = decoder.feed(&bytes[cut..]);
        assert!(err.is_none());
        assert_eq!(frames, vec![Frame::data("{\"t\":\"é\"}")]);
    }

    #[test]
    fn test_invalid_utf8_keeps_earlier_lines() {
        let mut decoder = FrameDecoder::new(Framing::Ndjson);
        let (frames, err) = decoder.feed(b"{\"ok\":1}\n\xFF\xFE\n{\"late\":1}\n");
        assert_eq!(frames, vec![Frame::data("{\"ok\":1}")]);
        assert!(matches!(err, Some(RouterError::Decode { .. })));
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = FrameDecoder::new(Framing::Sse);
        assert!(decoder.feed(b"data: [DONE]").0.is_empty());
        let (frames, err) = decoder.finish();
        assert_eq!(frames, vec![Frame::data("[DONE]")]);
        assert!(err.is_none());
    }

    #[test]
    fn test_frame_encoding() {
        let frame = Frame::named("ping", "{}");
        assert_eq!(&frame.to_bytes(Framing::Sse)[..], b"event: ping\ndata: {}\n\n");
        assert_eq!(&Frame::data("{}").to_bytes(Framing::Ndjson)[..], b"{}\n");
    }
}
