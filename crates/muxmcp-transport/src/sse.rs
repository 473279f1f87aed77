//! Server-Sent Events framing.
//!
//! Pure, no-I/O encoding and incremental decoding. Events are fields
//! separated by newlines and terminated by a blank line:
//!
//! ```text
//! id: 3
//! event: message
//! data: {"jsonrpc":"2.0",...}
//!
//! ```
//!
//! The decoder is fed raw byte chunks straight off an HTTP body and yields
//! complete events as they materialize; partial events stay buffered.

/// A decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `id:` field, if present.
    pub id: Option<String>,
    /// `event:` field; clients treat absence as `"message"`.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

impl SseEvent {
    /// A plain message event.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            data: data.into(),
        }
    }

    /// A message event carrying an id.
    pub fn with_id(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            event: None,
            data: data.into(),
        }
    }

    /// A typed event (e.g. `error`).
    pub fn typed(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Encode to wire format, blank-line terminated.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(ref id) = self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(ref event) = self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.lines() {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Encode a keepalive comment.
pub fn keepalive() -> &'static str {
    ":\n\n"
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns every event completed by it.
    ///
    /// Invalid UTF-8 chunks are skipped rather than poisoning the stream.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.flush() {
                    events.push(event);
                }
            } else if line.starts_with(':') {
                // comment / keepalive
            } else if let Some((field, value)) = line.split_once(':') {
                let value = value.strip_prefix(' ').unwrap_or(value);
                match field {
                    "id" => self.id = Some(value.to_string()),
                    "event" => self.event = Some(value.to_string()),
                    "data" => self.data.push(value.to_string()),
                    _ => {}
                }
            } else {
                match line {
                    "id" => self.id = Some(String::new()),
                    "event" => self.event = Some(String::new()),
                    "data" => self.data.push(String::new()),
                    _ => {}
                }
            }
        }
        events
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.id = None;
            self.event = None;
            return None;
        }
        Some(SseEvent {
            id: self.id.take(),
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_message() {
        assert_eq!(SseEvent::message("hello").encode(), "data: hello\n\n");
    }

    #[test]
    fn encode_with_id_and_type() {
        let event = SseEvent {
            id: Some("3".to_string()),
            event: Some("error".to_string()),
            data: "boom".to_string(),
        };
        assert_eq!(event.encode(), "id: 3\nevent: error\ndata: boom\n\n");
    }

    #[test]
    fn encode_multiline_data() {
        assert_eq!(
            SseEvent::message("a\nb").encode(),
            "data: a\ndata: b\n\n"
        );
    }

    #[test]
    fn decode_simple() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: hello\n\n");
        assert_eq!(events, vec![SseEvent::message("hello")]);
    }

    #[test]
    fn decode_across_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"id: 7\nda").is_empty());
        assert!(decoder.feed(b"ta: part").is_empty());
        let events = decoder.feed(b"ial\n\n");
        assert_eq!(events, vec![SseEvent::with_id("7", "partial")]);
    }

    #[test]
    fn decode_multiple_events_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: one\n\ndata: two\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn decode_skips_comments_and_unknown_fields() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": ping\nretry: 5000\ndata: real\n\n");
        assert_eq!(events, vec![SseEvent::message("real")]);
    }

    #[test]
    fn decode_handles_crlf() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: windows\r\n\r\n");
        assert_eq!(events, vec![SseEvent::message("windows")]);
    }

    #[test]
    fn blank_line_without_data_emits_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"id: 1\n\n").is_empty());
        // the orphaned id must not leak into the next event
        let events = decoder.feed(b"data: next\n\n");
        assert_eq!(events, vec![SseEvent::message("next")]);
    }

    #[test]
    fn round_trip() {
        let original = SseEvent::with_id("42", "line1\nline2");
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(original.encode().as_bytes());
        assert_eq!(events, vec![original]);
    }
}
