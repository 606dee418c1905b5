//! Incremental SSE framing and the typed events carried on the stream.

use serde::Deserialize;

use odm_core::Message;

/// Events the gateway pushes: `connected` (handshake), `ping` (heartbeat,
/// ignored), `message` (inbound, deduplicated by id before insertion).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected,
    Ping,
    Message { message: Message },
}

/// Accumulates raw network chunks and yields complete `data:` payloads.
/// Chunk boundaries fall anywhere, including inside a UTF-8 sequence, so the
/// buffer stays bytes until a full line is available.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk; returns every event payload completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
            // Comment lines and other SSE fields (event:, id:, retry:) are
            // ignored; the gateway encodes everything in the data payload.
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_chunks_reassemble() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"type\":\"conn").is_empty());
        let payloads = parser.push(b"ected\"}\n\n");
        assert_eq!(payloads, vec!["{\"type\":\"connected\"}".to_string()]);
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let payloads =
            parser.push(b"data: {\"type\":\"connected\"}\n\ndata: {\"type\":\"ping\"}\n\n");
        assert_eq!(payloads.len(), 2);
    }

    #[test]
    fn crlf_and_comments_are_tolerated() {
        let mut parser = SseParser::new();
        let payloads = parser.push(b": keep-alive\r\ndata: {\"type\":\"ping\"}\r\n\r\n");
        assert_eq!(payloads, vec!["{\"type\":\"ping\"}".to_string()]);
    }

    #[test]
    fn payloads_deserialize_to_typed_events() {
        let event: StreamEvent = serde_json::from_str("{\"type\":\"connected\"}").unwrap();
        assert_eq!(event, StreamEvent::Connected);
        let event: StreamEvent = serde_json::from_str("{\"type\":\"ping\"}").unwrap();
        assert_eq!(event, StreamEvent::Ping);
    }
}
