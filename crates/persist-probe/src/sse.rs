//! Line-oriented decoding of the agent event stream.
//!
//! The probe only cares about `data: ` lines carrying JSON objects. Comments,
//! keep-alives, and `event:`/`id:` fields are skipped, and malformed payloads
//! are reported separately so callers can log them without failing.

use crate::StreamEvent;

/// Literal prefix of an event payload line.
pub const DATA_PREFIX: &str = "data: ";

/// Classification of one received line.
#[derive(Clone, Debug, PartialEq)]
pub enum LineKind {
    Blank,
    Ignored,
    Event(StreamEvent),
    Malformed { raw: String, reason: String },
}

pub fn decode_line(line: &str) -> LineKind {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return LineKind::Blank;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineKind::Ignored;
    };
    match StreamEvent::from_json(payload) {
        Ok(event) => LineKind::Event(event),
        Err(reason) => LineKind::Malformed {
            raw: payload.to_string(),
            reason,
        },
    }
}

/// Incremental splitter that accepts raw chunks and yields complete lines.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters split
/// across chunks decode correctly.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk and return any completed lines without their terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }

        lines
    }

    /// Flush an unterminated trailing line when the stream ends.
    pub fn finish(self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer);
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"data: {\"type\":").is_empty());
        let lines = decoder.push(b"\"a\"}\r\n\ndata: x");
        assert_eq!(lines, vec!["data: {\"type\":\"a\"}".to_string(), String::new()]);
        assert_eq!(decoder.finish().as_deref(), Some("data: x"));
    }

    #[test]
    fn keeps_multibyte_characters_split_between_chunks() {
        let bytes = "data: {\"type\":\"é\"}\n".as_bytes();
        let split = bytes.iter().position(|byte| *byte == 0xC3).expect("lead byte") + 1;
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let lines = decoder.push(&bytes[split..]);
        assert_eq!(lines, vec!["data: {\"type\":\"é\"}".to_string()]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_dropped() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"data: {\"type\":\"\xFF\"}\n");
        assert_eq!(lines.len(), 1);
        match decode_line(&lines[0]) {
            LineKind::Event(event) => assert_eq!(event.event_type, "\u{FFFD}"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn classifies_lines() {
        assert_eq!(decode_line(""), LineKind::Blank);
        assert_eq!(decode_line("   "), LineKind::Blank);
        assert_eq!(decode_line(": keep-alive"), LineKind::Ignored);
        assert_eq!(decode_line("event: message"), LineKind::Ignored);
        assert_eq!(decode_line("data:{\"type\":\"tight\"}"), LineKind::Ignored);

        match decode_line("data: {\"type\":\"tool_call\",\"name\":\"search\"}") {
            LineKind::Event(event) => assert_eq!(event.event_type, "tool_call"),
            other => panic!("expected event, got {other:?}"),
        }
        assert!(matches!(
            decode_line("data: [DONE]"),
            LineKind::Malformed { raw, .. } if raw == "[DONE]"
        ));
    }

    #[test]
    fn finish_on_empty_buffer_yields_nothing() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"data: {}\n");
        assert_eq!(decoder.finish(), None);
    }
}
