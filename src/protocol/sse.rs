//! Incremental SSE frame decoder.
//!
//! Handles `data:` prefixes, ignores `event:` names and comment/keep-alive
//! lines, and buffers across TCP chunk boundaries. Event names are not
//! surfaced: every dialect we speak repeats the discriminator inside the
//! JSON payload.

/// Stateful decoder; feed raw bytes, get back complete `data:` payloads
/// (including a literal `[DONE]` terminator when present).
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(payload) = Self::payload_of(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Drain whatever is left in the buffer at end of stream.
    pub fn flush(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        rest.lines().filter_map(Self::payload_of).collect()
    }

    fn payload_of(line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
            return None;
        }
        let data = line.strip_prefix("data:")?.trim();
        if data.is_empty() {
            return None;
        }
        Some(data.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_frame() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: {\"x\":1}\n\n");
        assert_eq!(payloads, vec!["{\"x\":1}"]);
    }

    #[test]
    fn buffers_across_chunk_boundaries() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"content\":\"par").is_empty());
        let payloads = decoder.feed(b"tial\"}\n\n");
        assert_eq!(payloads, vec!["{\"content\":\"partial\"}"]);
    }

    #[test]
    fn skips_event_names_and_comments() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"event: message_start\n: keep-alive\ndata: {\"a\":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
    }

    #[test]
    fn passes_done_marker_through() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: 1\n\ndata: 2\n\ndata: 3\n\n");
        assert_eq!(payloads, vec!["1", "2", "3"]);
    }

    #[test]
    fn prefix_without_space_is_accepted() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data:{\"a\":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
    }

    #[test]
    fn flush_drains_trailing_line_without_newline() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\":1}").is_empty());
        assert_eq!(decoder.flush(), vec!["{\"a\":1}"]);
        assert!(decoder.flush().is_empty());
    }
}
