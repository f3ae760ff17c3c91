//! Incremental `text/event-stream` line decoding.
//!
//! Bytes arrive in arbitrary network-sized pieces. A multi-byte UTF-8
//! character may straddle two pieces, and a line may straddle many. The
//! decoder keeps the undecoded tail and the unterminated line between calls
//! and only ever yields whole `data:` payloads.

/// Field prefix every payload line carries.
pub const DATA_PREFIX: &str = "data:";
/// Literal payload that ends the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
}

#[derive(Debug, Default)]
pub struct LineDecoder {
    pending_bytes: Vec<u8>,
    line: String,
    done: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the terminal sentinel has been seen. Nothing is yielded after it.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one chunk of bytes and return every frame it completes.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        if self.done {
            return Vec::new();
        }
        self.pending_bytes.extend_from_slice(bytes);
        let text = self.decode_available();
        self.push_text(&text)
    }

    /// Flush at end of input: an unterminated last line still counts.
    /// Trailing bytes that never formed a full character are replaced.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.done {
            return Vec::new();
        }
        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.pending_bytes.clear();
            self.line.push_str(&tail);
        }
        let mut frames = Vec::new();
        let line = std::mem::take(&mut self.line);
        self.emit_line(&line, &mut frames);
        frames
    }

    fn decode_available(&mut self) -> String {
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending_bytes.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending_bytes[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: keep it for the next push.
                        None => {
                            self.pending_bytes.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    fn push_text(&mut self, text: &str) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            self.line.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];
            let line = std::mem::take(&mut self.line);
            self.emit_line(&line, &mut frames);
            if self.done {
                self.line.clear();
                return frames;
            }
        }
        self.line.push_str(rest);
        frames
    }

    fn emit_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if let Some(payload) = parse_data_line(line) {
            if payload == DONE_SENTINEL {
                self.done = true;
                frames.push(SseFrame::Done);
            } else {
                frames.push(SseFrame::Data(payload.to_string()));
            }
        }
    }
}

/// Strip the `data:` prefix (and one optional space) from a line.
/// Returns `None` for comments, other fields, blank lines and empty payloads.
pub fn parse_data_line(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> SseFrame {
        SseFrame::Data(s.to_string())
    }

    #[test]
    fn splits_complete_frames() {
        let mut dec = LineDecoder::new();
        let frames = dec.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(frames, vec![data("{\"a\":1}"), data("{\"b\":2}")]);
    }

    #[test]
    fn line_split_across_pushes() {
        let mut dec = LineDecoder::new();
        assert!(dec.push(b"data: {\"con").is_empty());
        assert!(dec.push(b"tent\":\"hi\"").is_empty());
        let frames = dec.push(b"}\n\n");
        assert_eq!(frames, vec![data("{\"content\":\"hi\"}")]);
    }

    #[test]
    fn multibyte_character_split_across_pushes() {
        let text = "data: {\"content\":\"héllo ✓\"}\n";
        let bytes = text.as_bytes();
        let check = bytes.iter().position(|&b| b == 0xE2).unwrap();

        let mut dec = LineDecoder::new();
        let mut frames = dec.push(&bytes[..check + 1]);
        frames.extend(dec.push(&bytes[check + 1..]));
        assert_eq!(frames, vec![data("{\"content\":\"héllo ✓\"}")]);
    }

    #[test]
    fn byte_at_a_time_matches_whole_input() {
        let text = "data: {\"content\":\"日本語\"}\n\ndata: [DONE]\n\n";
        let mut whole = LineDecoder::new();
        let expected = whole.push(text.as_bytes());

        let mut dec = LineDecoder::new();
        let mut frames = Vec::new();
        for b in text.as_bytes() {
            frames.extend(dec.push(std::slice::from_ref(b)));
        }
        assert_eq!(frames, expected);
        assert_eq!(frames.last(), Some(&SseFrame::Done));
    }

    #[test]
    fn ignores_non_data_lines() {
        let mut dec = LineDecoder::new();
        let frames = dec.push(b": keepalive\nevent: message\nid: 7\ndata:\nretry: 10\ndata: x\n");
        assert_eq!(frames, vec![data("x")]);
    }

    #[test]
    fn done_sentinel_stops_output() {
        let mut dec = LineDecoder::new();
        let frames = dec.push(b"data: a\n\ndata: [DONE]\n\ndata: b\n\n");
        assert_eq!(frames, vec![data("a"), SseFrame::Done]);
        assert!(dec.is_done());
        assert!(dec.push(b"data: c\n").is_empty());
        assert!(dec.finish().is_empty());
    }

    #[test]
    fn crlf_framing() {
        let mut dec = LineDecoder::new();
        let frames = dec.push(b"data: one\r\n\r\ndata:two\r\n");
        assert_eq!(frames, vec![data("one"), data("two")]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut dec = LineDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        assert_eq!(dec.finish(), vec![data("tail")]);
    }

    #[test]
    fn invalid_bytes_are_replaced_not_fatal() {
        let mut dec = LineDecoder::new();
        let frames = dec.push(b"data: a\xFFb\n");
        assert_eq!(frames, vec![data("a\u{FFFD}b")]);
    }

    #[test]
    fn parse_data_line_variants() {
        assert_eq!(parse_data_line("data: x"), Some("x"));
        assert_eq!(parse_data_line("data:x"), Some("x"));
        assert_eq!(parse_data_line("data:  x"), Some(" x"));
        assert_eq!(parse_data_line("data: "), None);
        assert_eq!(parse_data_line("event: x"), None);
        assert_eq!(parse_data_line(""), None);
    }
}
