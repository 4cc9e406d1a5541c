//! Incremental Server-Sent-Events line parser for the remote API backend.
//! `data:` lines may be split across network chunk boundaries, so an
//! incomplete trailing line is buffered until the next chunk completes it.

pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Feed a raw chunk of bytes; returns the complete `data: ` payloads
    /// extracted so far (with the `data: ` prefix stripped). Non-`data:`
    /// lines (blank lines, `event:` lines, comments) are dropped.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let Some(newline_pos) = self.buffer.find('\n') else {
                break;
            };
            let line: String = self.buffer.drain(..=newline_pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(payload) = line.strip_prefix("data: ") {
                out.push(payload.to_string());
            } else if let Some(payload) = line.strip_prefix("data:") {
                out.push(payload.trim_start().to_string());
            }
        }
        out
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_lines_in_one_chunk() {
        let mut p = SseParser::new();
        let out = p.feed("data: {\"a\":1}\n\ndata: [DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn buffers_a_line_split_across_chunks() {
        let mut p = SseParser::new();
        assert!(p.feed("data: {\"te").is_empty());
        let out = p.feed("xt\":\"hi\"}\n");
        assert_eq!(out, vec!["{\"text\":\"hi\"}".to_string()]);
    }

    #[test]
    fn ignores_non_data_lines() {
        let mut p = SseParser::new();
        let out = p.feed("event: ping\n\ndata: ok\n");
        assert_eq!(out, vec!["ok".to_string()]);
    }
}
