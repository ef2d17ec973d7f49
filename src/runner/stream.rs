//! PTY byte stream → validated JSON line filter.
//!
//! The assistant's CLI writes stream-json to a PTY, which means its output
//! arrives wrapped in terminal noise: the echoed command line, ANSI color
//! and cursor sequences, and arbitrary chunk boundaries. The filter peels
//! all of that off in four stages:
//!
//! 1. discard everything before the first `{"type":` (the command echo)
//! 2. strip CSI (`ESC [ ... letter`) and OSC (`ESC ] ... BEL`) sequences
//! 3. buffer into complete newline-terminated lines
//! 4. drop lines that are not valid JSON

/// Sentinel marking the first byte of real assistant output.
pub const JSON_SENTINEL: &str = "{\"type\":";

/// Streaming filter; feed chunks with [`push`](JsonLineFilter::push), which
/// returns the complete JSON lines they unlocked.
pub struct JsonLineFilter {
    buf: String,
    started: bool,
}

impl Default for JsonLineFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLineFilter {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            started: false,
        }
    }

    /// Feed one raw PTY chunk; returns every complete, valid JSON line it
    /// completed. Invalid UTF-8 is replaced, not fatal.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        if !self.started {
            match self.buf.find(JSON_SENTINEL) {
                Some(idx) => {
                    self.buf.drain(..idx);
                    self.started = true;
                }
                None => {
                    self.trim_prefix_buffer();
                    return Vec::new();
                }
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let raw: String = self.buf.drain(..=pos).collect();
            if let Some(line) = clean_line(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing unterminated line after the stream closes.
    pub fn finish(&mut self) -> Option<String> {
        if !self.started || self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        clean_line(&raw)
    }

    /// Before the sentinel shows up, only a tail long enough to hold a
    /// split sentinel needs to survive; the echo can otherwise grow without
    /// bound on chatty shells.
    fn trim_prefix_buffer(&mut self) {
        let keep = JSON_SENTINEL.len() - 1;
        if self.buf.len() <= keep {
            return;
        }
        let mut cut = self.buf.len() - keep;
        while cut < self.buf.len() && !self.buf.is_char_boundary(cut) {
            cut += 1;
        }
        self.buf.drain(..cut);
    }
}

/// Scrub one raw line; `Some` only when what remains parses as JSON.
fn clean_line(raw: &str) -> Option<String> {
    let stripped = strip_ansi(raw.trim_end_matches(['\n', '\r']));
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return None;
    }
    if serde_json::from_str::<serde_json::Value>(trimmed).is_err() {
        return None;
    }
    Some(trimmed.to_string())
}

/// Strip CSI (`ESC [ ... final-letter`) and OSC (`ESC ] ... BEL`) escape
/// sequences.
fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for ch in chars.by_ref() {
                    if ch.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                for ch in chars.by_ref() {
                    if ch == '\x07' {
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_everything_before_sentinel() {
        let mut filter = JsonLineFilter::new();
        let lines = filter.push(b"$ claude --session-id abc -p 'hi'\r\n");
        assert!(lines.is_empty());
        let lines = filter.push(b"{\"type\":\"system\"}\n");
        assert_eq!(lines, vec![r#"{"type":"system"}"#]);
    }

    #[test]
    fn sentinel_split_across_chunks_is_found() {
        let mut filter = JsonLineFilter::new();
        assert!(filter.push(b"echo noise {\"ty").is_empty());
        let lines = filter.push(b"pe\":\"result\"}\n");
        assert_eq!(lines, vec![r#"{"type":"result"}"#]);
    }

    #[test]
    fn strips_csi_and_osc_sequences() {
        assert_eq!(strip_ansi("\x1b[32mgreen\x1b[0m"), "green");
        assert_eq!(strip_ansi("\x1b]0;title\x07rest"), "rest");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn buffers_partial_lines_across_chunks() {
        let mut filter = JsonLineFilter::new();
        assert!(filter.push(b"{\"type\":\"assist").is_empty());
        let lines = filter.push(b"ant\"}\n{\"type\":\"x\"}\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"type":"assistant"}"#);
    }

    #[test]
    fn non_json_lines_are_dropped() {
        let mut filter = JsonLineFilter::new();
        let lines =
            filter.push(b"{\"type\":\"a\"}\nwarning: something\n{\"type\":\"b\"}\n");
        assert_eq!(lines, vec![r#"{"type":"a"}"#, r#"{"type":"b"}"#]);
    }

    #[test]
    fn every_emitted_line_parses_as_json() {
        let mut filter = JsonLineFilter::new();
        let noise = b"prompt$ run\x1b[1m\n{\"type\":\"a\",\"n\":1}\ngarbage\n{\"type\":\"b\"}\n";
        for line in filter.push(noise) {
            serde_json::from_str::<serde_json::Value>(&line).unwrap();
        }
    }

    #[test]
    fn ansi_inside_json_lines_is_scrubbed() {
        let mut filter = JsonLineFilter::new();
        let lines = filter.push(b"{\"type\":\"a\"\x1b[0m}\n");
        assert_eq!(lines, vec![r#"{"type":"a"}"#]);
    }

    #[test]
    fn finish_flushes_trailing_line() {
        let mut filter = JsonLineFilter::new();
        assert!(filter.push(b"{\"type\":\"end\"}").is_empty());
        assert_eq!(filter.finish().as_deref(), Some(r#"{"type":"end"}"#));
        assert!(filter.finish().is_none());
    }

    #[test]
    fn prefix_buffer_stays_bounded() {
        let mut filter = JsonLineFilter::new();
        for _ in 0..1000 {
            filter.push(&[b'x'; 1024]);
        }
        assert!(filter.buf.len() < JSON_SENTINEL.len());
    }
}
