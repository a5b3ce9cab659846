//! Server-Sent Events wire framing.
//!
//! Shared by the two upstream HTTP adapters (parsing) and by anything that
//! writes raw SSE frames outside axum (encoding). Only the `event`, `data`,
//! and comment fields are handled; `id` and `retry` are accepted and ignored.

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name (`event:` field), when present.
    pub event: Option<String>,
    /// Concatenated `data:` payload.
    pub data: String,
}

/// Incremental SSE parser. Feed it body chunks as they arrive; it yields
/// complete events and buffers partial lines across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    partial_line: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    /// Fresh parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut input = String::new();
        input.push_str(&self.partial_line);
        input.push_str(chunk);
        self.partial_line.clear();

        let mut rest = input.as_str();
        while let Some(newline) = rest.find('\n') {
            let line = rest[..newline].trim_end_matches('\r');
            rest = &rest[newline + 1..];
            if let Some(event) = self.consume_line(line) {
                events.push(event);
            }
        }
        self.partial_line.push_str(rest);
        events
    }

    fn consume_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            // Blank line dispatches the accumulated event.
            if self.data_lines.is_empty() {
                self.event_name = None;
                return None;
            }
            let event = SseEvent {
                event: self.event_name.take(),
                data: self.data_lines.join("\n"),
            };
            self.data_lines.clear();
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Encode one SSE frame. With an event name the output is
/// `event: <name>\ndata: <data>\n\n`, otherwise a plain `data:` frame.
pub fn encode_sse_event(event: Option<&str>, data: &str) -> String {
    match event {
        Some(name) => format!("event: {name}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

/// The keep-alive comment frame written every 30 s per connected client.
pub fn keepalive_frame() -> &'static str {
    ":keepalive\n\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_named_event() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: progress\ndata: {\"progress\":50}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("progress".to_string()),
                data: "{\"progress\":50}".to_string(),
            }]
        );
    }

    #[test]
    fn parses_across_chunk_boundaries() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: {\"a\"").is_empty());
        assert!(parser.feed(":1}\n").is_empty());
        let events = parser.feed("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn multiline_data_is_joined() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn comments_and_unknown_fields_are_ignored() {
        let mut parser = SseParser::new();
        let events = parser.feed(":keepalive\n\nid: 42\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn crlf_lines_are_accepted() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message\r\ndata: {}\r\n\r\n");
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn encode_round_trips_through_parser() {
        let frame = encode_sse_event(Some("progress"), "{\"p\":1}");
        let mut parser = SseParser::new();
        let events = parser.feed(&frame);
        assert_eq!(events[0].event.as_deref(), Some("progress"));
        assert_eq!(events[0].data, "{\"p\":1}");
    }

    #[test]
    fn keepalive_is_a_comment() {
        let mut parser = SseParser::new();
        assert!(parser.feed(keepalive_frame()).is_empty());
    }
}
