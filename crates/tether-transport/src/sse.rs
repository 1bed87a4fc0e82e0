//! Server-Sent Events (SSE) parser.
//!
//! Parses text from an HTTP response body into SSE events according to
//! the W3C EventSource specification.

/// A single SSE event parsed from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The `event:` field; `None` means the default `message` type.
    pub event_type: Option<String>,
    pub data: String,
    pub id: Option<String>,
    /// Reconnection hint from a `retry:` field, in milliseconds.
    pub retry_ms: Option<u64>,
}

impl SseEvent {
    /// The effective event type (`message` when none was given).
    pub fn kind(&self) -> &str {
        self.event_type.as_deref().unwrap_or("message")
    }
}

/// Incremental SSE parser that processes text chunks into events.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of text and return any complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        // CRLF may straddle two chunks, so normalize the whole buffer.
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = Self::parse_block(&block[..pos]) {
                events.push(event);
            }
        }
        events
    }

    /// Parse one block (the lines between blank lines) into an event.
    fn parse_block(block: &str) -> Option<SseEvent> {
        let mut event_type = None;
        let mut data_lines = Vec::new();
        let mut id = None;
        let mut retry_ms = None;

        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event_type = Some(value.to_string()),
                "data" => data_lines.push(value.to_string()),
                "id" if !value.contains('\0') => id = Some(value.to_string()),
                "retry" => retry_ms = value.parse().ok().or(retry_ms),
                _ => {}
            }
        }

        if data_lines.is_empty() && id.is_none() && retry_ms.is_none() {
            return None;
        }

        Some(SseEvent {
            event_type,
            data: data_lines.join("\n"),
            id,
            retry_ms,
        })
    }
}
