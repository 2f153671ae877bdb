/// One decoded Server-Sent-Events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Feed raw chunks in arrival order; complete frames are returned as soon as
/// their terminating blank line has been seen. Comment lines and unknown
/// fields are skipped per the SSE wire format.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: String,
    event: String,
    data: Vec<String>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one chunk of the stream, returning any frames it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        // Event payloads on this API are JSON, so lossy decoding of a
        // malformed chunk surfaces later as a JSON parse error.
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();

        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.take_frame() {
                    frames.push(frame);
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = value.to_string(),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn take_frame(&mut self) -> Option<Frame> {
        let event = std::mem::take(&mut self.event);
        let data = std::mem::take(&mut self.data);

        if data.is_empty() {
            return None;
        }

        Some(Frame {
            event,
            data: data.join("\n"),
        })
    }
}
