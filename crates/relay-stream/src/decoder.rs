use bytes::BytesMut;
use serde_json::Value;
use tracing::debug;

/// Kind assumed for `data:` lines that arrive before any `event:` line.
pub const DEFAULT_EVENT_KIND: &str = "text";

const PREVIEW_CHARS: usize = 80;

/// One `(event-kind, payload)` unit extracted from the stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub kind: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Line-driven decoder for `event:` / `data:` framing.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; the trailing partial
/// line stays buffered until its newline arrives. Blank lines carry no meaning.
/// A `data:` line whose payload is not valid JSON is dropped without
/// disturbing the lines around it.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    current_kind: String,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            current_kind: DEFAULT_EVENT_KIND.to_owned(),
        }
    }

    /// Append a chunk and drain every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(newline_pos + 1);
            if let Some(frame) = self.decode_line(&line[..newline_pos]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a final line that never got its newline. Called once the source
    /// has completed cleanly.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = self.buffer.split();
        self.decode_line(&line)
    }

    /// Decode a complete payload in one shot.
    pub fn decode_all(input: &[u8]) -> Vec<Frame> {
        let mut decoder = Self::new();
        let mut frames = decoder.feed(input);
        frames.extend(decoder.finish());
        frames
    }

    pub fn current_kind(&self) -> &str {
        &self.current_kind
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<Frame> {
        let line = String::from_utf8_lossy(raw);
        let line = line.strip_suffix('\r').unwrap_or(line.as_ref());

        if let Some(kind) = line.strip_prefix("event:") {
            let kind = kind.trim();
            self.current_kind = if kind.is_empty() {
                DEFAULT_EVENT_KIND.to_owned()
            } else {
                kind.to_owned()
            };
            return None;
        }

        let data = line.strip_prefix("data:")?.trim();
        match serde_json::from_str::<Value>(data) {
            Ok(payload) => Some(Frame::new(self.current_kind.clone(), payload)),
            Err(e) => {
                debug!(
                    kind = %self.current_kind,
                    error = %e,
                    data_preview = %preview(data),
                    "skipping malformed data line"
                );
                None
            }
        }
    }
}

fn preview(data: &str) -> String {
    data.chars().take(PREVIEW_CHARS).collect()
}
