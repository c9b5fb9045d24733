use serde_json::Value;

/// Incremental decoder for `text/event-stream` bodies carrying text fragments.
///
/// Only `data:` lines are read. Each payload is parsed as JSON and the fragment
/// is taken from `candidates[0].content.parts[0].text` (Gemini style) or from
/// a top-level `text`. Payloads that are not JSON, `[DONE]` markers and empty
/// fragments are skipped.
#[derive(Debug, Default)]
pub struct SseTextDecoder {
    buffer: Vec<u8>,
}

impl SseTextDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw body bytes and returns the fragments completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut fragments = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(text) = decode_line(&line) {
                fragments.push(text);
            }
        }
        fragments
    }

    /// Flushes a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line)
    }
}

fn decode_line(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let parsed: Value = serde_json::from_str(data).ok()?;
    extract_text(&parsed)
}

pub fn extract_text(value: &Value) -> Option<String> {
    let text = value
        .pointer("/candidates/0/content/parts/0/text")
        .or_else(|| value.get("text"))
        .and_then(Value::as_str)?;
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
