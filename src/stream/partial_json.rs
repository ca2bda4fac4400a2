//! Parse-gated accumulation of streamed tool input.

use serde_json::Value;

/// Buffers incremental tool-input JSON until it parses as an object.
///
/// Providers send either the whole input so far or the next fragment. A chunk
/// that extends the buffer, or a complete object arriving after the buffer
/// already parsed, replaces it; anything else is appended.
#[derive(Debug, Clone, Default)]
pub struct ToolInputBuffer {
    raw: String,
    parsed: Option<Value>,
}

impl ToolInputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the input when the buffer is complete JSON.
    pub fn push(&mut self, chunk: &str) -> Option<&Value> {
        // Empty chunks and stale resends of an earlier prefix change nothing.
        if chunk.is_empty() || (self.parsed.is_some() && self.raw.starts_with(chunk)) {
            return self.parsed.as_ref();
        }
        if self.parsed.is_some() && chunk.trim_start().starts_with('{') {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(chunk.trim()) {
                self.raw.clear();
                self.raw.push_str(chunk);
                self.parsed = Some(value);
                return self.parsed.as_ref();
            }
        }
        if !self.raw.is_empty() && chunk.starts_with(self.raw.as_str()) {
            self.raw.clear();
            self.raw.push_str(chunk);
        } else {
            self.raw.push_str(chunk);
        }

        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(self.raw.trim()) {
            self.parsed = Some(value);
        }
        self.parsed.as_ref()
    }

    /// Latest complete input, if any.
    pub fn parsed(&self) -> Option<&Value> {
        self.parsed.as_ref()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}
