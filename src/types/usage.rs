//! Token usage accounting.

use serde::{Deserialize, Serialize};

/// Token usage reported by one LLM call, or accumulated over a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Accumulate another call's usage into this one.
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.total_tokens += if other.total_tokens > 0 {
            other.total_tokens
        } else {
            other.input_tokens + other.output_tokens
        };
    }

    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}
