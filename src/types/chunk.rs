//! Low-level chunks produced by an LLM streaming call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

use super::message::Message;
use super::usage::Usage;

/// Why the model stopped producing output for one call.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    /// The model asked for human approval before continuing.
    Interrupt,
    Cancelled,
}

/// A human-in-the-loop approval request raised by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interrupt {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub reason: Value,
}

/// The caller's answer to an [`Interrupt`], sent with the next turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptResponse {
    pub interrupt_id: String,
    pub response: Value,
}

/// One item of a provider's chunk stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LlmChunk {
    Reasoning { text: String },
    /// Answer text delta.
    Data { text: String },
    /// Incremental tool input. `input` is a JSON string that is either the
    /// accumulated input so far or the next fragment of it.
    CurrentToolUse {
        tool_use_id: String,
        name: String,
        input: String,
    },
    Metadata { usage: Usage },
    /// A complete message assembled by the provider.
    Message { message: Message },
    /// Final chunk of one model call.
    Result {
        stop_reason: StopReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Message>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        interrupts: Vec<Interrupt>,
    },
}

impl LlmChunk {
    pub fn data(text: impl Into<String>) -> Self {
        Self::Data { text: text.into() }
    }

    pub fn tool_input(
        tool_use_id: impl Into<String>,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self::CurrentToolUse {
            tool_use_id: tool_use_id.into(),
            name: name.into(),
            input: input.into(),
        }
    }

    pub fn usage(input_tokens: u64, output_tokens: u64) -> Self {
        Self::Metadata {
            usage: Usage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
                ..Default::default()
            },
        }
    }

    pub fn end(stop_reason: StopReason) -> Self {
        Self::Result {
            stop_reason,
            message: None,
            interrupts: Vec::new(),
        }
    }
}
