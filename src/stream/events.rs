//! Semantic events streamed to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Interrupt, MediaSource, ToolResultContent, ToolStatus, Usage};

/// An image surfaced to the caller with the final answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventImage {
    pub format: String,
    pub source: MediaSource,
}

/// Events emitted during a turn, in production order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Turn start; exactly once per turn.
    Init {
        session_id: String,
        agent_id: String,
    },
    Reasoning {
        text: String,
    },
    Response {
        text: String,
    },
    /// First parseable input for a tool call, or a later update with a larger input.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        status: ToolStatus,
        content: Vec<ToolResultContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    /// Side-channel data (peer progress, external session ids, warnings).
    Metadata {
        data: Value,
    },
    Interrupt {
        interrupts: Vec<Interrupt>,
    },
    Complete {
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<EventImage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        message: String,
    },
    AuthRequired {
        tool_name: String,
        auth_url: String,
    },
    SwarmHandoff {
        from: String,
        to: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    SwarmNodeStart {
        node: String,
    },
    SwarmNodeStop {
        node: String,
        status: String,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Reasoning { .. } => "reasoning",
            Self::Response { .. } => "response",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Metadata { .. } => "metadata",
            Self::Interrupt { .. } => "interrupt",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::AuthRequired { .. } => "auth_required",
            Self::SwarmHandoff { .. } => "swarm_handoff",
            Self::SwarmNodeStart { .. } => "swarm_node_start",
            Self::SwarmNodeStop { .. } => "swarm_node_stop",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Error { .. } | Self::Interrupt { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = AgentEvent::ToolUse {
            id: "t1".into(),
            name: "search".into(),
            input: json!({"q": "hello"}),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "hello"}})
        );
    }

    #[test]
    fn complete_omits_empty_optionals() {
        let event = AgentEvent::Complete {
            message: "done".into(),
            images: Vec::new(),
            usage: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "complete", "message": "done"})
        );
        assert!(event.is_terminal());
    }
}
