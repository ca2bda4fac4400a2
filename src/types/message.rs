//! Messages and content blocks exchanged with the LLM and persisted in session logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Conversation role. Tool results travel in user-role messages.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Outcome of a tool invocation.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Inline bytes or a reference to durable storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Ref(String),
}

/// The assistant's request to invoke a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

/// A tool's answer, paired to a prior [`ToolUse`] by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub status: ToolStatus,
    pub content: Vec<ToolResultContent>,
}

impl ToolResult {
    pub fn success(tool_use_id: impl Into<String>, content: Vec<ToolResultContent>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            status: ToolStatus::Success,
            content,
        }
    }

    /// An error result carrying a single text explanation.
    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            status: ToolStatus::Error,
            content: vec![ToolResultContent::Text {
                text: message.into(),
            }],
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

/// Payload items inside a tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text { text: String },
    Json { json: Value },
    Image { format: String, source: MediaSource },
    Document {
        format: String,
        name: String,
        source: MediaSource,
    },
}

/// A single block of message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Reasoning { text: String },
    ToolUse(ToolUse),
    ToolResult(ToolResult),
    Image { format: String, source: MediaSource },
    Document {
        format: String,
        name: String,
        source: MediaSource,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(tool_use_id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse(ToolUse {
            tool_use_id: tool_use_id.into(),
            name: name.into(),
            input,
        })
    }

    pub fn as_tool_use(&self) -> Option<&ToolUse> {
        match self {
            Self::ToolUse(tu) => Some(tu),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResult> {
        match self {
            Self::ToolResult(tr) => Some(tr),
            _ => None,
        }
    }
}

/// A message in a session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    /// A user-role message answering tool calls.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self::new(
            Role::User,
            results.into_iter().map(ContentBlock::ToolResult).collect(),
        )
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = &ToolUse> {
        self.content.iter().filter_map(ContentBlock::as_tool_use)
    }

    pub fn tool_result_blocks(&self) -> impl Iterator<Item = &ToolResult> {
        self.content.iter().filter_map(ContentBlock::as_tool_result)
    }

    pub fn has_tool_result(&self) -> bool {
        self.tool_result_blocks().next().is_some()
    }

    /// A user message that starts a new turn (not a tool-result carrier).
    pub fn is_turn_boundary(&self) -> bool {
        self.role == Role::User && !self.has_tool_result()
    }
}

/// Serde adapter encoding byte payloads as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn content_blocks_use_type_tags() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("checking"),
                ContentBlock::tool_use("t1", "search", json!({"q": "rust"})),
            ],
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][1]["type"], "tool_use");
        assert_eq!(value["content"][1]["tool_use_id"], "t1");
        assert_eq!(value["content"][1]["input"]["q"], "rust");
    }

    #[test]
    fn embedded_bytes_survive_serialization() {
        let msg = Message::new(
            Role::User,
            vec![
                ContentBlock::Image {
                    format: "png".into(),
                    source: MediaSource::Bytes(vec![0, 159, 146, 150, 255]),
                },
                ContentBlock::ToolResult(ToolResult::success(
                    "t9",
                    vec![ToolResultContent::Document {
                        format: "pdf".into(),
                        name: "report".into(),
                        source: MediaSource::Ref("s3://bucket/report.pdf".into()),
                    }],
                )),
            ],
        );
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"bytes\":\"AJ+Slv8=\""));
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn turn_boundary_excludes_tool_result_carriers() {
        assert!(Message::user("hi").is_turn_boundary());
        assert!(!Message::assistant("hello").is_turn_boundary());
        assert!(!Message::tool_results(vec![ToolResult::error("t1", "boom")]).is_turn_boundary());
    }

    #[test]
    fn role_parses_from_str() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!(Role::User.to_string(), "user");
    }
}
