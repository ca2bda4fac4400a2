//! Convenience re-exports for common use.

pub use crate::config::{RuntimeSettings, SettingsLoader};
pub use crate::error::{Result, WeftError};
pub use crate::history::SessionKey;
pub use crate::llm::{LlmProvider, LlmRequest, ToolSpec};
pub use crate::runtime::RuntimeContext;
pub use crate::session::{SessionManager, SessionStores};
pub use crate::stream::{AgentEvent, EventSink};
pub use crate::swarm::{NodeRole, SwarmDefinition, SwarmNode};
pub use crate::tools::{FnTool, ToolHandler, ToolOutput, ToolRegistry};
pub use crate::turn::{AgentProfile, TurnOutcome, TurnRequest, TurnStatus};
pub use crate::types::{ContentBlock, LlmChunk, Message, Role, Usage};
