//! Streaming: raw LLM chunks in, semantic events out.

pub mod events;
pub mod partial_json;
pub mod processor;
pub mod sse;

pub use events::{AgentEvent, EventImage};
pub use partial_json::ToolInputBuffer;
pub use processor::{EventProcessor, PendingToolUse, StreamOutcome, TurnState, CANCELLED_TOOL_RESULT};
pub use sse::{encode_event, sse_frames, EventSink};
