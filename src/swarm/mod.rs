//! Multi-agent swarm: a coordinator, specialists and one responder passing
//! control through the `hand_off_to_agent` tool.

pub mod handoff;
pub mod node;
pub mod orchestrator;

pub use handoff::{handoff_tool, Handoff, HandoffSlot, HandoffWindow, HANDOFF_TOOL_NAME};
pub use node::{NodeRole, NodeTools, SwarmDefinition, SwarmNode};
pub use orchestrator::{run_swarm_turn, run_swarm_turn_with_cancel, LIMIT_REACHED_MESSAGE};
