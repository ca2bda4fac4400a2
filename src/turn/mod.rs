//! Turn driver and user-message composition.

pub mod driver;
pub mod prompt;

pub(crate) use driver::{save_partial_response, AgentLoop, LoopOutcome};
pub use driver::{
    run_turn, run_turn_with_cancel, AgentProfile, TurnOutcome, TurnRequest, TurnStatus,
    DEFAULT_AGENT_ID, INTERRUPTED_MARKER, STOPPED_MESSAGE,
};
pub use prompt::{canonical_filename, compose_user_message, sanitize_filename, workspace_hint, FileKind};
