//! Session state: the per-agent log, artifacts, and two-stage compaction.

pub mod compaction;
pub mod manager;

pub use compaction::{
    decide_stage, find_safe_cutoff, normalize_roles, repair_tool_pairing, truncate_tool_content,
    CompactionStage,
};
pub use manager::{SessionManager, SessionStores};
