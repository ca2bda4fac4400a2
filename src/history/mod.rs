//! Durable session storage contracts.
//!
//! Three stores back a session:
//! - [`HistoryStore`]: append-only message log per `(user, session, agent)`.
//! - [`SummaryStore`]: read-only digests written by an external memory service.
//! - [`StateStore`]: artifact map per `(user, session)` and agent bookkeeping.

pub mod file;
pub mod memory;

pub use file::{FileHistoryStore, FileStateStore, FileSummaryStore};
pub use memory::{InMemoryHistoryStore, InMemoryStateStore, InMemorySummaryStore};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ArtifactMap, Message};

/// Agent id of the shared swarm transcript.
pub const SWARM_AGENT_ID: &str = "swarm";

/// Identifies one session log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
    pub agent_id: String,
}

impl SessionKey {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
        }
    }

    /// Same user and session, different agent role.
    pub fn with_agent(&self, agent_id: impl Into<String>) -> Self {
        Self {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            agent_id: agent_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.session_id, self.agent_id)
    }
}

/// Per-agent bookkeeping that outlives a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentState {
    /// Context size of the most recent LLM call of the previous turn.
    pub last_llm_input_tokens: u64,
    pub message_count_hint: usize,
}

/// Append-only message log.
///
/// Implementations must serialize appends per key and return messages in append order.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, key: &SessionKey, message: &Message) -> Result<()>;

    async fn list(&self, key: &SessionKey, offset: usize, limit: usize) -> Result<Vec<Message>>;

    async fn list_all(&self, key: &SessionKey) -> Result<Vec<Message>>;

    async fn count(&self, key: &SessionKey) -> Result<usize>;
}

/// Read side of the external memory service.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Digests for `user_id`, most relevant first.
    async fn get_summaries(
        &self,
        user_id: &str,
        strategy_id: &str,
        top_k: usize,
        min_relevance: f64,
    ) -> Result<Vec<String>>;
}

/// Artifact map and agent state persistence.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_artifacts(&self, user_id: &str, session_id: &str) -> Result<ArtifactMap>;

    async fn save_artifacts(
        &self,
        user_id: &str,
        session_id: &str,
        artifacts: &ArtifactMap,
    ) -> Result<()>;

    async fn load_agent_state(&self, key: &SessionKey) -> Result<Option<AgentState>>;

    async fn save_agent_state(&self, key: &SessionKey, state: &AgentState) -> Result<()>;
}

/// A stored summary with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub text: String,
    pub relevance: f64,
}

/// Filter and rank summary records the way every backend must.
pub(crate) fn rank_summaries(
    mut records: Vec<SummaryRecord>,
    top_k: usize,
    min_relevance: f64,
) -> Vec<String> {
    records.retain(|r| r.relevance >= min_relevance);
    records.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
    records.into_iter().take(top_k).map(|r| r.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_are_ranked_and_filtered() {
        let records = vec![
            SummaryRecord {
                text: "low".into(),
                relevance: 0.1,
            },
            SummaryRecord {
                text: "high".into(),
                relevance: 0.9,
            },
            SummaryRecord {
                text: "mid".into(),
                relevance: 0.5,
            },
        ];
        assert_eq!(rank_summaries(records.clone(), 2, 0.0), vec!["high", "mid"]);
        assert_eq!(rank_summaries(records, 5, 0.4), vec!["high", "mid"]);
    }

    #[test]
    fn with_agent_keeps_user_and_session() {
        let key = SessionKey::new("u1", "s1", "text");
        let swarm = key.with_agent(SWARM_AGENT_ID);
        assert_eq!(swarm.user_id, "u1");
        assert_eq!(swarm.session_id, "s1");
        assert_eq!(swarm.to_string(), "u1/s1/swarm");
    }
}
