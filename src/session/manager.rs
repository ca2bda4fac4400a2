//! Per-agent session log with staged compaction on load.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::compaction::{
    build_summary_message, decide_stage, find_safe_cutoff, repair_tool_pairing,
    truncate_tool_content, CompactionStage,
};
use crate::config::{CompactionSettings, RuntimeSettings};
use crate::error::Result;
use crate::history::{
    AgentState, FileHistoryStore, FileStateStore, FileSummaryStore, HistoryStore,
    InMemoryHistoryStore, InMemoryStateStore, InMemorySummaryStore, SessionKey, StateStore,
    SummaryStore,
};
use crate::types::{Artifact, ArtifactMap, ContentBlock, Message, Role};
use crate::util::retry::RetryPolicy;

/// The three backends a session reads and writes.
#[derive(Clone)]
pub struct SessionStores {
    pub history: Arc<dyn HistoryStore>,
    pub summaries: Arc<dyn SummaryStore>,
    pub state: Arc<dyn StateStore>,
}

impl SessionStores {
    pub fn in_memory() -> Self {
        Self {
            history: Arc::new(InMemoryHistoryStore::new()),
            summaries: Arc::new(InMemorySummaryStore::new()),
            state: Arc::new(InMemoryStateStore::new()),
        }
    }

    /// JSON files under `base_dir` (see [`crate::history::file`]).
    pub fn file(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            history: Arc::new(FileHistoryStore::new(&base_dir)),
            summaries: Arc::new(FileSummaryStore::new(&base_dir)),
            state: Arc::new(FileStateStore::new(base_dir)),
        }
    }
}

impl std::fmt::Debug for SessionStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStores").finish_non_exhaustive()
    }
}

/// Owns one `(user, session, agent)` log for the duration of a turn.
///
/// Tools reach it through the invocation context to persist artifacts.
pub struct SessionManager {
    key: SessionKey,
    stores: SessionStores,
    compaction: CompactionSettings,
    summary_strategy_id: String,
    summary_top_k: usize,
    summary_min_relevance: f64,
    retry: RetryPolicy,
    agent_state: Mutex<AgentState>,
    artifacts: Mutex<Option<ArtifactMap>>,
}

impl SessionManager {
    pub fn new(key: SessionKey, stores: SessionStores, settings: &RuntimeSettings) -> Self {
        Self {
            key,
            stores,
            compaction: settings.compaction.clone(),
            summary_strategy_id: settings.turn.summary_strategy_id.clone(),
            summary_top_k: settings.turn.summary_top_k,
            summary_min_relevance: settings.turn.summary_min_relevance,
            retry: settings.retry_policy(),
            agent_state: Mutex::new(AgentState::default()),
            artifacts: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Load the log for a resumed agent, compacted by the previous turn's context size.
    ///
    /// Summary read failures are logged and the summary prefix is skipped.
    pub async fn load_initial_context(&self) -> Result<Vec<Message>> {
        let mut messages = self
            .retry
            .execute("history.list_all", || self.stores.history.list_all(&self.key))
            .await?;
        let count = messages.len();
        let stored = self
            .retry
            .execute("state.load_agent_state", || {
                self.stores.state.load_agent_state(&self.key)
            })
            .await?
            .unwrap_or_default();
        {
            let mut state = self.agent_state.lock().await;
            *state = stored;
            state.message_count_hint = count;
        }

        if count == 0 {
            return Ok(Vec::new());
        }

        let stage = decide_stage(stored.last_llm_input_tokens, &self.compaction);

        let stage = match stage {
            CompactionStage::Checkpoint => {
                let cutoff = find_safe_cutoff(
                    &messages,
                    self.compaction.recent_turns,
                    self.compaction.min_recent_turns,
                );
                if cutoff == 0 {
                    tracing::info!(key = %self.key, "too few turns to checkpoint, truncating instead");
                    CompactionStage::Truncate
                } else {
                    let recent = messages.split_off(cutoff);
                    let summaries = self.load_summaries().await;
                    messages = Vec::with_capacity(recent.len() + 1);
                    if !summaries.is_empty() {
                        messages.push(build_summary_message(&summaries));
                    }
                    messages.extend(recent);
                    tracing::debug!(cutoff, summaries = summaries.len(), "checkpointed history");
                    CompactionStage::Checkpoint
                }
            }
            other => other,
        };

        if stage != CompactionStage::Full {
            let truncated =
                truncate_tool_content(&mut messages, self.compaction.max_tool_content_length);
            tracing::debug!(truncated, "truncated tool payloads");
        }
        tracing::info!(
            key = %self.key,
            %stage,
            stored = count,
            loaded = messages.len(),
            last_llm_input_tokens = stored.last_llm_input_tokens,
            "loaded session context"
        );
        Ok(repair_tool_pairing(messages))
    }

    async fn load_summaries(&self) -> Vec<String> {
        let result = self
            .retry
            .execute("summaries.get", || {
                self.stores.summaries.get_summaries(
                    &self.key.user_id,
                    &self.summary_strategy_id,
                    self.summary_top_k,
                    self.summary_min_relevance,
                )
            })
            .await;
        match result {
            Ok(summaries) => summaries,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "summary read failed, continuing without it");
                Vec::new()
            }
        }
    }

    pub async fn append_message(&self, message: &Message) -> Result<()> {
        self.retry
            .execute("history.append", || {
                self.stores.history.append(&self.key, message)
            })
            .await?;
        self.agent_state.lock().await.message_count_hint += 1;
        Ok(())
    }

    /// Write a user message and the assistant's blocks as one turn.
    ///
    /// If the second append fails the user message stays behind as an orphan;
    /// the next load picks it up and role normalization folds it into the
    /// following request.
    pub async fn append_turn(&self, user: &Message, assistant_blocks: Vec<ContentBlock>) -> Result<()> {
        self.append_message(user).await?;
        if assistant_blocks.is_empty() {
            return Ok(());
        }
        self.append_message(&Message::new(Role::Assistant, assistant_blocks))
            .await
    }

    pub async fn list_all(&self) -> Result<Vec<Message>> {
        self.retry
            .execute("history.list_all", || self.stores.history.list_all(&self.key))
            .await
    }

    /// Another role's full log for the same session, pairing repaired.
    pub async fn load_cross_role_history(&self, from_agent: &str) -> Result<Vec<Message>> {
        let other = self.key.with_agent(from_agent);
        let messages = self
            .retry
            .execute("history.list_all", || self.stores.history.list_all(&other))
            .await?;
        Ok(repair_tool_pairing(messages))
    }

    /// The session's artifact map, loaded on first use.
    pub async fn artifacts(&self) -> Result<ArtifactMap> {
        let mut cached = self.artifacts.lock().await;
        if let Some(map) = cached.as_ref() {
            return Ok(map.clone());
        }
        let map = self.fetch_artifacts().await?;
        *cached = Some(map.clone());
        Ok(map)
    }

    /// Insert or overwrite one artifact and flush the map.
    pub async fn save_artifact(&self, artifact: Artifact) -> Result<()> {
        let mut cached = self.artifacts.lock().await;
        let mut map = match cached.take() {
            Some(map) => map,
            None => self.fetch_artifacts().await?,
        };
        tracing::debug!(artifact_id = %artifact.artifact_id, "saving artifact");
        map.insert(artifact.artifact_id.clone(), artifact);
        let saved = self
            .retry
            .execute("state.save_artifacts", || {
                self.stores
                    .state
                    .save_artifacts(&self.key.user_id, &self.key.session_id, &map)
            })
            .await;
        *cached = Some(map);
        saved
    }

    async fn fetch_artifacts(&self) -> Result<ArtifactMap> {
        self.retry
            .execute("state.load_artifacts", || {
                self.stores
                    .state
                    .load_artifacts(&self.key.user_id, &self.key.session_id)
            })
            .await
    }

    /// Record the last LLM call's input tokens for the next turn's stage decision.
    pub async fn update_after_turn(&self, context_tokens: u64) -> Result<()> {
        let snapshot = {
            let mut state = self.agent_state.lock().await;
            state.last_llm_input_tokens = context_tokens;
            *state
        };
        self.retry
            .execute("state.save_agent_state", || {
                self.stores.state.save_agent_state(&self.key, &snapshot)
            })
            .await
    }

    /// Agent state, with the token count read through the state store.
    ///
    /// A fresh manager reports what the previous turn saved even before
    /// [`load_initial_context`](Self::load_initial_context) runs.
    pub async fn agent_state(&self) -> Result<AgentState> {
        let stored = self
            .retry
            .execute("state.load_agent_state", || {
                self.stores.state.load_agent_state(&self.key)
            })
            .await?;
        let mut state = self.agent_state.lock().await;
        if let Some(stored) = stored {
            state.last_llm_input_tokens = stored.last_llm_input_tokens;
        }
        Ok(*state)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
