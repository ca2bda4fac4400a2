//! In-process stores for tests and single-node deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    rank_summaries, AgentState, HistoryStore, SessionKey, StateStore, SummaryRecord, SummaryStore,
};
use crate::error::Result;
use crate::types::{ArtifactMap, Message};

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    logs: RwLock<HashMap<SessionKey, Vec<Message>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, key: &SessionKey, message: &Message) -> Result<()> {
        self.logs
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list(&self, key: &SessionKey, offset: usize, limit: usize) -> Result<Vec<Message>> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(key)
            .map(|log| log.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_all(&self, key: &SessionKey) -> Result<Vec<Message>> {
        Ok(self.logs.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn count(&self, key: &SessionKey) -> Result<usize> {
        Ok(self.logs.read().await.get(key).map_or(0, Vec::len))
    }
}

#[derive(Debug, Default)]
pub struct InMemorySummaryStore {
    summaries: RwLock<HashMap<(String, String), Vec<SummaryRecord>>>,
}

impl InMemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a digest, as the external memory service would.
    pub async fn insert(
        &self,
        user_id: &str,
        strategy_id: &str,
        text: impl Into<String>,
        relevance: f64,
    ) {
        self.summaries
            .write()
            .await
            .entry((user_id.to_string(), strategy_id.to_string()))
            .or_default()
            .push(SummaryRecord {
                text: text.into(),
                relevance,
            });
    }
}

#[async_trait]
impl SummaryStore for InMemorySummaryStore {
    async fn get_summaries(
        &self,
        user_id: &str,
        strategy_id: &str,
        top_k: usize,
        min_relevance: f64,
    ) -> Result<Vec<String>> {
        let records = self
            .summaries
            .read()
            .await
            .get(&(user_id.to_string(), strategy_id.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(rank_summaries(records, top_k, min_relevance))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    artifacts: RwLock<HashMap<(String, String), ArtifactMap>>,
    agents: RwLock<HashMap<SessionKey, AgentState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_artifacts(&self, user_id: &str, session_id: &str) -> Result<ArtifactMap> {
        Ok(self
            .artifacts
            .read()
            .await
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_artifacts(
        &self,
        user_id: &str,
        session_id: &str,
        artifacts: &ArtifactMap,
    ) -> Result<()> {
        self.artifacts
            .write()
            .await
            .insert((user_id.to_string(), session_id.to_string()), artifacts.clone());
        Ok(())
    }

    async fn load_agent_state(&self, key: &SessionKey) -> Result<Option<AgentState>> {
        Ok(self.agents.read().await.get(key).copied())
    }

    async fn save_agent_state(&self, key: &SessionKey, state: &AgentState) -> Result<()> {
        self.agents.write().await.insert(key.clone(), *state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_list_preserves_order_per_key() {
        let store = InMemoryHistoryStore::new();
        let key = SessionKey::new("u", "s", "text");
        let other = key.with_agent("voice");
        for i in 0..5 {
            store.append(&key, &Message::user(format!("m{i}"))).await.unwrap();
        }
        store.append(&other, &Message::user("elsewhere")).await.unwrap();

        let all = store.list_all(&key).await.unwrap();
        let texts: Vec<_> = all.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);

        let window = store.list(&key, 1, 2).await.unwrap();
        assert_eq!(window[0].text(), "m1");
        assert_eq!(window[1].text(), "m2");
        assert_eq!(store.count(&key).await.unwrap(), 5);
        assert_eq!(store.count(&other).await.unwrap(), 1);
    }
}
