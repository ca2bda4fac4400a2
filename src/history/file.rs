//! File-backed stores.
//!
//! Layout under the base directory:
//!
//! ```text
//! <user>/<session>/<agent>.jsonl        message log, one JSON message per line
//! <user>/<session>/<agent>.state.json   agent state
//! <user>/<session>/artifacts.json       artifact map
//! <user>/summaries/<strategy>.jsonl     summary records
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{
    rank_summaries, AgentState, HistoryStore, SessionKey, StateStore, SummaryRecord, SummaryStore,
};
use crate::error::{Result, WeftError};
use crate::types::{ArtifactMap, Message};

/// Default base directory: `~/.weft/sessions`.
pub fn default_store_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".weft"))
        .unwrap_or_else(|| PathBuf::from(".weft"))
        .join("sessions")
}

#[derive(Debug)]
pub struct FileHistoryStore {
    base_dir: PathBuf,
    append_locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl FileHistoryStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    fn log_path(&self, key: &SessionKey) -> PathBuf {
        session_dir(&self.base_dir, &key.user_id, &key.session_id)
            .join(format!("{}.jsonl", path_label(&key.agent_id)))
    }

    async fn lock_for(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        self.append_locks
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drop the key's lock once no appender holds it.
    async fn release_lock(&self, key: &SessionKey) {
        let mut locks = self.append_locks.lock().await;
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    async fn read_log(&self, key: &SessionKey) -> Result<Vec<Message>> {
        let path = self.log_path(key);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&path, err)),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    WeftError::Store(format!("{} line {}: {e}", path.display(), n + 1))
                })
            })
            .collect()
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append(&self, key: &SessionKey, message: &Message) -> Result<()> {
        let path = self.log_path(key);
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let lock = self.lock_for(key).await;
        let written = {
            let _guard = lock.lock().await;
            append_line(&path, &line).await
        };
        drop(lock);
        self.release_lock(key).await;
        written
    }

    async fn list(&self, key: &SessionKey, offset: usize, limit: usize) -> Result<Vec<Message>> {
        let log = self.read_log(key).await?;
        Ok(log.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_all(&self, key: &SessionKey) -> Result<Vec<Message>> {
        self.read_log(key).await
    }

    async fn count(&self, key: &SessionKey) -> Result<usize> {
        let path = self.log_path(key);
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(raw.lines().filter(|line| !line.trim().is_empty()).count()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(io_error(&path, err)),
        }
    }
}

/// Reads summary records from `<user>/summaries/<strategy>.jsonl`.
#[derive(Debug, Clone)]
pub struct FileSummaryStore {
    base_dir: PathBuf,
}

impl FileSummaryStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn summary_path(&self, user_id: &str, strategy_id: &str) -> PathBuf {
        self.base_dir
            .join(path_label(user_id))
            .join("summaries")
            .join(format!("{}.jsonl", path_label(strategy_id)))
    }
}

#[async_trait]
impl SummaryStore for FileSummaryStore {
    async fn get_summaries(
        &self,
        user_id: &str,
        strategy_id: &str,
        top_k: usize,
        min_relevance: f64,
    ) -> Result<Vec<String>> {
        let path = self.summary_path(user_id, strategy_id);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&path, err)),
        };
        let records = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<SummaryRecord>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rank_summaries(records, top_k, min_relevance))
    }
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    base_dir: PathBuf,
}

impl FileStateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn artifacts_path(&self, user_id: &str, session_id: &str) -> PathBuf {
        session_dir(&self.base_dir, user_id, session_id).join("artifacts.json")
    }

    fn agent_state_path(&self, key: &SessionKey) -> PathBuf {
        session_dir(&self.base_dir, &key.user_id, &key.session_id)
            .join(format!("{}.state.json", path_label(&key.agent_id)))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_artifacts(&self, user_id: &str, session_id: &str) -> Result<ArtifactMap> {
        Ok(read_json(&self.artifacts_path(user_id, session_id))
            .await?
            .unwrap_or_default())
    }

    async fn save_artifacts(
        &self,
        user_id: &str,
        session_id: &str,
        artifacts: &ArtifactMap,
    ) -> Result<()> {
        write_json(&self.artifacts_path(user_id, session_id), artifacts).await
    }

    async fn load_agent_state(&self, key: &SessionKey) -> Result<Option<AgentState>> {
        read_json(&self.agent_state_path(key)).await
    }

    async fn save_agent_state(&self, key: &SessionKey, state: &AgentState) -> Result<()> {
        write_json(&self.agent_state_path(key), state).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path, err)),
    }
}

/// Write through a temp file and rename so readers never see a torn file.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path).await?;
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes).await.map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))?;
    Ok(())
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    ensure_parent(path).await?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_error(path, e))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| io_error(path, e))?;
    file.flush().await.map_err(|e| io_error(path, e))?;
    Ok(())
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    Ok(())
}

fn session_dir(base: &Path, user_id: &str, session_id: &str) -> PathBuf {
    base.join(path_label(user_id))
        .join(path_label(session_id))
}

/// Transient I/O conditions are retryable; everything else is permanent.
fn io_error(path: &Path, err: std::io::Error) -> WeftError {
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            WeftError::StoreUnavailable(format!("{}: {err}", path.display()))
        }
        _ => WeftError::Store(format!("{}: {err}", path.display())),
    }
}

/// Encode an id as a path component, injectively.
///
/// Ids made only of `[A-Za-z0-9_-]` are used as-is; anything else becomes
/// `~` followed by the unpadded URL-safe base64 of its bytes. `~` never
/// appears in a verbatim label, so distinct ids never share a path.
pub(crate) fn path_label(value: &str) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let verbatim = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if verbatim {
        value.to_string()
    } else {
        format!("~{}", URL_SAFE_NO_PAD.encode(value.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Artifact, ContentBlock, MediaSource, Role};
    use tempfile::TempDir;

    #[tokio::test]
    async fn log_survives_reopen_in_order() {
        let dir = TempDir::new().unwrap();
        let key = SessionKey::new("user@example.com", "s-1", "text");
        {
            let store = FileHistoryStore::new(dir.path());
            store.append(&key, &Message::user("first")).await.unwrap();
            store
                .append(
                    &key,
                    &Message::new(
                        Role::Assistant,
                        vec![ContentBlock::Image {
                            format: "png".into(),
                            source: MediaSource::Bytes(vec![1, 2, 3]),
                        }],
                    ),
                )
                .await
                .unwrap();
        }
        let store = FileHistoryStore::new(dir.path());
        let log = store.list_all(&key).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].text(), "first");
        assert!(matches!(
            &log[1].content[0],
            ContentBlock::Image { source: MediaSource::Bytes(b), .. } if b == &vec![1, 2, 3]
        ));
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileHistoryStore::new(dir.path()));
        let key = SessionKey::new("u", "s", "text");
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(&key, &Message::user(format!("msg-{i}")))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.count(&key).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn lookalike_user_ids_get_separate_logs() {
        let dir = TempDir::new().unwrap();
        let store = FileHistoryStore::new(dir.path());
        let owner = SessionKey::new("alice@corp", "s", "text");
        store.append(&owner, &Message::user("alice's secret")).await.unwrap();

        for other in ["alice.corp", "alice-corp", "alice_corp", " alice@corp"] {
            let key = SessionKey::new(other, "s", "text");
            assert!(store.list_all(&key).await.unwrap().is_empty(), "{other} sees the log");
        }
        assert_eq!(store.list_all(&owner).await.unwrap().len(), 1);
    }

    #[test]
    fn path_labels_are_injective_and_path_safe() {
        let ids = ["u1", "alice@corp", "alice.corp", "alice-corp", "..", "", "a/b", "a__b", "~"];
        let labels: Vec<String> = ids.iter().map(|id| path_label(id)).collect();
        let unique: std::collections::HashSet<&String> = labels.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(labels[0], "u1");
        for label in &labels {
            assert!(!label.contains('/') && !label.contains('.') && !label.is_empty());
        }
    }

    #[tokio::test]
    async fn idle_append_locks_are_released() {
        let dir = TempDir::new().unwrap();
        let store = FileHistoryStore::new(dir.path());
        for i in 0..5 {
            let key = SessionKey::new("u", format!("s{i}"), "text");
            store.append(&key, &Message::user("hi")).await.unwrap();
        }
        assert!(store.append_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileHistoryStore::new(dir.path());
        let key = SessionKey::new("u", "s", "text");
        assert!(store.list_all(&key).await.unwrap().is_empty());
        assert_eq!(store.count(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn artifacts_and_agent_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        let mut map = ArtifactMap::new();
        map.insert(
            "a1".into(),
            Artifact::new("a1", "document", "Q3 report", "s3://b/a1.docx", "word_builder"),
        );
        store.save_artifacts("u", "s", &map).await.unwrap();
        assert_eq!(store.load_artifacts("u", "s").await.unwrap(), map);
        assert!(store.load_artifacts("u", "other").await.unwrap().is_empty());

        let key = SessionKey::new("u", "s", "text");
        assert_eq!(store.load_agent_state(&key).await.unwrap(), None);
        let state = AgentState {
            last_llm_input_tokens: 42_000,
            message_count_hint: 12,
        };
        store.save_agent_state(&key, &state).await.unwrap();
        assert_eq!(store.load_agent_state(&key).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn summaries_read_from_jsonl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("u").join("summaries").join("summary.jsonl");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "{\"text\":\"older\",\"relevance\":0.2}\n{\"text\":\"newer\",\"relevance\":0.8}\n",
        )
        .unwrap();
        let store = FileSummaryStore::new(dir.path());
        let got = store.get_summaries("u", "summary", 5, 0.0).await.unwrap();
        assert_eq!(got, vec!["newer", "older"]);
    }
}
