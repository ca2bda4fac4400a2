//! Session manager against the file-backed stores.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use weft::config::RuntimeSettings;
use weft::history::SessionKey;
use weft::session::{SessionManager, SessionStores};
use weft::stop::{FileStopSignal, StopPoller, StopSignalProvider};
use weft::types::{Artifact, ContentBlock, Message, Role, ToolResult, ToolResultContent};

const TURNS: usize = 8;

fn key() -> SessionKey {
    SessionKey::new("u1", "s1", "text")
}

fn manager(dir: &TempDir) -> SessionManager {
    SessionManager::new(key(), SessionStores::file(dir.path()), &RuntimeSettings::default())
}

/// Four messages per turn: question, tool call, bulky result, answer.
async fn seed(session: &SessionManager) {
    for i in 0..TURNS {
        let id = format!("t{i}");
        let messages = [
            Message::user(format!("question {i}")),
            Message::new(
                Role::Assistant,
                vec![ContentBlock::tool_use(&id, "lookup", json!({"q": "x".repeat(1500)}))],
            ),
            Message::tool_results(vec![ToolResult::success(
                &id,
                vec![ToolResultContent::Text {
                    text: "r".repeat(2500),
                }],
            )]),
            Message::assistant(format!("answer {i}")),
        ];
        for message in &messages {
            session.append_message(message).await.unwrap();
        }
    }
}

fn result_text(message: &Message) -> String {
    match message.tool_result_blocks().next().map(|r| &r.content[0]) {
        Some(ToolResultContent::Text { text }) => text.clone(),
        other => panic!("expected text result, got {other:?}"),
    }
}

async fn write_summary(dir: &TempDir, text: &str) {
    let path = dir.path().join("u1").join("summaries").join("summary.jsonl");
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    let line = json!({"text": text, "relevance": 0.9}).to_string();
    tokio::fs::write(&path, format!("{line}\n")).await.unwrap();
}

#[tokio::test]
async fn small_context_loads_verbatim() {
    let dir = TempDir::new().unwrap();
    seed(&manager(&dir)).await;
    let session = manager(&dir);
    session.update_after_turn(10_000).await.unwrap();

    let loaded = manager(&dir).load_initial_context().await.unwrap();

    assert_eq!(loaded.len(), TURNS * 4);
    assert_eq!(result_text(&loaded[2]).len(), 2500);
}

#[tokio::test]
async fn mid_size_context_truncates_tool_payloads() {
    let dir = TempDir::new().unwrap();
    seed(&manager(&dir)).await;
    manager(&dir).update_after_turn(50_000).await.unwrap();

    let loaded = manager(&dir).load_initial_context().await.unwrap();

    assert_eq!(loaded.len(), TURNS * 4);
    let text = result_text(&loaded[2]);
    assert!(text.starts_with(&"r".repeat(1000)));
    assert!(text.ends_with("[truncated, 1500 chars removed]"));
    let input = &loaded[1].tool_uses().next().unwrap().input["q"];
    assert!(input.as_str().unwrap().contains("[truncated, 500 chars removed]"));
    // Answers are never touched.
    assert_eq!(loaded[3].text(), "answer 0");
}

#[tokio::test]
async fn large_context_checkpoints_with_summary_prefix() {
    let dir = TempDir::new().unwrap();
    seed(&manager(&dir)).await;
    write_summary(&dir, "The user has been researching tides.").await;
    manager(&dir).update_after_turn(150_000).await.unwrap();

    let session = manager(&dir);
    let loaded = session.load_initial_context().await.unwrap();

    // Summary plus the five most recent turns.
    assert_eq!(loaded.len(), 1 + 5 * 4);
    let summary = loaded[0].text();
    assert!(summary.starts_with("<conversation_summary>"));
    assert!(summary.contains("researching tides"));
    assert_eq!(loaded[1].text(), "question 3");
    assert!(result_text(&loaded[3]).contains("[truncated,"));
    assert_eq!(session.agent_state().await.unwrap().message_count_hint, TURNS * 4);
}

#[tokio::test]
async fn checkpoint_without_summaries_still_cuts_at_a_turn_boundary() {
    let dir = TempDir::new().unwrap();
    seed(&manager(&dir)).await;
    manager(&dir).update_after_turn(150_000).await.unwrap();

    let loaded = manager(&dir).load_initial_context().await.unwrap();

    assert_eq!(loaded.len(), 5 * 4);
    assert!(loaded[0].is_turn_boundary());
    assert_eq!(loaded[0].text(), "question 3");
}

#[tokio::test]
async fn unanswered_tool_use_is_repaired_on_load() {
    let dir = TempDir::new().unwrap();
    let session = manager(&dir);
    session.append_message(&Message::user("go")).await.unwrap();
    session
        .append_message(&Message::new(
            Role::Assistant,
            vec![ContentBlock::tool_use("t9", "lookup", json!({}))],
        ))
        .await
        .unwrap();

    let loaded = manager(&dir).load_initial_context().await.unwrap();

    assert_eq!(loaded.len(), 3);
    let repaired = loaded[2].tool_result_blocks().next().unwrap();
    assert_eq!(repaired.tool_use_id, "t9");
    assert!(repaired.is_error());
}

#[tokio::test]
async fn artifacts_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    manager(&dir)
        .save_artifact(Artifact::new("a1", "document", "Plan", "s3://bucket/plan.docx", "word_builder"))
        .await
        .unwrap();

    let artifacts = manager(&dir).artifacts().await.unwrap();

    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts["a1"].title, "Plan");
}

#[tokio::test]
async fn voice_history_is_visible_to_the_text_role() {
    let dir = TempDir::new().unwrap();
    let stores = SessionStores::file(dir.path());
    let voice = SessionManager::new(
        key().with_agent("voice"),
        stores.clone(),
        &RuntimeSettings::default(),
    );
    voice
        .append_turn(&Message::user("spoken question"), vec![ContentBlock::text("spoken answer")])
        .await
        .unwrap();

    let text = SessionManager::new(key(), stores, &RuntimeSettings::default());
    let injected = text.load_cross_role_history("voice").await.unwrap();

    assert_eq!(injected.len(), 2);
    assert_eq!(injected[1].text(), "spoken answer");
    assert!(text.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn file_stop_flag_is_shared_between_processes() {
    let dir = TempDir::new().unwrap();
    let writer = FileStopSignal::new(dir.path());
    let reader: Arc<dyn StopSignalProvider> = Arc::new(FileStopSignal::new(dir.path()));

    writer.request("u1", "s1").await.unwrap();
    let mut poller = StopPoller::new(reader.clone(), "u1", "s1", std::time::Duration::ZERO);

    assert!(poller.should_stop().await);
    assert!(!reader.is_requested("u1", "s1").await.unwrap());
}
