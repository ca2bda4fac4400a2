use std::collections::HashSet;

use serde_json::Value;

use crate::config::CompactionSettings;
use crate::types::{ContentBlock, Message, Role, ToolResult, ToolResultContent};

const SUMMARY_OPEN: &str = "<conversation_summary>";
const SUMMARY_CLOSE: &str = "</conversation_summary>";
const SUMMARY_CONTINUATION: &str = "The summary above covers the earlier part of this conversation. \
Continue from the most recent messages below without repeating the summary.";

/// Error text recorded for a tool use whose result never reached the log.
pub const MISSING_RESULT_TEXT: &str = "Tool result missing: the call was interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CompactionStage {
    /// Load everything untouched.
    Full,
    /// Load everything, truncating tool payloads.
    Truncate,
    /// Replace old turns with stored summaries.
    Checkpoint,
}

/// Pick a stage from the previous turn's context size. Thresholds are exclusive.
pub fn decide_stage(last_llm_input_tokens: u64, settings: &CompactionSettings) -> CompactionStage {
    if last_llm_input_tokens > settings.token_threshold {
        CompactionStage::Checkpoint
    } else if last_llm_input_tokens > settings.truncation_threshold_tokens {
        CompactionStage::Truncate
    } else {
        CompactionStage::Full
    }
}

/// Shorten `text` to `max` characters plus a marker, or `None` if it fits.
pub fn truncate_text(text: &str, max: usize) -> Option<String> {
    let total = text.chars().count();
    if total <= max {
        return None;
    }
    let prefix: String = text.chars().take(max).collect();
    Some(format!("{prefix}[truncated, {} chars removed]", total - max))
}

fn truncate_strings(value: &mut Value, max: usize) -> usize {
    match value {
        Value::String(s) => match truncate_text(s, max) {
            Some(short) => {
                *s = short;
                1
            }
            None => 0,
        },
        Value::Array(items) => items.iter_mut().map(|v| truncate_strings(v, max)).sum(),
        Value::Object(map) => map.values_mut().map(|v| truncate_strings(v, max)).sum(),
        _ => 0,
    }
}

fn truncate_result(result: &mut ToolResult, max: usize) -> usize {
    let mut count = 0;
    for item in &mut result.content {
        match item {
            ToolResultContent::Text { text } => {
                if let Some(short) = truncate_text(text, max) {
                    *text = short;
                    count += 1;
                }
            }
            ToolResultContent::Json { json } => {
                let raw = json.to_string();
                if let Some(short) = truncate_text(&raw, max) {
                    *item = ToolResultContent::Text { text: short };
                    count += 1;
                }
            }
            ToolResultContent::Image { .. } | ToolResultContent::Document { .. } => {}
        }
    }
    count
}

/// Stage-1 truncation of tool inputs and tool results. Returns the number of
/// fields shortened.
///
/// Tool inputs stay JSON objects: only their long string leaves are cut.
/// An oversized JSON result becomes a truncated text block.
pub fn truncate_tool_content(messages: &mut [Message], max: usize) -> usize {
    let mut count = 0;
    for message in messages.iter_mut() {
        for block in &mut message.content {
            match block {
                ContentBlock::ToolUse(tu) => count += truncate_strings(&mut tu.input, max),
                ContentBlock::ToolResult(result) => count += truncate_result(result, max),
                _ => {}
            }
        }
    }
    count
}

/// Indices of user messages that start a turn.
pub fn turn_boundaries(messages: &[Message]) -> Vec<usize> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_turn_boundary())
        .map(|(i, _)| i)
        .collect()
}

/// Index where older history may be cut without orphaning a tool pair.
///
/// Returns 0 when fewer than `min_recent_turns + 1` turns exist. Otherwise the
/// cut keeps the last `recent_turns` turns, but never fewer than
/// `min_recent_turns`.
pub fn find_safe_cutoff(messages: &[Message], recent_turns: usize, min_recent_turns: usize) -> usize {
    let boundaries = turn_boundaries(messages);
    let n = boundaries.len();
    if n <= min_recent_turns {
        return 0;
    }
    let keep = recent_turns.max(min_recent_turns).clamp(1, n);
    boundaries[n - keep]
}

/// Synthetic first user message carrying prior summaries.
pub fn build_summary_message(summaries: &[String]) -> Message {
    let body = summaries.join("\n\n");
    Message::user(format!(
        "{SUMMARY_OPEN}\n{body}\n{SUMMARY_CLOSE}\n\n{SUMMARY_CONTINUATION}"
    ))
}

/// Restore tool pairing in a loaded log.
///
/// Tool results recorded inside assistant messages are moved into a user
/// message right after it. Results without a preceding tool use are dropped,
/// and tool uses left unanswered get an error result.
pub fn repair_tool_pairing(messages: Vec<Message>) -> Vec<Message> {
    let mut split = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == Role::Assistant && message.has_tool_result() {
            split.extend(split_assistant_results(message));
        } else {
            split.push(message);
        }
    }

    let mut repaired: Vec<Message> = Vec::with_capacity(split.len());
    let mut open: Vec<String> = Vec::new();
    let mut dropped = 0usize;
    let mut synthesized = 0usize;

    for mut message in split {
        match message.role {
            Role::Assistant => {
                if !open.is_empty() {
                    synthesized += open.len();
                    repaired.push(missing_results(&mut open));
                }
                open.extend(message.tool_uses().map(|tu| tu.tool_use_id.clone()));
                repaired.push(message);
            }
            Role::User => {
                let answerable: HashSet<String> = open.iter().cloned().collect();
                let before = message.content.len();
                message.content.retain(|block| match block {
                    ContentBlock::ToolResult(r) => answerable.contains(&r.tool_use_id),
                    _ => true,
                });
                dropped += before - message.content.len();

                let answered: HashSet<&str> = message
                    .tool_result_blocks()
                    .map(|r| r.tool_use_id.as_str())
                    .collect();
                let unanswered: Vec<String> = open
                    .iter()
                    .filter(|id| !answered.contains(id.as_str()))
                    .cloned()
                    .collect();
                if !unanswered.is_empty() {
                    synthesized += unanswered.len();
                    let fillers = unanswered
                        .iter()
                        .map(|id| ContentBlock::ToolResult(ToolResult::error(id, MISSING_RESULT_TEXT)));
                    let mut content: Vec<ContentBlock> = fillers.collect();
                    content.append(&mut message.content);
                    message.content = content;
                }
                open.clear();
                if !message.content.is_empty() {
                    repaired.push(message);
                }
            }
        }
    }
    if !open.is_empty() {
        synthesized += open.len();
        repaired.push(missing_results(&mut open));
    }

    if dropped > 0 || synthesized > 0 {
        tracing::debug!(dropped, synthesized, "repaired tool pairing");
    }
    repaired
}

fn missing_results(open: &mut Vec<String>) -> Message {
    let results = open
        .drain(..)
        .map(|id| ToolResult::error(id, MISSING_RESULT_TEXT))
        .collect();
    Message::tool_results(results)
}

/// Split an assistant message with inline results into alternating
/// assistant and user messages, keeping block order.
fn split_assistant_results(message: Message) -> Vec<Message> {
    let timestamp = message.timestamp;
    let mut out: Vec<Message> = Vec::new();
    let mut current: Vec<ContentBlock> = Vec::new();
    let mut current_role = Role::Assistant;

    for block in message.content {
        let role = if matches!(block, ContentBlock::ToolResult(_)) {
            Role::User
        } else {
            Role::Assistant
        };
        if role != current_role && !current.is_empty() {
            out.push(Message {
                role: current_role,
                content: std::mem::take(&mut current),
                timestamp,
            });
        }
        current_role = role;
        current.push(block);
    }
    if !current.is_empty() {
        out.push(Message {
            role: current_role,
            content: current,
            timestamp,
        });
    }
    out
}

/// Merge adjacent messages with the same role.
pub fn normalize_roles(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match out.last_mut() {
            Some(last) if last.role == message.role => last.content.extend(message.content),
            _ => out.push(message),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentBlock, ToolStatus};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tool_use(id: &str) -> Message {
        Message::new(
            Role::Assistant,
            vec![ContentBlock::tool_use(id, "search", json!({"q": "x"}))],
        )
    }

    fn tool_result(id: &str, text: &str) -> Message {
        Message::tool_results(vec![ToolResult::success(
            id,
            vec![ToolResultContent::Text { text: text.into() }],
        )])
    }

    #[test]
    fn stages_use_strict_thresholds() {
        let settings = CompactionSettings::default();
        assert_eq!(decide_stage(0, &settings), CompactionStage::Full);
        assert_eq!(decide_stage(15_000, &settings), CompactionStage::Full);
        assert_eq!(decide_stage(20_000, &settings), CompactionStage::Full);
        assert_eq!(decide_stage(20_001, &settings), CompactionStage::Truncate);
        assert_eq!(decide_stage(100_000, &settings), CompactionStage::Truncate);
        assert_eq!(decide_stage(100_001, &settings), CompactionStage::Checkpoint);
    }

    #[test]
    fn long_tool_result_text_is_truncated() {
        let mut messages = vec![tool_use("t1"), tool_result("t1", &"a".repeat(2000))];
        assert_eq!(truncate_tool_content(&mut messages, 1000), 1);
        let result = messages[1].tool_result_blocks().next().unwrap();
        let ToolResultContent::Text { text } = &result.content[0] else {
            panic!("expected text");
        };
        assert_eq!(text, &format!("{}[truncated, 1000 chars removed]", "a".repeat(1000)));
        assert!(text.len() < 2000);
    }

    #[test]
    fn tool_input_keeps_object_shape() {
        let mut messages = vec![Message::new(
            Role::Assistant,
            vec![ContentBlock::tool_use(
                "t1",
                "write",
                json!({"body": "x".repeat(30), "n": 3}),
            )],
        )];
        truncate_tool_content(&mut messages, 10);
        let input = &messages[0].tool_uses().next().unwrap().input;
        assert_eq!(input["n"], json!(3));
        assert_eq!(input["body"], json!("xxxxxxxxxx[truncated, 20 chars removed]"));
    }

    #[test]
    fn plain_text_is_never_truncated() {
        let mut messages = vec![Message::user("y".repeat(5000))];
        assert_eq!(truncate_tool_content(&mut messages, 10), 0);
    }

    #[test]
    fn cutoff_lands_on_user_text_after_tool_chain() {
        let messages = vec![
            Message::user("first"),
            tool_use("t1"),
            tool_result("t1", "found"),
            Message::assistant("answer"),
            Message::user("second"),
            Message::assistant("answer 2"),
        ];
        assert_eq!(find_safe_cutoff(&messages, 1, 1), 4);
    }

    #[test]
    fn cutoff_is_zero_when_too_few_turns() {
        let messages = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
        ];
        assert_eq!(find_safe_cutoff(&messages, 5, 3), 0);
        assert_eq!(find_safe_cutoff(&[], 5, 3), 0);
    }

    #[test]
    fn cutoff_keeps_at_least_min_recent_turns() {
        let messages: Vec<Message> = (0..6)
            .flat_map(|i| [Message::user(format!("q{i}")), Message::assistant(format!("a{i}"))])
            .collect();
        // recent_turns below the minimum is clamped up to it.
        assert_eq!(find_safe_cutoff(&messages, 1, 3), 6);
        assert_eq!(find_safe_cutoff(&messages, 2, 1), 8);
        let cut = find_safe_cutoff(&messages, 5, 3);
        assert!(messages[cut].is_turn_boundary());
        assert_eq!(cut, 2);
    }

    #[test]
    fn summary_message_wraps_summaries() {
        let message = build_summary_message(&["one".into(), "two".into()]);
        assert_eq!(message.role, Role::User);
        let text = message.text();
        assert!(text.starts_with("<conversation_summary>\none\n\ntwo\n</conversation_summary>"));
    }

    #[test]
    fn orphan_results_dropped_and_missing_results_synthesized() {
        let messages = vec![
            Message::user("hi"),
            tool_result("ghost", "stale"),
            tool_use("t1"),
            Message::user("next question"),
        ];
        let repaired = repair_tool_pairing(messages);
        assert_eq!(repaired.len(), 3);
        let results: Vec<_> = repaired[2].tool_result_blocks().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_use_id, "t1");
        assert_eq!(results[0].status, ToolStatus::Error);
        assert_eq!(repaired[2].text(), "next question");
    }

    #[test]
    fn trailing_tool_use_gets_a_result() {
        let repaired = repair_tool_pairing(vec![Message::user("go"), tool_use("t9")]);
        assert_eq!(repaired.len(), 3);
        assert!(repaired[2].has_tool_result());
    }

    #[test]
    fn inline_results_are_split_out_of_assistant_messages() {
        let assembled = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("let me check"),
                ContentBlock::tool_use("t1", "search", json!({})),
                ContentBlock::ToolResult(ToolResult::error("t1", "boom")),
                ContentBlock::text("done"),
            ],
        );
        let repaired = repair_tool_pairing(vec![Message::user("q"), assembled]);
        let roles: Vec<Role> = repaired.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(repaired[3].text(), "done");
    }

    #[test]
    fn adjacent_roles_merge() {
        let merged = normalize_roles(vec![
            Message::user("summary"),
            Message::user("question"),
            Message::assistant("answer"),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content.len(), 2);
    }
}
