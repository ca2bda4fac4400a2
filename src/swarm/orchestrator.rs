//! Runs one user turn through the swarm: coordinator first, hand-offs between
//! nodes, and a single responder that produces the answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::handoff::{handoff_tool, HandoffSlot, HandoffWindow, HANDOFF_TOOL_NAME};
use super::node::{NodeRole, NodeTools, SwarmDefinition, SwarmNode};
use crate::history::{SessionKey, SWARM_AGENT_ID};
use crate::runtime::RuntimeContext;
use crate::session::{repair_tool_pairing, SessionManager};
use crate::stop::StopPoller;
use crate::stream::{AgentEvent, EventSink, TurnState};
use crate::tools::{ToolSelection, TurnContext};
use crate::turn::prompt::compose_user_message;
use crate::turn::{save_partial_response, AgentLoop, AgentProfile, LoopOutcome, TurnOutcome, TurnRequest, TurnStatus};
use crate::types::{ContentBlock, InterruptResponse, Message, Role, ToolResultContent};

/// Instruction given to the responder when a limit cut the swarm short.
pub const LIMIT_REACHED_MESSAGE: &str = "limit reached — finalize";

/// What one node execution produced.
struct NodeRun {
    outcome: LoopOutcome,
    blocks: Vec<ContentBlock>,
    timed_out: bool,
}

impl NodeRun {
    fn status_label(&self) -> &'static str {
        match &self.outcome {
            _ if self.timed_out => "timed_out",
            LoopOutcome::Finished { .. } => "completed",
            LoopOutcome::HandedOff(_) => "handed_off",
            LoopOutcome::Interrupted => "interrupted",
            LoopOutcome::Stopped => "stopped",
            LoopOutcome::Cancelled => "cancelled",
            LoopOutcome::AuthRequired { .. } => "auth_required",
            LoopOutcome::Failed { .. } => "failed",
        }
    }

    fn text(&self) -> String {
        blocks_text(&self.blocks)
    }
}

fn blocks_text(blocks: &[ContentBlock]) -> String {
    Message::new(Role::Assistant, blocks.to_vec()).text()
}

/// One note per tool result a node received, hand-offs excluded.
fn tool_notes(node: &str, blocks: &[ContentBlock]) -> Vec<String> {
    let names: HashMap<&str, &str> = blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse(tu) => Some((tu.tool_use_id.as_str(), tu.name.as_str())),
            _ => None,
        })
        .collect();
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult(result) => Some(result),
            _ => None,
        })
        .filter_map(|result| {
            let name = names.get(result.tool_use_id.as_str()).copied().unwrap_or("tool");
            if name == HANDOFF_TOOL_NAME {
                return None;
            }
            let body: Vec<String> = result.content.iter().map(render_tool_content).collect();
            let verb = if result.is_error() { "failed" } else { "returned" };
            Some(format!(
                "[{node}] {name} ({}) {verb}: {}",
                result.tool_use_id,
                body.join("\n")
            ))
        })
        .collect()
}

fn render_tool_content(content: &ToolResultContent) -> String {
    match content {
        ToolResultContent::Text { text } => text.clone(),
        ToolResultContent::Json { json } => json.to_string(),
        ToolResultContent::Image { format, .. } => format!("[{format} image]"),
        ToolResultContent::Document { name, .. } => format!("[document {name}]"),
    }
}

struct Orchestrator<'a> {
    runtime: &'a RuntimeContext,
    definition: &'a SwarmDefinition,
    request: &'a TurnRequest,
    turn: TurnContext,
    session: SessionManager,
    enabled: ToolSelection,
    sink: &'a EventSink,
    slot: Arc<HandoffSlot>,
}

impl Orchestrator<'_> {
    fn node_tools(&self, node: &SwarmNode) -> ToolSelection {
        let selection = match (node.role, &node.tools) {
            (NodeRole::Coordinator, _) | (_, NodeTools::None) => ToolSelection::default(),
            (_, NodeTools::All) => self.enabled.clone(),
            (_, NodeTools::Only(names)) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                self.enabled.clone().only(&names)
            }
        };
        if node.role == NodeRole::Responder {
            selection
        } else {
            selection.with(handoff_tool(self.definition, &node.name, self.slot.clone()))
        }
    }

    fn node_profile(&self, node: &SwarmNode) -> AgentProfile {
        AgentProfile {
            model_id: self
                .request
                .model_id
                .clone()
                .unwrap_or_else(|| node.profile.model_id.clone()),
            temperature: self.request.temperature.or(node.profile.temperature),
            ..node.profile.clone()
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_node(
        &self,
        node: &SwarmNode,
        mut messages: Vec<Message>,
        interrupt_responses: Vec<InterruptResponse>,
        state: &mut TurnState,
        stop: &mut StopPoller,
        cancel: &CancellationToken,
        budget: Duration,
    ) -> NodeRun {
        // A node that timed out mid-batch may have left a request behind.
        self.slot.take().await;

        let settings = self.runtime.settings();
        let tools = self.node_tools(node);
        let profile = self.node_profile(node);
        let agent = AgentLoop {
            llm: self.runtime.llm(),
            profile: &profile,
            tools: &tools,
            turn: &self.turn,
            session: &self.session,
            sink: self.sink,
            http: self.runtime.http(),
            retry: settings.retry_policy(),
            max_rounds: settings.turn.max_tool_rounds,
            persist: false,
            handoff: Some(self.slot.as_ref()),
        };

        let node_cancel = cancel.child_token();
        let mut blocks = Vec::new();
        let mut timed_out = false;
        let outcome = {
            let run = agent.run(
                &mut messages,
                interrupt_responses,
                state,
                stop,
                &node_cancel,
                &mut blocks,
            );
            tokio::pin!(run);
            tokio::select! {
                outcome = &mut run => outcome,
                _ = tokio::time::sleep(budget) => {
                    tracing::warn!(node = %node.name, ?budget, "swarm node timed out");
                    timed_out = true;
                    node_cancel.cancel();
                    run.await
                }
            }
        };

        NodeRun {
            outcome,
            blocks,
            timed_out,
        }
    }
}

/// The context a node starts from: the turn's base messages plus what earlier
/// nodes said and shared.
fn node_context(base: &[Message], notes: &[String], shared: &Map<String, Value>, limit_reached: bool) -> Vec<Message> {
    let mut messages = base.to_vec();
    if !notes.is_empty() || !shared.is_empty() {
        let mut text = String::from("<swarm_context>\n");
        for note in notes {
            text.push_str(note);
            text.push('\n');
        }
        if !shared.is_empty() {
            text.push_str("Shared context: ");
            text.push_str(&Value::Object(shared.clone()).to_string());
            text.push('\n');
        }
        text.push_str("</swarm_context>");
        messages.push(Message::user(text));
    }
    if limit_reached {
        messages.push(Message::user(LIMIT_REACHED_MESSAGE));
    }
    messages
}

/// How the node loop ended.
enum SwarmEnd {
    Answered(Vec<ContentBlock>),
    /// No responder output; answer with the last non-responder text.
    Fallback,
    Interrupted(Vec<ContentBlock>),
    Stopped,
    Cancelled,
    AuthRequired { tool_name: String, auth_url: String },
    Failed(String),
}

/// Run one swarm turn.
pub async fn run_swarm_turn(
    runtime: &RuntimeContext,
    definition: &SwarmDefinition,
    request: TurnRequest,
    sink: &EventSink,
) -> TurnOutcome {
    run_swarm_turn_with_cancel(runtime, definition, request, sink, CancellationToken::new()).await
}

/// [`run_swarm_turn`] with an external cancellation token.
pub async fn run_swarm_turn_with_cancel(
    runtime: &RuntimeContext,
    definition: &SwarmDefinition,
    mut request: TurnRequest,
    sink: &EventSink,
    cancel: CancellationToken,
) -> TurnOutcome {
    let settings = runtime.settings();
    let limits = &settings.swarm;
    tracing::info!(
        user_id = %request.user_id,
        session_id = %request.session_id,
        nodes = definition.nodes().len(),
        "swarm turn started"
    );
    sink.emit(AgentEvent::Init {
        session_id: request.session_id.clone(),
        agent_id: SWARM_AGENT_ID.to_string(),
    })
    .await;

    let session = runtime.session(SessionKey::new(
        &request.user_id,
        &request.session_id,
        SWARM_AGENT_ID,
    ));
    let mut base = match session.list_all().await {
        Ok(history) => repair_tool_pairing(history),
        Err(e) => {
            let error = format!("failed to load swarm history: {e}");
            tracing::error!(error = %error, "swarm turn failed");
            sink.emit(AgentEvent::Error {
                message: error.clone(),
            })
            .await;
            return TurnOutcome::failed(error);
        }
    };
    let user = (!request.is_resume())
        .then(|| compose_user_message(&request.message, &request.files, &settings.prompt));
    if let Some(user) = &user {
        base.push(user.clone());
    }

    let mut interrupts = std::mem::take(&mut request.interrupt_responses);
    let orchestrator = Orchestrator {
        runtime,
        definition,
        request: &request,
        turn: request.turn_context(),
        session,
        enabled: runtime.registry().filter(request.enabled_tools.as_deref()),
        sink,
        slot: Arc::new(HandoffSlot::new()),
    };

    let responder = definition.responder().name.clone();
    let mut current = definition.coordinator().name.clone();
    let mut notes: Vec<String> = Vec::new();
    let mut shared_context = Map::new();
    let mut window = HandoffWindow::new(
        limits.repetitive_handoff_detection_window,
        limits.repetitive_handoff_min_unique_agents,
    );
    let mut handoffs = 0usize;
    let mut iterations = 0usize;
    let mut limit_reached = false;
    let mut fallback_text = String::new();
    let mut state = TurnState::new();
    let mut stop = runtime.stop_poller(&request.user_id, &request.session_id);
    let started = Instant::now();

    let end = loop {
        let at_responder = current == responder;
        let remaining = limits.execution_timeout().saturating_sub(started.elapsed());
        if !at_responder && (iterations >= limits.max_iterations || remaining.is_zero()) {
            tracing::warn!(iterations, elapsed = ?started.elapsed(), "swarm limit reached, finalizing");
            current = responder.clone();
            limit_reached = true;
            continue;
        }
        if remaining.is_zero() {
            tracing::warn!("swarm execution time exhausted before the responder ran");
            break SwarmEnd::Fallback;
        }
        let Some(node) = definition.node(&current) else {
            break SwarmEnd::Failed(format!("unknown swarm node '{current}'"));
        };
        iterations += 1;

        sink.emit(AgentEvent::SwarmNodeStart {
            node: node.name.clone(),
        })
        .await;
        let messages = node_context(&base, &notes, &shared_context, limit_reached && at_responder);
        let run = orchestrator
            .run_node(
                node,
                messages,
                std::mem::take(&mut interrupts),
                &mut state,
                &mut stop,
                &cancel,
                remaining.min(limits.node_timeout()),
            )
            .await;
        sink.emit(AgentEvent::SwarmNodeStop {
            node: node.name.clone(),
            status: run.status_label().to_string(),
        })
        .await;

        if !at_responder {
            notes.extend(tool_notes(&node.name, &run.blocks));
        }
        let text = run.text();
        if !at_responder && !text.is_empty() {
            fallback_text = text.clone();
            notes.push(format!("[{}] {}", node.name, text));
        }

        match run.outcome {
            LoopOutcome::HandedOff(handoff) => {
                handoffs += 1;
                tracing::info!(from = %node.name, to = %handoff.target_node, handoffs, "swarm hand-off");
                sink.emit(AgentEvent::SwarmHandoff {
                    from: node.name.clone(),
                    to: handoff.target_node.clone(),
                    message: handoff.message.clone(),
                    context: handoff.context.clone(),
                })
                .await;
                notes.push(format!(
                    "{} handed off to {}: {}",
                    node.name, handoff.target_node, handoff.message
                ));
                if let Some(context) = handoff.context {
                    shared_context.insert(node.name.clone(), context);
                }

                window.record(&node.name, &handoff.target_node);
                if window.is_repetitive() {
                    tracing::warn!(node = %node.name, "repetitive hand-offs detected, finalizing");
                    limit_reached = true;
                    current = responder.clone();
                } else if handoffs >= limits.max_handoffs {
                    tracing::warn!(handoffs, "hand-off limit reached, finalizing");
                    limit_reached = true;
                    current = responder.clone();
                } else {
                    current = handoff.target_node;
                }
            }
            LoopOutcome::Finished { .. } if at_responder => break SwarmEnd::Answered(run.blocks),
            LoopOutcome::Finished { .. } => {
                tracing::info!(node = %node.name, "node finished without a hand-off");
                break SwarmEnd::Fallback;
            }
            LoopOutcome::Cancelled if run.timed_out && !cancel.is_cancelled() => {
                if at_responder {
                    break if text.is_empty() {
                        SwarmEnd::Fallback
                    } else {
                        SwarmEnd::Answered(vec![ContentBlock::text(text)])
                    };
                }
                limit_reached = true;
                current = responder.clone();
            }
            LoopOutcome::Cancelled => break SwarmEnd::Cancelled,
            LoopOutcome::Stopped => break SwarmEnd::Stopped,
            LoopOutcome::Interrupted => break SwarmEnd::Interrupted(run.blocks),
            LoopOutcome::AuthRequired {
                tool_name,
                auth_url,
            } => {
                break SwarmEnd::AuthRequired {
                    tool_name,
                    auth_url,
                }
            }
            LoopOutcome::Failed { error } => break SwarmEnd::Failed(error),
        }
    };

    let session = &orchestrator.session;
    let usage = state.accumulated_usage;
    let (status, message) = match end {
        SwarmEnd::Answered(blocks) => {
            let mut text = blocks_text(&blocks);
            let blocks = if text.is_empty() {
                text = fallback_text;
                vec![ContentBlock::text(text.clone())]
            } else {
                blocks
            };
            persist_turn(session, user.as_ref(), blocks).await;
            sink.emit(AgentEvent::Complete {
                message: text.clone(),
                images: state.images.clone(),
                usage: (!usage.is_empty()).then_some(usage),
            })
            .await;
            (TurnStatus::Completed, Some(text))
        }
        SwarmEnd::Fallback => {
            persist_turn(session, user.as_ref(), vec![ContentBlock::text(fallback_text.clone())]).await;
            sink.emit(AgentEvent::Complete {
                message: fallback_text.clone(),
                images: state.images.clone(),
                usage: (!usage.is_empty()).then_some(usage),
            })
            .await;
            (TurnStatus::Completed, Some(fallback_text))
        }
        SwarmEnd::Interrupted(blocks) => {
            persist_turn(session, user.as_ref(), blocks).await;
            (TurnStatus::Interrupted, None)
        }
        SwarmEnd::Stopped => {
            persist_turn(session, user.as_ref(), Vec::new()).await;
            save_partial_response(session, &state).await;
            sink.emit(AgentEvent::Complete {
                message: crate::turn::STOPPED_MESSAGE.to_string(),
                images: Vec::new(),
                usage: None,
            })
            .await;
            (TurnStatus::Stopped, None)
        }
        SwarmEnd::Cancelled => {
            persist_turn(session, user.as_ref(), Vec::new()).await;
            save_partial_response(session, &state).await;
            (TurnStatus::Cancelled, None)
        }
        SwarmEnd::AuthRequired {
            tool_name,
            auth_url,
        } => {
            persist_turn(session, user.as_ref(), Vec::new()).await;
            (
                TurnStatus::AuthRequired {
                    tool_name,
                    auth_url,
                },
                None,
            )
        }
        SwarmEnd::Failed(error) => {
            persist_turn(session, user.as_ref(), Vec::new()).await;
            (TurnStatus::Failed { error }, None)
        }
    };

    if state.last_llm_input_tokens > 0 {
        if let Err(e) = session.update_after_turn(state.last_llm_input_tokens).await {
            tracing::warn!(error = %e, "failed to record swarm context size");
        }
    }
    tracing::info!(key = %session.key(), ?status, handoffs, iterations, "swarm turn finished");
    TurnOutcome {
        status,
        message,
        usage,
        last_llm_input_tokens: state.last_llm_input_tokens,
    }
}

/// Write the user message and the assembled answer to the swarm log.
async fn persist_turn(session: &SessionManager, user: Option<&Message>, blocks: Vec<ContentBlock>) {
    let result = match user {
        Some(user) => session.append_turn(user, blocks).await,
        None if blocks.is_empty() => Ok(()),
        None => session
            .append_message(&Message::new(Role::Assistant, blocks))
            .await,
    };
    if let Err(e) = result {
        tracing::error!(key = %session.key(), error = %e, "failed to persist swarm turn");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn first_node_sees_only_the_base_context() {
        let base = vec![Message::user("hello")];
        let messages = node_context(&base, &[], &Map::new(), false);
        assert_eq!(messages, base);
    }

    #[test]
    fn later_nodes_see_notes_shared_context_and_limit() {
        let base = vec![Message::user("hello")];
        let mut shared = Map::new();
        shared.insert("coordinator".into(), json!({"topic": "tides"}));
        let notes = vec!["coordinator handed off to researcher: check tides".to_string()];
        let messages = node_context(&base, &notes, &shared, true);

        assert_eq!(messages.len(), 3);
        let context = messages[1].text();
        assert!(context.starts_with("<swarm_context>"));
        assert!(context.contains("check tides"));
        assert!(context.contains(r#""topic":"tides""#));
        assert_eq!(messages[2].text(), LIMIT_REACHED_MESSAGE);
    }

    #[test]
    fn tool_results_become_notes_but_handoffs_do_not() {
        let blocks = vec![
            ContentBlock::tool_use("t1", "lookup", json!({"q": "tide"})),
            ContentBlock::tool_use("h1", HANDOFF_TOOL_NAME, json!({"target_node": "responder"})),
            ContentBlock::ToolResult(crate::types::ToolResult::success(
                "t1",
                vec![
                    ToolResultContent::Text { text: "high tide at noon".into() },
                    ToolResultContent::Json { json: json!({"height_m": 4.2}) },
                ],
            )),
            ContentBlock::ToolResult(crate::types::ToolResult::success(
                "h1",
                vec![ToolResultContent::Text { text: "Handing off to responder".into() }],
            )),
        ];

        let notes = tool_notes("researcher", &blocks);

        assert_eq!(
            notes,
            vec!["[researcher] lookup (t1) returned: high tide at noon\n{\"height_m\":4.2}".to_string()]
        );
    }
}
