//! One user turn: compose, load, loop LLM calls and tool batches, finalize.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::prompt::compose_user_message;
use crate::history::SessionKey;
use crate::llm::{CacheConfig, LlmProvider, LlmRequest};
use crate::runtime::RuntimeContext;
use crate::session::{normalize_roles, SessionManager};
use crate::stop::StopPoller;
use crate::stream::{AgentEvent, EventProcessor, EventSink, StreamOutcome, TurnState};
use crate::swarm::{Handoff, HandoffSlot};
use crate::tools::{DispatchStatus, ToolDispatcher, ToolSelection, TurnContext};
use crate::types::{ContentBlock, InterruptResponse, Message, Role, ToolResult, ToolUse, UploadedFile, Usage};
use crate::util::retry::RetryPolicy;

/// Agent id used when a request does not name one.
pub const DEFAULT_AGENT_ID: &str = "text";

/// Marker appended to a partial answer saved after a stop.
pub const INTERRUPTED_MARKER: &str = "\n\n[Response interrupted by user]";

/// Final `complete` text after a stop.
pub const STOPPED_MESSAGE: &str = "Stream stopped by user";

/// Model-facing configuration of one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, bon::Builder)]
#[builder(on(String, into))]
pub struct AgentProfile {
    #[builder(default)]
    pub system_prompt: String,
    #[builder(default)]
    pub model_id: String,
    pub temperature: Option<f32>,
    pub cache_config: Option<CacheConfig>,
}

/// A caller's request for one turn.
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
#[builder(on(String, into))]
pub struct TurnRequest {
    pub user_id: String,
    pub session_id: String,
    #[serde(default = "default_agent_id")]
    #[builder(default = DEFAULT_AGENT_ID.to_string())]
    pub agent_id: String,
    #[serde(default)]
    #[builder(default)]
    pub message: String,
    #[serde(default)]
    #[builder(default)]
    pub files: Vec<UploadedFile>,
    /// `None` enables every registered tool.
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
    #[serde(default)]
    #[builder(default)]
    pub api_keys: HashMap<String, String>,
    #[serde(default)]
    pub selected_artifact_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Answers to the interrupts that paused the previous turn.
    #[serde(default)]
    #[builder(default)]
    pub interrupt_responses: Vec<InterruptResponse>,
}

fn default_agent_id() -> String {
    DEFAULT_AGENT_ID.to_string()
}

impl TurnRequest {
    /// A continuation that only carries interrupt answers.
    pub fn is_resume(&self) -> bool {
        self.message.trim().is_empty()
            && self.files.is_empty()
            && !self.interrupt_responses.is_empty()
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.user_id, &self.session_id, &self.agent_id)
    }

    pub fn turn_context(&self) -> TurnContext {
        TurnContext {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            model_id: self.model_id.clone().unwrap_or_default(),
            api_keys: self.api_keys.clone(),
            selected_artifact_id: self.selected_artifact_id.clone(),
            uploaded_files: self.files.clone(),
        }
    }

    /// `base` with this request's overrides applied.
    pub fn profile(&self, base: &AgentProfile) -> AgentProfile {
        AgentProfile {
            system_prompt: self
                .system_prompt
                .clone()
                .unwrap_or_else(|| base.system_prompt.clone()),
            model_id: self.model_id.clone().unwrap_or_else(|| base.model_id.clone()),
            temperature: self.temperature.or(base.temperature),
            cache_config: base.cache_config.clone(),
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Interrupted,
    Stopped,
    Cancelled,
    AuthRequired { tool_name: String, auth_url: String },
    Failed { error: String },
}

/// Summary returned to the caller alongside the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Final answer text, when there is one.
    pub message: Option<String>,
    pub usage: Usage,
    pub last_llm_input_tokens: u64,
}

impl TurnOutcome {
    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TurnStatus::Failed {
                error: error.into(),
            },
            message: None,
            usage: Usage::default(),
            last_llm_input_tokens: 0,
        }
    }
}

/// Why the agent loop returned.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LoopOutcome {
    Finished { message: Message },
    Interrupted,
    Stopped,
    Cancelled,
    AuthRequired { tool_name: String, auth_url: String },
    HandedOff(Handoff),
    Failed { error: String },
}

/// The LLM call / tool batch loop shared by single-agent turns and swarm nodes.
pub(crate) struct AgentLoop<'a> {
    pub llm: &'a dyn LlmProvider,
    pub profile: &'a AgentProfile,
    pub tools: &'a ToolSelection,
    pub turn: &'a TurnContext,
    pub session: &'a SessionManager,
    pub sink: &'a EventSink,
    pub http: &'a reqwest::Client,
    pub retry: RetryPolicy,
    pub max_rounds: usize,
    /// Write assistant and tool-result messages to the session log.
    pub persist: bool,
    pub handoff: Option<&'a HandoffSlot>,
}

impl AgentLoop<'_> {
    /// Drive LLM calls until a final answer or a terminal condition.
    ///
    /// `messages` is the running context; `transcript` receives every observed
    /// block (assistant content and tool results) in order.
    pub async fn run(
        &self,
        messages: &mut Vec<Message>,
        mut interrupt_responses: Vec<InterruptResponse>,
        state: &mut TurnState,
        stop: &mut StopPoller,
        cancel: &CancellationToken,
        transcript: &mut Vec<ContentBlock>,
    ) -> LoopOutcome {
        let processor = EventProcessor::new(self.sink);
        let specs = self.tools.specs();

        for round in 0..self.max_rounds {
            let request = LlmRequest {
                system_prompt: self.profile.system_prompt.clone(),
                messages: normalize_roles(messages.clone()),
                tools: specs.clone(),
                model_id: self.profile.model_id.clone(),
                temperature: self.profile.temperature,
                cache_config: self.profile.cache_config.clone(),
                interrupt_responses: std::mem::take(&mut interrupt_responses),
            };
            tracing::debug!(round, messages = request.messages.len(), "calling LLM");

            let opened = tokio::select! {
                _ = cancel.cancelled() => return LoopOutcome::Cancelled,
                opened = self.retry.execute("llm.stream", || self.llm.stream(request.clone())) => opened,
            };
            let stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "LLM call could not be opened");
                    self.sink
                        .emit(AgentEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return LoopOutcome::Failed {
                        error: e.to_string(),
                    };
                }
            };

            match processor.consume(state, stream, stop, cancel).await {
                StreamOutcome::Completed { message } => {
                    self.record(messages, transcript, message.clone()).await;
                    let calls: Vec<ToolUse> = message.tool_uses().cloned().collect();
                    if calls.is_empty() {
                        return LoopOutcome::Finished { message };
                    }

                    let dispatcher =
                        ToolDispatcher::new(self.tools, self.turn, self.session, self.sink, self.http);
                    let batch = dispatcher.dispatch(&calls, state, stop, cancel).await;
                    self.record(messages, transcript, Message::tool_results(batch.results))
                        .await;
                    match batch.status {
                        DispatchStatus::Completed => {}
                        DispatchStatus::Stopped => return LoopOutcome::Stopped,
                        DispatchStatus::Cancelled => return LoopOutcome::Cancelled,
                        DispatchStatus::AuthRequired {
                            tool_name,
                            auth_url,
                        } => {
                            return LoopOutcome::AuthRequired {
                                tool_name,
                                auth_url,
                            }
                        }
                    }
                    if let Some(handoff) = self.take_handoff().await {
                        return LoopOutcome::HandedOff(handoff);
                    }
                }
                StreamOutcome::Interrupted {
                    message,
                    synthesized,
                    ..
                } => {
                    self.record(messages, transcript, message).await;
                    self.record_results(messages, transcript, synthesized).await;
                    return LoopOutcome::Interrupted;
                }
                StreamOutcome::StopRequested {
                    partial,
                    synthesized,
                } => {
                    self.record_cut_off(messages, transcript, partial, synthesized)
                        .await;
                    return LoopOutcome::Stopped;
                }
                StreamOutcome::Cancelled {
                    partial,
                    synthesized,
                } => {
                    self.record_cut_off(messages, transcript, partial, synthesized)
                        .await;
                    return LoopOutcome::Cancelled;
                }
                StreamOutcome::Failed {
                    error,
                    partial,
                    synthesized,
                } => {
                    self.record_cut_off(messages, transcript, partial, synthesized)
                        .await;
                    return LoopOutcome::Failed { error };
                }
            }
        }

        let error = "tool loop exceeded max iterations".to_string();
        tracing::warn!(max_rounds = self.max_rounds, "{error}");
        self.sink
            .emit(AgentEvent::Error {
                message: error.clone(),
            })
            .await;
        LoopOutcome::Failed { error }
    }

    async fn take_handoff(&self) -> Option<Handoff> {
        match self.handoff {
            Some(slot) => slot.take().await,
            None => None,
        }
    }

    async fn record(&self, messages: &mut Vec<Message>, transcript: &mut Vec<ContentBlock>, message: Message) {
        if message.content.is_empty() {
            return;
        }
        transcript.extend(message.content.iter().cloned());
        if self.persist {
            if let Err(e) = self.session.append_message(&message).await {
                tracing::error!(key = %self.session.key(), error = %e, "failed to persist message");
            }
        }
        messages.push(message);
    }

    async fn record_results(
        &self,
        messages: &mut Vec<Message>,
        transcript: &mut Vec<ContentBlock>,
        results: Vec<ToolResult>,
    ) {
        if !results.is_empty() {
            self.record(messages, transcript, Message::tool_results(results))
                .await;
        }
    }

    /// A call cut short keeps the log paired: the partial assistant message is
    /// written only together with the results synthesized for its tool uses.
    async fn record_cut_off(
        &self,
        messages: &mut Vec<Message>,
        transcript: &mut Vec<ContentBlock>,
        partial: Message,
        synthesized: Vec<ToolResult>,
    ) {
        if synthesized.is_empty() {
            return;
        }
        self.record(messages, transcript, partial).await;
        self.record_results(messages, transcript, synthesized).await;
    }
}

/// Run one single-agent turn.
pub async fn run_turn(runtime: &RuntimeContext, request: TurnRequest, sink: &EventSink) -> TurnOutcome {
    run_turn_with_cancel(runtime, request, sink, CancellationToken::new()).await
}

/// [`run_turn`] with an external cancellation token (e.g. caller disconnect).
pub async fn run_turn_with_cancel(
    runtime: &RuntimeContext,
    request: TurnRequest,
    sink: &EventSink,
    cancel: CancellationToken,
) -> TurnOutcome {
    let settings = runtime.settings();
    tracing::info!(
        user_id = %request.user_id,
        session_id = %request.session_id,
        agent_id = %request.agent_id,
        files = request.files.len(),
        "turn started"
    );
    sink.emit(AgentEvent::Init {
        session_id: request.session_id.clone(),
        agent_id: request.agent_id.clone(),
    })
    .await;

    let session = runtime.session(request.session_key());
    let tools = runtime.registry().filter(request.enabled_tools.as_deref());
    for warning in &tools.warnings {
        sink.emit(AgentEvent::Metadata {
            data: serde_json::json!({ "warning": warning }),
        })
        .await;
    }

    let mut messages = match session.load_initial_context().await {
        Ok(messages) => messages,
        Err(e) => return fail_turn(sink, format!("failed to load session: {e}")).await,
    };

    if !request.is_resume() {
        let user = compose_user_message(&request.message, &request.files, &settings.prompt);
        if let Err(e) = session.append_message(&user).await {
            return fail_turn(sink, format!("failed to persist user message: {e}")).await;
        }
        messages.push(user);
    }

    let turn = request.turn_context();
    let profile = request.profile(runtime.profile());
    let agent = AgentLoop {
        llm: runtime.llm(),
        profile: &profile,
        tools: &tools,
        turn: &turn,
        session: &session,
        sink,
        http: runtime.http(),
        retry: settings.retry_policy(),
        max_rounds: settings.turn.max_tool_rounds,
        persist: true,
        handoff: None,
    };

    let mut state = TurnState::new();
    let mut stop = runtime.stop_poller(&request.user_id, &request.session_id);
    let mut transcript = Vec::new();
    let outcome = agent
        .run(
            &mut messages,
            request.interrupt_responses.clone(),
            &mut state,
            &mut stop,
            &cancel,
            &mut transcript,
        )
        .await;

    finalize_turn(&session, sink, &state, outcome).await
}

async fn fail_turn(sink: &EventSink, error: String) -> TurnOutcome {
    tracing::error!(error = %error, "turn failed");
    sink.emit(AgentEvent::Error {
        message: error.clone(),
    })
    .await;
    TurnOutcome::failed(error)
}

/// Record the context size, apply the partial-save rule, and emit `complete`.
async fn finalize_turn(
    session: &SessionManager,
    sink: &EventSink,
    state: &TurnState,
    outcome: LoopOutcome,
) -> TurnOutcome {
    // Recorded for every outcome, stopped and failed turns included, so the
    // next load compacts against the context this turn actually reached.
    if state.last_llm_input_tokens > 0 {
        if let Err(e) = session.update_after_turn(state.last_llm_input_tokens).await {
            tracing::warn!(error = %e, "failed to record context size");
        }
    }

    let usage = state.accumulated_usage;
    let (status, message) = match outcome {
        LoopOutcome::Finished { message } => {
            let text = message.text();
            sink.emit(AgentEvent::Complete {
                message: text.clone(),
                images: state.images.clone(),
                usage: (!usage.is_empty()).then_some(usage),
            })
            .await;
            (TurnStatus::Completed, Some(text))
        }
        LoopOutcome::Interrupted => (TurnStatus::Interrupted, None),
        LoopOutcome::Stopped => {
            save_partial_response(session, state).await;
            sink.emit(AgentEvent::Complete {
                message: STOPPED_MESSAGE.to_string(),
                images: Vec::new(),
                usage: None,
            })
            .await;
            (TurnStatus::Stopped, None)
        }
        LoopOutcome::Cancelled => {
            save_partial_response(session, state).await;
            (TurnStatus::Cancelled, None)
        }
        LoopOutcome::AuthRequired {
            tool_name,
            auth_url,
        } => (
            TurnStatus::AuthRequired {
                tool_name,
                auth_url,
            },
            None,
        ),
        LoopOutcome::HandedOff(handoff) => {
            let error = format!("unexpected hand-off to '{}' outside a swarm", handoff.target_node);
            sink.emit(AgentEvent::Error {
                message: error.clone(),
            })
            .await;
            (TurnStatus::Failed { error }, None)
        }
        LoopOutcome::Failed { error } => (TurnStatus::Failed { error }, None),
    };

    tracing::info!(key = %session.key(), ?status, input_tokens = usage.input_tokens, "turn finished");
    TurnOutcome {
        status,
        message,
        usage,
        last_llm_input_tokens: state.last_llm_input_tokens,
    }
}

/// Save streamed text after a stop, unless a tool use was emitted this turn.
pub(crate) async fn save_partial_response(session: &SessionManager, state: &TurnState) {
    if state.tool_use_emitted || state.partial_response_text.is_empty() {
        return;
    }
    let text = format!("{}{INTERRUPTED_MARKER}", state.partial_response_text);
    let message = Message::new(Role::Assistant, vec![ContentBlock::text(text)]);
    if let Err(e) = session.append_message(&message).await {
        tracing::warn!(error = %e, "failed to save partial response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_defaults_agent_and_resume_detection() {
        let request: TurnRequest = serde_json::from_value(serde_json::json!({
            "user_id": "u",
            "session_id": "s",
            "interrupt_responses": [{"interrupt_id": "i1", "response": "approve"}]
        }))
        .unwrap();
        assert_eq!(request.agent_id, DEFAULT_AGENT_ID);
        assert!(request.is_resume());
        assert!(request.enabled_tools.is_none());
    }

    #[test]
    fn request_overrides_profile() {
        let base = AgentProfile::builder()
            .system_prompt("be brief")
            .model_id("base-model")
            .temperature(0.2)
            .build();
        let request = TurnRequest::builder()
            .user_id("u")
            .session_id("s")
            .model_id("override-model".to_string())
            .build();
        let profile = request.profile(&base);
        assert_eq!(profile.model_id, "override-model");
        assert_eq!(profile.system_prompt, "be brief");
        assert_eq!(profile.temperature, Some(0.2));
    }
}
