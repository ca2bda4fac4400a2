//! Turns one LLM call's chunk stream into semantic events.
//!
//! The processor borrows the turn-local [`TurnState`] mutably for the whole
//! call: it deduplicates tool-use ids, parse-gates tool input, tracks the
//! context-size signal, and on abnormal exits synthesizes error tool results
//! for every emitted tool use that has no answer yet.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::events::{AgentEvent, EventImage};
use super::partial_json::ToolInputBuffer;
use super::sse::EventSink;
use crate::llm::ChunkStream;
use crate::stop::StopPoller;
use crate::types::{
    ContentBlock, Interrupt, LlmChunk, Message, Role, StopReason, ToolResult, ToolResultContent,
    ToolStatus, ToolUse, Usage,
};

/// Lower bound for the idle stop-poll timer.
const MIN_STOP_TICK: Duration = Duration::from_millis(50);

/// Text of the tool result synthesized for calls cut off by a stop.
pub const CANCELLED_TOOL_RESULT: &str = "cancelled";

/// Bookkeeping for an emitted tool use.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolUse {
    pub name: String,
    pub input: Value,
    pub started_at: DateTime<Utc>,
}

/// State owned by the turn driver for one turn and lent to the processor.
#[derive(Debug, Default)]
pub struct TurnState {
    pub seen_tool_use_ids: HashSet<String>,
    pub tool_use_registry: HashMap<String, PendingToolUse>,
    tool_use_order: Vec<String>,
    completed_tool_use_ids: HashSet<String>,
    pub partial_response_text: String,
    /// Context size of the most recent LLM call (overwritten, never summed).
    pub last_llm_input_tokens: u64,
    pub accumulated_usage: Usage,
    pub tool_use_emitted: bool,
    pub images: Vec<EventImage>,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Emitted tool uses without a recorded result, in emission order.
    pub fn pending_tool_uses(&self) -> Vec<(String, String)> {
        self.tool_use_order
            .iter()
            .filter(|id| !self.completed_tool_use_ids.contains(*id))
            .filter_map(|id| {
                self.tool_use_registry
                    .get(id)
                    .map(|p| (id.clone(), p.name.clone()))
            })
            .collect()
    }

    /// Note a tool result; successful image payloads are kept for the final event.
    pub fn record_result(&mut self, result: &ToolResult) {
        self.completed_tool_use_ids.insert(result.tool_use_id.clone());
        if result.status != ToolStatus::Success {
            return;
        }
        for item in &result.content {
            if let ToolResultContent::Image { format, source } = item {
                self.images.push(EventImage {
                    format: format.clone(),
                    source: source.clone(),
                });
            }
        }
    }

    fn register(&mut self, id: &str, name: &str, input: &Value) {
        self.seen_tool_use_ids.insert(id.to_string());
        self.tool_use_order.push(id.to_string());
        self.tool_use_registry.insert(
            id.to_string(),
            PendingToolUse {
                name: name.to_string(),
                input: input.clone(),
                started_at: Utc::now(),
            },
        );
        self.tool_use_emitted = true;
    }
}

/// How one LLM call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// The call finished; `message` is the assistant message it produced.
    Completed { message: Message },
    /// The model asked for human approval.
    Interrupted {
        message: Message,
        interrupts: Vec<Interrupt>,
        synthesized: Vec<ToolResult>,
    },
    /// The user raised the stop flag.
    StopRequested {
        partial: Message,
        synthesized: Vec<ToolResult>,
    },
    /// The turn's cancellation token fired (e.g. a swarm node timeout).
    Cancelled {
        partial: Message,
        synthesized: Vec<ToolResult>,
    },
    /// The stream broke. With pending tool uses the failure was reported as
    /// error tool results; otherwise an `error` event was emitted.
    Failed {
        error: String,
        partial: Message,
        synthesized: Vec<ToolResult>,
    },
}

enum Exit {
    Ended {
        stop_reason: StopReason,
        message: Option<Message>,
        interrupts: Vec<Interrupt>,
    },
    Stop,
    Cancelled,
    Error(String),
}

/// Blocks observed during one call, in arrival order.
#[derive(Default)]
struct CallAssembly {
    blocks: Vec<ContentBlock>,
    inputs: HashMap<String, ToolInputBuffer>,
    tool_block_index: HashMap<String, usize>,
    provider_message: Option<Message>,
    usage: Option<Usage>,
}

impl CallAssembly {
    fn push_text(&mut self, text: &str) {
        if let Some(ContentBlock::Text { text: last }) = self.blocks.last_mut() {
            last.push_str(text);
        } else {
            self.blocks.push(ContentBlock::text(text));
        }
    }

    fn push_reasoning(&mut self, text: &str) {
        if let Some(ContentBlock::Reasoning { text: last }) = self.blocks.last_mut() {
            last.push_str(text);
        } else {
            self.blocks.push(ContentBlock::Reasoning {
                text: text.to_string(),
            });
        }
    }

    /// The assembled message. With `complete`, unparsed tool inputs fall back
    /// to `{}`; otherwise tool uses that never parsed are dropped.
    fn into_message(self, complete: bool) -> Message {
        let CallAssembly {
            blocks,
            inputs,
            provider_message,
            ..
        } = self;
        if complete {
            if let Some(message) = provider_message {
                return message;
            }
        }
        let content = blocks
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(mut tu) if tu.input.is_null() => {
                    let parsed = inputs.get(&tu.tool_use_id).and_then(|b| {
                        serde_json::from_str::<Value>(b.raw().trim())
                            .ok()
                            .filter(Value::is_object)
                    });
                    match parsed {
                        Some(input) => tu.input = input,
                        None if complete => {
                            tracing::warn!(
                                tool_use_id = %tu.tool_use_id,
                                "tool input never parsed; using empty object"
                            );
                            tu.input = Value::Object(Default::default());
                        }
                        None => return None,
                    }
                    Some(ContentBlock::ToolUse(tu))
                }
                other => Some(other),
            })
            .collect();
        Message::new(Role::Assistant, content)
    }
}

/// Consumes chunk streams and forwards semantic events to the caller.
pub struct EventProcessor<'a> {
    sink: &'a EventSink,
}

impl<'a> EventProcessor<'a> {
    pub fn new(sink: &'a EventSink) -> Self {
        Self { sink }
    }

    /// Process one LLM call to its end, a stop, a cancellation, or a failure.
    pub async fn consume(
        &self,
        state: &mut TurnState,
        mut stream: ChunkStream,
        stop: &mut StopPoller,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let mut call = CallAssembly::default();
        let tick = stop.interval().max(MIN_STOP_TICK);

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Exit::Cancelled,
                next = stream.next() => next,
                _ = tokio::time::sleep(tick) => {
                    if stop.should_stop().await {
                        break Exit::Stop;
                    }
                    continue;
                }
            };
            if stop.should_stop().await {
                break Exit::Stop;
            }
            match next {
                None => {
                    break Exit::Ended {
                        stop_reason: StopReason::EndTurn,
                        message: None,
                        interrupts: Vec::new(),
                    }
                }
                Some(Err(e)) => break Exit::Error(e.to_string()),
                Some(Ok(LlmChunk::Result {
                    stop_reason,
                    message,
                    interrupts,
                })) => {
                    break Exit::Ended {
                        stop_reason,
                        message,
                        interrupts,
                    }
                }
                Some(Ok(chunk)) => self.on_chunk(state, &mut call, chunk).await,
            }
        };

        if let Some(usage) = call.usage.take() {
            state.accumulated_usage.merge(&usage);
        }

        match exit {
            Exit::Ended {
                stop_reason,
                message,
                interrupts,
            } => {
                if message.is_some() {
                    call.provider_message = message;
                }
                let message = call.into_message(true);
                self.announce_tool_uses(state, &message).await;

                if stop_reason == StopReason::Interrupt || !interrupts.is_empty() {
                    self.sink
                        .emit(AgentEvent::Interrupt {
                            interrupts: interrupts.clone(),
                        })
                        .await;
                    let synthesized = self
                        .settle_pending(state, "Interrupted: awaiting human approval")
                        .await;
                    return StreamOutcome::Interrupted {
                        message,
                        interrupts,
                        synthesized,
                    };
                }
                StreamOutcome::Completed { message }
            }
            Exit::Stop => {
                let partial = call.into_message(false);
                let synthesized = self.settle_pending(state, CANCELLED_TOOL_RESULT).await;
                StreamOutcome::StopRequested {
                    partial,
                    synthesized,
                }
            }
            Exit::Cancelled => {
                let partial = call.into_message(false);
                let synthesized = self.settle_pending(state, CANCELLED_TOOL_RESULT).await;
                StreamOutcome::Cancelled {
                    partial,
                    synthesized,
                }
            }
            Exit::Error(error) => {
                tracing::warn!(error = %error, "LLM stream failed");
                let partial = call.into_message(false);
                let synthesized = self
                    .settle_pending(state, &format!("Tool execution failed: {error}"))
                    .await;
                if synthesized.is_empty() {
                    self.sink
                        .emit(AgentEvent::Error {
                            message: error.clone(),
                        })
                        .await;
                }
                StreamOutcome::Failed {
                    error,
                    partial,
                    synthesized,
                }
            }
        }
    }

    async fn on_chunk(&self, state: &mut TurnState, call: &mut CallAssembly, chunk: LlmChunk) {
        match chunk {
            LlmChunk::Reasoning { text } => {
                if text.is_empty() {
                    return;
                }
                call.push_reasoning(&text);
                self.sink.emit(AgentEvent::Reasoning { text }).await;
            }
            LlmChunk::Data { text } => {
                if text.is_empty() {
                    return;
                }
                state.partial_response_text.push_str(&text);
                call.push_text(&text);
                self.sink.emit(AgentEvent::Response { text }).await;
            }
            LlmChunk::CurrentToolUse {
                tool_use_id,
                name,
                input,
            } => {
                if !call.tool_block_index.contains_key(&tool_use_id) {
                    call.tool_block_index
                        .insert(tool_use_id.clone(), call.blocks.len());
                    call.blocks
                        .push(ContentBlock::tool_use(&tool_use_id, &name, Value::Null));
                }
                let buffer = call.inputs.entry(tool_use_id.clone()).or_default();
                let Some(parsed) = buffer.push(&input).cloned() else {
                    return;
                };
                if let Some(ContentBlock::ToolUse(tu)) = call
                    .tool_block_index
                    .get(&tool_use_id)
                    .and_then(|&i| call.blocks.get_mut(i))
                {
                    tu.input = parsed.clone();
                }
                self.emit_tool_use(state, &tool_use_id, &name, parsed).await;
            }
            LlmChunk::Metadata { usage } => {
                state.last_llm_input_tokens = usage.input_tokens;
                call.usage = Some(usage);
            }
            LlmChunk::Message { message } => {
                if message.role == Role::Assistant {
                    call.provider_message = Some(message);
                }
            }
            LlmChunk::Result { .. } => {}
        }
    }

    /// Emit a `tool_use` for a new id, or an update when the input grew.
    async fn emit_tool_use(&self, state: &mut TurnState, id: &str, name: &str, input: Value) {
        if !state.seen_tool_use_ids.contains(id) {
            state.register(id, name, &input);
        } else {
            match state.tool_use_registry.get_mut(id) {
                Some(pending) if pending.input != input => pending.input = input.clone(),
                _ => return,
            }
        }
        self.sink
            .emit(AgentEvent::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })
            .await;
    }

    /// Make sure every tool use in the final message was announced with its final input.
    async fn announce_tool_uses(&self, state: &mut TurnState, message: &Message) {
        let tool_uses: Vec<ToolUse> = message.tool_uses().cloned().collect();
        for tu in tool_uses {
            self.emit_tool_use(state, &tu.tool_use_id, &tu.name, tu.input)
                .await;
        }
    }

    /// Answer every pending tool use with an error result carrying `reason`.
    async fn settle_pending(&self, state: &mut TurnState, reason: &str) -> Vec<ToolResult> {
        let mut synthesized = Vec::new();
        for (id, name) in state.pending_tool_uses() {
            tracing::info!(tool_use_id = %id, tool = %name, reason, "synthesizing tool result");
            let result = ToolResult::error(&id, reason);
            self.sink
                .emit(AgentEvent::ToolResult {
                    id: id.clone(),
                    status: ToolStatus::Error,
                    content: result.content.clone(),
                    metadata: None,
                })
                .await;
            state.record_result(&result);
            synthesized.push(result);
        }
        synthesized
    }
}
