//! Executes one batch of tool calls under the artifact concurrency policy.

use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::context::{InvocationContext, TurnContext};
use super::registry::ToolSelection;
use crate::error::WeftError;
use crate::session::SessionManager;
use crate::stop::StopPoller;
use crate::stream::{AgentEvent, EventSink, TurnState, CANCELLED_TOOL_RESULT};
use crate::types::{ToolResult, ToolUse};

const MIN_STOP_TICK: Duration = Duration::from_millis(50);

/// Why a batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    Completed,
    /// The user stop flag was observed; unfinished calls were answered with "cancelled".
    Stopped,
    /// The turn's cancellation token fired.
    Cancelled,
    /// A tool needs the user to authenticate before the turn can go on.
    AuthRequired { tool_name: String, auth_url: String },
}

/// Results in the order the model issued the calls, one per call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub results: Vec<ToolResult>,
    pub status: DispatchStatus,
}

struct Finished {
    index: usize,
    result: ToolResult,
    metadata: Option<serde_json::Value>,
    auth: Option<(String, String)>,
}

/// Borrowed view of everything a batch needs; owned by the turn driver.
pub struct ToolDispatcher<'a> {
    tools: &'a ToolSelection,
    turn: &'a TurnContext,
    session: &'a SessionManager,
    sink: &'a EventSink,
    http: &'a reqwest::Client,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(
        tools: &'a ToolSelection,
        turn: &'a TurnContext,
        session: &'a SessionManager,
        sink: &'a EventSink,
        http: &'a reqwest::Client,
    ) -> Self {
        Self {
            tools,
            turn,
            session,
            sink,
            http,
        }
    }

    /// A batch runs one call at a time if any call may write the artifact map.
    pub fn is_sequential(&self, calls: &[ToolUse]) -> bool {
        calls
            .iter()
            .any(|call| self.tools.is_artifact_mutating(&call.name))
    }

    /// Run `calls`, emitting one `tool_result` per call.
    pub async fn dispatch(
        &self,
        calls: &[ToolUse],
        state: &mut TurnState,
        stop: &mut StopPoller,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let sequential = self.is_sequential(calls);
        let limit = if sequential { 1 } else { calls.len().max(1) };
        tracing::debug!(calls = calls.len(), sequential, "dispatching tool calls");

        let batch_cancel = cancel.child_token();
        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut queue = calls.iter().enumerate();
        let mut running = FuturesUnordered::new();
        let tick = stop.interval().max(MIN_STOP_TICK);
        let mut auth: Option<(String, String)> = None;

        let status = loop {
            while running.len() < limit && !(sequential && auth.is_some()) {
                let Some((index, call)) = queue.next() else { break };
                running.push(self.invoke_one(index, call, batch_cancel.child_token()));
            }
            if running.is_empty() {
                break match auth.take() {
                    Some((tool_name, auth_url)) => DispatchStatus::AuthRequired {
                        tool_name,
                        auth_url,
                    },
                    None => DispatchStatus::Completed,
                };
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    batch_cancel.cancel();
                    break DispatchStatus::Cancelled;
                }
                Some(done) = running.next() => {
                    if auth.is_none() {
                        auth = done.auth.clone();
                    }
                    self.finish(done, &mut slots, state).await;
                    if stop.should_stop().await {
                        batch_cancel.cancel();
                        break DispatchStatus::Stopped;
                    }
                }
                _ = tokio::time::sleep(tick) => {
                    if stop.should_stop().await {
                        batch_cancel.cancel();
                        break DispatchStatus::Stopped;
                    }
                }
            }
        };
        drop(running);

        let fill = match &status {
            DispatchStatus::Completed => None,
            DispatchStatus::Stopped | DispatchStatus::Cancelled => {
                Some(CANCELLED_TOOL_RESULT.to_string())
            }
            DispatchStatus::AuthRequired { tool_name, .. } => Some(format!(
                "Skipped: authentication required for '{tool_name}'"
            )),
        };
        if let Some(text) = fill {
            for (index, call) in calls.iter().enumerate() {
                if slots[index].is_some() {
                    continue;
                }
                let done = Finished {
                    index,
                    result: ToolResult::error(&call.tool_use_id, text.as_str()),
                    metadata: None,
                    auth: None,
                };
                self.finish(done, &mut slots, state).await;
            }
        }

        DispatchOutcome {
            results: slots.into_iter().flatten().collect(),
            status,
        }
    }

    async fn invoke_one(&self, index: usize, call: &ToolUse, cancel: CancellationToken) -> Finished {
        let Some(tool) = self.tools.get(&call.name) else {
            tracing::warn!(tool = %call.name, "model called a tool that is not enabled");
            return Finished {
                index,
                result: ToolResult::error(
                    &call.tool_use_id,
                    format!("Tool '{}' not found", call.name),
                ),
                metadata: None,
                auth: None,
            };
        };

        let ctx = InvocationContext {
            turn: self.turn,
            session: self.session,
            events: self.sink,
            http: self.http,
            tool_use_id: &call.tool_use_id,
            tool_name: &call.name,
            cancel,
        };
        let started = tokio::time::Instant::now();
        let outcome = tool.invoke(&ctx, call.input.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                tracing::debug!(tool = %call.name, tool_use_id = %call.tool_use_id, elapsed_ms, "tool finished");
                Finished {
                    index,
                    result: ToolResult {
                        tool_use_id: call.tool_use_id.clone(),
                        status: output.status,
                        content: output.content,
                    },
                    metadata: output.metadata,
                    auth: None,
                }
            }
            Err(WeftError::AuthRequired {
                tool_name,
                auth_url,
            }) => {
                tracing::info!(tool = %tool_name, "tool requires authentication");
                self.sink
                    .emit(AgentEvent::AuthRequired {
                        tool_name: tool_name.clone(),
                        auth_url: auth_url.clone(),
                    })
                    .await;
                Finished {
                    index,
                    result: ToolResult::error(
                        &call.tool_use_id,
                        format!("Authentication required: {auth_url}"),
                    ),
                    metadata: None,
                    auth: Some((tool_name, auth_url)),
                }
            }
            Err(WeftError::Cancelled) => Finished {
                index,
                result: ToolResult::error(&call.tool_use_id, CANCELLED_TOOL_RESULT),
                metadata: None,
                auth: None,
            },
            Err(e) => {
                tracing::warn!(tool = %call.name, tool_use_id = %call.tool_use_id, error = %e, "tool failed");
                Finished {
                    index,
                    result: ToolResult::error(&call.tool_use_id, e.to_string()),
                    metadata: None,
                    auth: None,
                }
            }
        }
    }

    async fn finish(&self, done: Finished, slots: &mut [Option<ToolResult>], state: &mut TurnState) {
        self.sink
            .emit(AgentEvent::ToolResult {
                id: done.result.tool_use_id.clone(),
                status: done.result.status,
                content: done.result.content.clone(),
                metadata: done.metadata,
            })
            .await;
        state.record_result(&done.result);
        slots[done.index] = Some(done.result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeSettings;
    use crate::history::SessionKey;
    use crate::llm::ToolSpec;
    use crate::session::SessionStores;
    use crate::stop::{InMemoryStopSignal, StopSignalProvider};
    use crate::tools::registry::ToolRegistry;
    use crate::tools::tool::{FnTool, ToolOutput};
    use crate::types::{ToolResultContent, ToolStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn call(id: &str, name: &str) -> ToolUse {
        ToolUse {
            tool_use_id: id.into(),
            name: name.into(),
            input: json!({}),
        }
    }

    /// Records how many calls overlapped.
    #[derive(Default)]
    struct Overlap {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    fn overlapping_tool(overlap: Arc<Overlap>) -> Arc<FnTool> {
        Arc::new(FnTool::new(move |_input, _cancel| {
            let overlap = overlap.clone();
            async move {
                let now = overlap.active.fetch_add(1, Ordering::SeqCst) + 1;
                overlap.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                overlap.active.fetch_sub(1, Ordering::SeqCst);
                Ok(ToolOutput::text("done"))
            }
        }))
    }

    struct Harness {
        session: SessionManager,
        turn: TurnContext,
        sink: EventSink,
        rx: mpsc::Receiver<AgentEvent>,
        http: reqwest::Client,
        signal: Arc<InMemoryStopSignal>,
    }

    impl Harness {
        fn new() -> Self {
            let (sink, rx) = EventSink::channel(64);
            Self {
                session: SessionManager::new(
                    SessionKey::new("u", "s", "a"),
                    SessionStores::in_memory(),
                    &RuntimeSettings::default(),
                ),
                turn: TurnContext::builder().user_id("u").session_id("s").build(),
                sink,
                rx,
                http: reqwest::Client::new(),
                signal: Arc::new(InMemoryStopSignal::new()),
            }
        }

        fn poller(&self) -> StopPoller {
            StopPoller::new(self.signal.clone(), "u", "s", Duration::from_millis(10))
        }

        async fn run(&mut self, tools: &ToolSelection, calls: &[ToolUse]) -> DispatchOutcome {
            let mut state = TurnState::new();
            let mut stop = self.poller();
            ToolDispatcher::new(tools, &self.turn, &self.session, &self.sink, &self.http)
                .dispatch(calls, &mut state, &mut stop, &CancellationToken::new())
                .await
        }

        fn events(&mut self) -> Vec<AgentEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.rx.try_recv() {
                out.push(e);
            }
            out
        }
    }

    #[tokio::test]
    async fn read_only_batch_runs_concurrently() {
        let overlap = Arc::new(Overlap::default());
        let registry = ToolRegistry::builder()
            .local(spec("search"), overlapping_tool(overlap.clone()))
            .build()
            .unwrap();
        let tools = registry.filter(None);
        let mut h = Harness::new();
        let outcome = h
            .run(&tools, &[call("a", "search"), call("b", "search"), call("c", "search")])
            .await;
        assert_eq!(outcome.status, DispatchStatus::Completed);
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 3);
        let ids: Vec<_> = outcome.results.iter().map(|r| r.tool_use_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn one_mutating_call_serializes_the_batch() {
        let overlap = Arc::new(Overlap::default());
        let registry = ToolRegistry::builder()
            .artifact_mutating_ids(["word_builder"])
            .local(spec("search"), overlapping_tool(overlap.clone()))
            .local(spec("word_builder"), overlapping_tool(overlap.clone()))
            .build()
            .unwrap();
        let tools = registry.filter(None);
        let mut h = Harness::new();
        let outcome = h
            .run(&tools, &[call("a", "search"), call("b", "word_builder"), call("c", "search")])
            .await;
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
        let order: Vec<_> = h
            .events()
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::ToolResult { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(outcome.results.len(), 3);
    }

    #[tokio::test]
    async fn handler_error_becomes_error_result() {
        let registry = ToolRegistry::builder()
            .local(
                spec("flaky"),
                Arc::new(FnTool::new(|_i, _c| async {
                    Err(WeftError::tool("flaky", "upstream returned 502"))
                })),
            )
            .build()
            .unwrap();
        let tools = registry.filter(None);
        let mut h = Harness::new();
        let outcome = h.run(&tools, &[call("x", "flaky"), call("y", "missing")]).await;
        assert_eq!(outcome.status, DispatchStatus::Completed);
        assert!(outcome.results.iter().all(ToolResult::is_error));
        let ToolResultContent::Text { text } = &outcome.results[1].content[0] else {
            panic!("expected text");
        };
        assert_eq!(text, "Tool 'missing' not found");
    }

    #[tokio::test]
    async fn auth_required_emits_event_and_pairs_result() {
        let registry = ToolRegistry::builder()
            .local(
                spec("gmail"),
                Arc::new(FnTool::new(|_i, _c| async {
                    Err(WeftError::auth_required("gmail", "https://auth.example.com/start"))
                })),
            )
            .build()
            .unwrap();
        let tools = registry.filter(None);
        let mut h = Harness::new();
        let outcome = h.run(&tools, &[call("g1", "gmail")]).await;
        assert_eq!(
            outcome.status,
            DispatchStatus::AuthRequired {
                tool_name: "gmail".into(),
                auth_url: "https://auth.example.com/start".into(),
            }
        );
        let events = h.events();
        assert!(matches!(events[0], AgentEvent::AuthRequired { .. }));
        assert!(matches!(
            events[1],
            AgentEvent::ToolResult { status: ToolStatus::Error, .. }
        ));
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_calls_and_pairs_them() {
        let registry = ToolRegistry::builder()
            .local(
                spec("slow"),
                Arc::new(FnTool::new(|_i, cancel: CancellationToken| async move {
                    cancel.cancelled().await;
                    Err(WeftError::Cancelled)
                })),
            )
            .build()
            .unwrap();
        let tools = registry.filter(None);
        let mut h = Harness::new();
        let signal = h.signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            signal.request("u", "s").await.unwrap();
        });
        let outcome = h.run(&tools, &[call("p", "slow"), call("q", "slow")]).await;
        assert_eq!(outcome.status, DispatchStatus::Stopped);
        assert_eq!(outcome.results.len(), 2);
        for result in &outcome.results {
            assert_eq!(
                result.content,
                vec![ToolResultContent::Text { text: "cancelled".into() }]
            );
        }
        let results = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, AgentEvent::ToolResult { .. }))
            .count();
        assert_eq!(results, 2);
    }
}
