//! Shared test helpers and a scripted LLM provider.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use weft::error::WeftError;
use weft::llm::{ChunkStream, LlmProvider, LlmRequest};
use weft::stream::AgentEvent;
use weft::types::{LlmChunk, StopReason};

/// One scripted model call: chunks in order, optionally ending in an error.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub chunks: Vec<LlmChunk>,
    pub fail_with: Option<String>,
    /// Never finish after the chunks.
    pub hang: bool,
}

impl Script {
    pub fn new(chunks: Vec<LlmChunk>) -> Self {
        Self {
            chunks,
            fail_with: None,
            hang: false,
        }
    }

    /// A plain answer with usage.
    pub fn text(text: &str) -> Self {
        Self::new(vec![
            LlmChunk::data(text),
            LlmChunk::usage(100, 10),
            LlmChunk::end(StopReason::EndTurn),
        ])
    }

    /// One tool call with complete input.
    pub fn tool_call(id: &str, name: &str, input: Value) -> Self {
        Self::tool_calls(&[(id, name, input)])
    }

    pub fn tool_calls(calls: &[(&str, &str, Value)]) -> Self {
        let mut chunks: Vec<LlmChunk> = calls
            .iter()
            .map(|(id, name, input)| LlmChunk::tool_input(*id, *name, input.to_string()))
            .collect();
        chunks.push(LlmChunk::usage(120, 8));
        chunks.push(LlmChunk::end(StopReason::ToolUse));
        Self::new(chunks)
    }

    pub fn failing(mut self, error: &str) -> Self {
        self.fail_with = Some(error.to_string());
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Replays scripts in order and records every request it receives.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn stream(&self, request: LlmRequest) -> Result<ChunkStream, WeftError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::text("(script exhausted)"));
        let mut items: Vec<Result<LlmChunk, WeftError>> =
            script.chunks.into_iter().map(Ok).collect();
        if let Some(error) = script.fail_with {
            items.push(Err(WeftError::Stream(error)));
        }
        if script.hang {
            return Ok(Box::pin(stream::iter(items).chain(stream::pending())));
        }
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain(rx: &mut tokio::sync::mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(AgentEvent::kind).collect()
}
