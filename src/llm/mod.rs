//! LLM provider contract.
//!
//! The runtime never talks to a model SDK directly. A provider turns an
//! [`LlmRequest`] into a stream of [`LlmChunk`]s for exactly one model call;
//! the turn driver owns the tool loop around it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WeftError;
use crate::types::{InterruptResponse, LlmChunk, Message};

/// Tool schema presented to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Prompt-cache hints forwarded to the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    pub strategy: String,
}

/// Input of one streaming model call.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub model_id: String,
    pub temperature: Option<f32>,
    pub cache_config: Option<CacheConfig>,
    /// Answers to interrupts raised by the previous turn.
    pub interrupt_responses: Vec<InterruptResponse>,
}

pub type ChunkStream = BoxStream<'static, Result<LlmChunk, WeftError>>;

/// A streaming model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Open a streaming call. Errors before the first chunk are returned here;
    /// failures mid-stream arrive as `Err` items.
    async fn stream(&self, request: LlmRequest) -> Result<ChunkStream, WeftError>;
}
