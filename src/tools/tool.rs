//! Tool handler trait and closure-based handler wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::InvocationContext;
use crate::error::WeftError;
use crate::types::{ToolResultContent, ToolStatus};

/// What a handler returns: result blocks, a status, and optional side-channel metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<ToolResultContent>,
    pub status: ToolStatus,
    pub metadata: Option<Value>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::Text { text: text.into() }],
            status: ToolStatus::Success,
            metadata: None,
        }
    }

    pub fn json(json: Value) -> Self {
        Self {
            content: vec![ToolResultContent::Json { json }],
            status: ToolStatus::Success,
            metadata: None,
        }
    }

    /// A handled failure the model should see and recover from.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::Text {
                text: message.into(),
            }],
            status: ToolStatus::Error,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// In-process tool implementation.
///
/// Returning `Err` is reported to the model as an error tool_result, except
/// [`WeftError::AuthRequired`], which ends the turn with an `auth_required` event.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(
        &self,
        ctx: &InvocationContext<'_>,
        input: Value,
    ) -> Result<ToolOutput, WeftError>;
}

type HandlerFn = dyn Fn(Value, CancellationToken) -> Pin<Box<dyn Future<Output = Result<ToolOutput, WeftError>> + Send>>
    + Send
    + Sync;

/// Closure-backed handler for tools that need only their input and a cancel token.
pub struct FnTool {
    handler: Arc<HandlerFn>,
}

impl FnTool {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, WeftError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |input, cancel| Box::pin(handler(input, cancel))),
        }
    }
}

#[async_trait]
impl ToolHandler for FnTool {
    async fn invoke(
        &self,
        ctx: &InvocationContext<'_>,
        input: Value,
    ) -> Result<ToolOutput, WeftError> {
        (self.handler)(input, ctx.cancel.clone()).await
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool").finish_non_exhaustive()
    }
}
