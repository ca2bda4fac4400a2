//! Peer agents exposed to the model as tools (agent-to-agent calls).

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};

use super::context::InvocationContext;
use super::tool::ToolOutput;
use crate::error::{Result, WeftError};
use crate::stream::AgentEvent;

/// Text fragments streamed back by a peer agent.
pub type PeerStream = BoxStream<'static, Result<String>>;

/// Handle to another agent.
#[async_trait]
pub trait PeerAgent: Send + Sync {
    fn agent_name(&self) -> &str;

    /// Start the peer on `input`; the answer arrives as a sub-stream.
    async fn open(&self, ctx: &InvocationContext<'_>, input: Value) -> Result<PeerStream>;
}

/// Drain a peer's sub-stream into a tool output, relaying progress as metadata events.
pub(crate) async fn run_peer(
    peer: &dyn PeerAgent,
    ctx: &InvocationContext<'_>,
    input: Value,
) -> Result<ToolOutput> {
    let mut stream = peer.open(ctx, input).await?;
    let mut answer = String::new();
    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(WeftError::Cancelled),
            next = stream.next() => next,
        };
        let Some(fragment) = next else { break };
        let fragment = fragment?;
        ctx.events
            .emit(AgentEvent::Metadata {
                data: json!({
                    "peer_agent": peer.agent_name(),
                    "tool_use_id": ctx.tool_use_id,
                    "delta": fragment,
                }),
            })
            .await;
        answer.push_str(&fragment);
    }
    Ok(ToolOutput::text(answer))
}
