//! Caller-facing transport: a bounded event channel and its SSE encoding.

use std::convert::Infallible;

use futures::Stream;
use tokio::sync::mpsc;

use super::events::AgentEvent;

/// Single-writer handle into the caller's event channel.
///
/// Sends wait for capacity, so a slow caller back-pressures the turn.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<AgentEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Deliver one event. Returns `false` once the caller has gone away;
    /// the turn keeps running so its checkpoint is still written.
    pub async fn emit(&self, event: AgentEvent) -> bool {
        let kind = event.kind();
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(event = kind, "caller disconnected, dropping event");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Encode one event as an SSE frame: `data: {json}\n\n`.
pub fn encode_event(event: &AgentEvent) -> String {
    match serde_json::to_string(event) {
        Ok(json) => format!("data: {json}\n\n"),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode event");
            let fallback = serde_json::json!({
                "type": "error",
                "message": format!("event encoding failed: {e}"),
            });
            format!("data: {fallback}\n\n")
        }
    }
}

/// Turn a receiver into a stream of SSE frames, ending when every sender is dropped.
pub fn sse_frames(
    mut rx: mpsc::Receiver<AgentEvent>,
) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok(encode_event(&event));
        }
    }
}
