//! The hand-off tool and the bookkeeping around hand-offs.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::node::SwarmDefinition;
use crate::llm::ToolSpec;
use crate::tools::{FnTool, RegisteredTool, SchemaBuilder, ToolKind, ToolOutput};

/// Name of the tool nodes call to transfer control.
pub const HANDOFF_TOOL_NAME: &str = "hand_off_to_agent";

/// A transfer of control requested by a node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Handoff {
    #[serde(default)]
    pub from: String,
    pub target_node: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context: Option<Value>,
}

/// Holds the hand-off requested during the current tool batch.
#[derive(Debug, Default)]
pub struct HandoffSlot {
    inner: Mutex<Option<Handoff>>,
}

impl HandoffSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handoff` unless one is already pending. Returns whether it was stored.
    pub async fn set(&self, handoff: Handoff) -> bool {
        let mut slot = self.inner.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(handoff);
        true
    }

    pub async fn take(&self) -> Option<Handoff> {
        self.inner.lock().await.take()
    }
}

/// Build the hand-off tool offered to node `from`.
///
/// The handler validates the target and parks the request in `slot`; the
/// agent loop picks it up once the tool batch finishes.
pub fn handoff_tool(definition: &SwarmDefinition, from: &str, slot: Arc<HandoffSlot>) -> Arc<RegisteredTool> {
    let targets: Vec<String> = definition
        .targets_of(from)
        .into_iter()
        .map(|n| n.name.clone())
        .collect();
    let listing = definition
        .targets_of(from)
        .into_iter()
        .map(|n| format!("- {}: {}", n.name, n.description))
        .collect::<Vec<_>>()
        .join("\n");
    let target_refs: Vec<&str> = targets.iter().map(String::as_str).collect();

    let spec = ToolSpec {
        name: HANDOFF_TOOL_NAME.to_string(),
        description: format!(
            "Transfer control to another agent in the swarm. Available agents:\n{listing}"
        ),
        input_schema: SchemaBuilder::object()
            .string_enum("target_node", "Agent that should continue", &target_refs, true)
            .string("message", "What the next agent should do", true)
            .object_property("context", "Facts to share with the next agent", false)
            .build(),
    };

    let from = from.to_string();
    let handler = FnTool::new(move |input, _cancel| {
        let slot = slot.clone();
        let from = from.clone();
        let targets = targets.clone();
        async move {
            let mut handoff: Handoff = match serde_json::from_value(input) {
                Ok(handoff) => handoff,
                Err(e) => return Ok(ToolOutput::error(format!("Invalid hand-off input: {e}"))),
            };
            if !targets.contains(&handoff.target_node) {
                return Ok(ToolOutput::error(format!(
                    "Unknown agent '{}'. Available: {}",
                    handoff.target_node,
                    targets.join(", ")
                )));
            }
            handoff.from = from;
            let target = handoff.target_node.clone();
            if !slot.set(handoff).await {
                return Ok(ToolOutput::error("A hand-off is already pending for this step"));
            }
            Ok(ToolOutput::text(format!("Handing off to {target}")))
        }
    });

    Arc::new(RegisteredTool {
        spec,
        kind: ToolKind::Local(Arc::new(handler)),
        artifact_mutating: false,
    })
}

/// Sliding window over recent hand-offs that spots agents bouncing work back and forth.
#[derive(Debug)]
pub struct HandoffWindow {
    edges: VecDeque<(String, String)>,
    window: usize,
    min_unique: usize,
}

impl HandoffWindow {
    pub fn new(window: usize, min_unique: usize) -> Self {
        Self {
            edges: VecDeque::with_capacity(window),
            window,
            min_unique,
        }
    }

    pub fn record(&mut self, from: &str, to: &str) {
        if self.window == 0 {
            return;
        }
        if self.edges.len() == self.window {
            self.edges.pop_front();
        }
        self.edges.push_back((from.to_string(), to.to_string()));
    }

    /// True once a full window of hand-offs touches fewer than `min_unique` nodes.
    pub fn is_repetitive(&self) -> bool {
        if self.window == 0 || self.edges.len() < self.window {
            return false;
        }
        let unique: HashSet<&str> = self
            .edges
            .iter()
            .flat_map(|(from, to)| [from.as_str(), to.as_str()])
            .collect();
        unique.len() < self.min_unique
    }
}
