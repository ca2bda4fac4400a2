//! Typed tool registry and per-turn filtering.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

use super::context::InvocationContext;
use super::gateway::ToolGateway;
use super::peer::{run_peer, PeerAgent};
use super::schema::validate_input;
use super::tool::{ToolHandler, ToolOutput};
use crate::error::{Result, WeftError};
use crate::llm::ToolSpec;

/// How a tool is reached.
#[derive(Clone)]
pub enum ToolKind {
    /// In-process handler.
    Local(Arc<dyn ToolHandler>),
    /// Tool served by a remote gateway under `remote_name`.
    Gateway {
        gateway: Arc<dyn ToolGateway>,
        remote_name: String,
    },
    /// Another agent; invocation yields a sub-stream.
    Peer(Arc<dyn PeerAgent>),
}

impl ToolKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Gateway { .. } => "gateway",
            Self::Peer(_) => "peer",
        }
    }
}

/// A resolved, invocable tool.
#[derive(Clone)]
pub struct RegisteredTool {
    pub spec: ToolSpec,
    pub kind: ToolKind,
    /// May write the session artifact map.
    pub artifact_mutating: bool,
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Invoke through whichever backend this tool lives on.
    pub async fn invoke(&self, ctx: &InvocationContext<'_>, input: Value) -> Result<ToolOutput> {
        match &self.kind {
            ToolKind::Local(handler) => {
                if let Err(reason) = validate_input(&input, &self.spec.input_schema) {
                    return Ok(ToolOutput::error(format!(
                        "Argument validation failed: {reason}"
                    )));
                }
                handler.invoke(ctx, input).await
            }
            ToolKind::Gateway {
                gateway,
                remote_name,
            } => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(WeftError::Cancelled),
                    out = gateway.call_tool(remote_name, input) => out,
                }
            }
            ToolKind::Peer(peer) => run_peer(peer.as_ref(), ctx, input).await,
        }
    }
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.spec.name)
            .field("kind", &self.kind.label())
            .field("artifact_mutating", &self.artifact_mutating)
            .finish()
    }
}

/// All tools known to the process. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<RegisteredTool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredTool>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Resolve the enabled ids for one turn (`None` enables everything).
    ///
    /// Tools keep registration order regardless of request order so the
    /// prompt prefix stays cache-friendly. Unknown ids become warnings.
    pub fn filter(&self, enabled: Option<&[String]>) -> ToolSelection {
        let Some(enabled) = enabled else {
            return ToolSelection {
                tools: self.tools.clone(),
                warnings: Vec::new(),
            };
        };

        let wanted: BTreeSet<&str> = enabled.iter().map(String::as_str).collect();
        let warnings: Vec<String> = wanted
            .iter()
            .filter(|id| !self.index.contains_key(**id))
            .map(|id| format!("unknown tool id '{id}' ignored"))
            .collect();
        for warning in &warnings {
            tracing::warn!("{warning}");
        }

        ToolSelection {
            tools: self
                .tools
                .iter()
                .filter(|t| wanted.contains(t.name()))
                .cloned()
                .collect(),
            warnings,
        }
    }
}

/// Collects registrations; marks tools artifact-mutating from configuration.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<RegisteredTool>,
    artifact_mutating: BTreeSet<String>,
}

impl ToolRegistryBuilder {
    /// Tool ids that write the artifact map (`tools.artifact_mutating_tool_ids`).
    pub fn artifact_mutating_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifact_mutating.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn local(mut self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.push(RegisteredTool {
            spec,
            kind: ToolKind::Local(handler),
            artifact_mutating: false,
        });
        self
    }

    /// A local tool that always mutates artifacts, regardless of configuration.
    pub fn local_mutating(mut self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.push(RegisteredTool {
            spec,
            kind: ToolKind::Local(handler),
            artifact_mutating: true,
        });
        self
    }

    pub fn peer(mut self, spec: ToolSpec, peer: Arc<dyn PeerAgent>) -> Self {
        self.tools.push(RegisteredTool {
            spec,
            kind: ToolKind::Peer(peer),
            artifact_mutating: false,
        });
        self
    }

    /// Register every tool a gateway exposes (after its own allow-list).
    pub async fn gateway(mut self, gateway: Arc<dyn ToolGateway>) -> Result<Self> {
        let specs = gateway.list_tools().await?;
        tracing::info!(gateway = gateway.name(), tools = specs.len(), "registered gateway tools");
        for spec in specs {
            let remote_name = spec.name.clone();
            self.tools.push(RegisteredTool {
                spec,
                kind: ToolKind::Gateway {
                    gateway: gateway.clone(),
                    remote_name,
                },
                artifact_mutating: false,
            });
        }
        Ok(self)
    }

    /// Register one gateway tool under a local id.
    pub fn gateway_tool(
        mut self,
        spec: ToolSpec,
        gateway: Arc<dyn ToolGateway>,
        remote_name: impl Into<String>,
    ) -> Self {
        self.tools.push(RegisteredTool {
            spec,
            kind: ToolKind::Gateway {
                gateway,
                remote_name: remote_name.into(),
            },
            artifact_mutating: false,
        });
        self
    }

    /// Freeze the registry. Duplicate ids are a configuration error.
    pub fn build(self) -> Result<ToolRegistry> {
        let mut registry = ToolRegistry::default();
        for mut tool in self.tools {
            if registry.index.contains_key(tool.name()) {
                return Err(WeftError::Configuration(format!(
                    "tool '{}' registered twice",
                    tool.name()
                )));
            }
            tool.artifact_mutating |= self.artifact_mutating.contains(tool.name());
            registry
                .index
                .insert(tool.name().to_string(), registry.tools.len());
            registry.tools.push(Arc::new(tool));
        }
        Ok(registry)
    }
}

/// Tools enabled for one turn or one swarm node.
#[derive(Debug, Clone, Default)]
pub struct ToolSelection {
    tools: Vec<Arc<RegisteredTool>>,
    pub warnings: Vec<String>,
}

impl ToolSelection {
    pub fn new(tools: Vec<Arc<RegisteredTool>>) -> Self {
        Self {
            tools,
            warnings: Vec::new(),
        }
    }

    pub fn tools(&self) -> &[Arc<RegisteredTool>] {
        &self.tools
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredTool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_artifact_mutating(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.artifact_mutating)
    }

    /// Same selection plus one more tool (appended last).
    pub fn with(mut self, tool: Arc<RegisteredTool>) -> Self {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.tools.retain(|t| t.name() != name);
        self
    }

    /// Keep only the named tools, in selection order.
    pub fn only(mut self, names: &[&str]) -> Self {
        self.tools.retain(|t| names.contains(&t.name()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool::FnTool;
    use serde_json::json;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: format!("{name} tool"),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    fn noop() -> Arc<dyn ToolHandler> {
        Arc::new(FnTool::new(|_input, _cancel| async { Ok(ToolOutput::text("ok")) }))
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .artifact_mutating_ids(["word_builder"])
            .local(spec("search"), noop())
            .local(spec("word_builder"), noop())
            .local(spec("calculator"), noop())
            .build()
            .unwrap()
    }

    #[test]
    fn filter_keeps_registration_order() {
        let selection = registry().filter(Some(&["calculator".into(), "search".into()]));
        assert_eq!(selection.names(), vec!["search", "calculator"]);
        assert!(selection.warnings.is_empty());
    }

    #[test]
    fn unknown_ids_are_warnings_not_errors() {
        let selection = registry().filter(Some(&["search".into(), "teleport".into()]));
        assert_eq!(selection.names(), vec!["search"]);
        assert_eq!(selection.warnings.len(), 1);
        assert!(selection.warnings[0].contains("teleport"));
    }

    #[test]
    fn none_enables_everything() {
        assert_eq!(registry().filter(None).tools().len(), 3);
    }

    #[test]
    fn artifact_flag_comes_from_configuration() {
        let selection = registry().filter(None);
        assert!(selection.is_artifact_mutating("word_builder"));
        assert!(!selection.is_artifact_mutating("search"));
        assert!(!selection.is_artifact_mutating("missing"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let err = ToolRegistry::builder()
            .local(spec("search"), noop())
            .local(spec("search"), noop())
            .build()
            .unwrap_err();
        assert!(matches!(err, WeftError::Configuration(_)));
    }
}
