//! Swarm topology: named nodes with roles and tool subsets.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::turn::AgentProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeRole {
    /// Entry node; may only hand off.
    Coordinator,
    Specialist,
    /// Terminal node; answers the user and cannot hand off.
    Responder,
}

/// Registry tools a node may call (the hand-off tool is added by role).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTools {
    #[default]
    All,
    Only(Vec<String>),
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
#[builder(on(String, into))]
pub struct SwarmNode {
    pub name: String,
    pub role: NodeRole,
    /// Shown to other nodes when they choose a hand-off target.
    #[builder(default)]
    pub description: String,
    #[builder(default)]
    pub profile: AgentProfile,
    #[builder(default)]
    pub tools: NodeTools,
}

/// A validated set of nodes with one coordinator and one responder.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmDefinition {
    nodes: Vec<SwarmNode>,
    coordinator: usize,
    responder: usize,
}

impl SwarmDefinition {
    pub fn new(nodes: Vec<SwarmNode>) -> Result<Self> {
        let mut names = HashSet::new();
        for node in &nodes {
            if node.name.is_empty() {
                return Err(WeftError::Configuration("swarm node without a name".into()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(WeftError::Configuration(format!(
                    "swarm node '{}' defined twice",
                    node.name
                )));
            }
        }
        let coordinator = single_role(&nodes, NodeRole::Coordinator)?;
        let responder = single_role(&nodes, NodeRole::Responder)?;
        Ok(Self {
            nodes,
            coordinator,
            responder,
        })
    }

    pub fn nodes(&self) -> &[SwarmNode] {
        &self.nodes
    }

    pub fn coordinator(&self) -> &SwarmNode {
        &self.nodes[self.coordinator]
    }

    pub fn responder(&self) -> &SwarmNode {
        &self.nodes[self.responder]
    }

    pub fn node(&self, name: &str) -> Option<&SwarmNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Nodes `from` may hand off to.
    pub fn targets_of(&self, from: &str) -> Vec<&SwarmNode> {
        self.nodes.iter().filter(|n| n.name != from).collect()
    }
}

fn single_role(nodes: &[SwarmNode], role: NodeRole) -> Result<usize> {
    let mut found = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.role == role)
        .map(|(i, _)| i);
    match (found.next(), found.next()) {
        (Some(index), None) => Ok(index),
        (None, _) => Err(WeftError::Configuration(format!("swarm needs a {role} node"))),
        (Some(_), Some(_)) => Err(WeftError::Configuration(format!(
            "swarm has more than one {role} node"
        ))),
    }
}
