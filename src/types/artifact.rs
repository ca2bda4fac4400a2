//! Durable tool outputs kept in the session's artifact map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named durable output of a tool invocation (generated document, dataset, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub artifact_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    /// Storage URL of the artifact payload.
    pub reference: String,
    pub created_by_tool: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        artifact_id: impl Into<String>,
        kind: impl Into<String>,
        title: impl Into<String>,
        reference: impl Into<String>,
        created_by_tool: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            artifact_id: artifact_id.into(),
            kind: kind.into(),
            title: title.into(),
            reference: reference.into(),
            created_by_tool: created_by_tool.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Artifacts of one `(user, session)`, keyed by artifact id.
pub type ArtifactMap = BTreeMap<String, Artifact>;
