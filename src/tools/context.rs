//! What a tool handler can see while it runs.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::session::SessionManager;
use crate::stream::EventSink;
use crate::types::UploadedFile;

/// Immutable per-turn facts shared by every tool call of the turn.
#[derive(Debug, Clone, Default, bon::Builder)]
#[builder(on(String, into))]
pub struct TurnContext {
    pub user_id: String,
    pub session_id: String,
    #[builder(default)]
    pub model_id: String,
    /// Credentials for external tool backends, keyed by provider.
    #[builder(default)]
    pub api_keys: HashMap<String, String>,
    pub selected_artifact_id: Option<String>,
    #[builder(default)]
    pub uploaded_files: Vec<UploadedFile>,
}

/// Borrowed view handed to one tool invocation.
///
/// The turn driver owns everything referenced here; handlers only borrow it
/// for the duration of the call.
pub struct InvocationContext<'a> {
    pub turn: &'a TurnContext,
    pub session: &'a SessionManager,
    pub events: &'a EventSink,
    pub http: &'a reqwest::Client,
    pub tool_use_id: &'a str,
    pub tool_name: &'a str,
    /// Fired when the turn is stopped. Long-running handlers must watch it.
    pub cancel: CancellationToken,
}

impl InvocationContext<'_> {
    pub fn user_id(&self) -> &str {
        &self.turn.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.turn.session_id
    }

    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.turn.api_keys.get(provider).map(String::as_str)
    }

    pub fn uploaded_file(&self, name: &str) -> Option<&UploadedFile> {
        self.turn.uploaded_files.iter().find(|f| f.name == name)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
