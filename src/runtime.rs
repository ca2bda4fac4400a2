//! Process-wide runtime context, constructed once and shared by every turn.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::RuntimeSettings;
use crate::error::Result;
use crate::history::SessionKey;
use crate::llm::LlmProvider;
use crate::session::{SessionManager, SessionStores};
use crate::stop::{InMemoryStopSignal, StopPoller, StopSignalProvider};
use crate::stream::{AgentEvent, EventSink};
use crate::swarm::SwarmDefinition;
use crate::tools::ToolRegistry;
use crate::turn::{AgentProfile, TurnOutcome, TurnRequest};

fn default_stop_signals() -> Arc<dyn StopSignalProvider> {
    Arc::new(InMemoryStopSignal::new())
}

fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .pool_max_idle_per_host(10)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "custom HTTP client failed to build, using defaults");
            reqwest::Client::new()
        })
}

/// Everything a turn needs that outlives the turn.
///
/// Holds the pooled HTTP client used by tools and gateways; it is created on
/// first use and reused for every request.
#[derive(bon::Builder)]
pub struct RuntimeContext {
    #[builder(default)]
    settings: RuntimeSettings,
    llm: Arc<dyn LlmProvider>,
    #[builder(default)]
    registry: ToolRegistry,
    #[builder(default = SessionStores::in_memory())]
    stores: SessionStores,
    #[builder(default = default_stop_signals())]
    stop_signals: Arc<dyn StopSignalProvider>,
    /// Defaults for single-agent turns; request fields override them.
    #[builder(default)]
    profile: AgentProfile,
    swarm: Option<SwarmDefinition>,
    #[builder(skip)]
    http: OnceLock<reqwest::Client>,
}

impl RuntimeContext {
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn llm(&self) -> &dyn LlmProvider {
        self.llm.as_ref()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn stores(&self) -> &SessionStores {
        &self.stores
    }

    pub fn stop_signals(&self) -> &Arc<dyn StopSignalProvider> {
        &self.stop_signals
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    pub fn swarm(&self) -> Option<&SwarmDefinition> {
        self.swarm.as_ref()
    }

    /// The shared HTTP client.
    pub fn http(&self) -> &reqwest::Client {
        self.http.get_or_init(build_http_client)
    }

    pub fn session(&self, key: SessionKey) -> SessionManager {
        SessionManager::new(key, self.stores.clone(), &self.settings)
    }

    pub fn stop_poller(&self, user_id: &str, session_id: &str) -> StopPoller {
        StopPoller::new(
            self.stop_signals.clone(),
            user_id,
            session_id,
            self.settings.stop.check_interval(),
        )
    }

    /// A bounded caller channel sized from settings.
    pub fn event_channel(&self) -> (EventSink, tokio::sync::mpsc::Receiver<AgentEvent>) {
        EventSink::channel(self.settings.turn.event_channel_capacity)
    }

    /// Raise the stop flag for a running turn.
    pub async fn request_stop(&self, user_id: &str, session_id: &str) -> Result<()> {
        tracing::info!(user_id, session_id, "stop requested by caller");
        self.stop_signals.request(user_id, session_id).await
    }

    /// Run one single-agent turn, streaming events into `sink`.
    pub async fn run_turn(&self, request: TurnRequest, sink: &EventSink) -> TurnOutcome {
        crate::turn::run_turn(self, request, sink).await
    }

    /// Run one swarm turn. Fails if no swarm is configured.
    pub async fn run_swarm_turn(&self, request: TurnRequest, sink: &EventSink) -> Result<TurnOutcome> {
        let Some(definition) = self.swarm.as_ref() else {
            return Err(crate::error::WeftError::Configuration(
                "no swarm configured".to_string(),
            ));
        };
        Ok(crate::swarm::run_swarm_turn(self, definition, request, sink).await)
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("tools", &self.registry.len())
            .field("swarm", &self.swarm.is_some())
            .finish_non_exhaustive()
    }
}
