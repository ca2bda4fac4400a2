//! Runtime configuration (layered: defaults < TOML file < environment).
//!
//! Environment overrides use `WEFT_<SECTION>_<KEY>`, e.g.
//! `WEFT_COMPACTION_TOKEN_THRESHOLD=120000` or `WEFT_STOP_CHECK_INTERVAL_SECONDS=0.5`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::util::retry::RetryPolicy;

/// Environment variable naming an explicit settings file.
pub const CONFIG_PATH_ENV: &str = "WEFT_CONFIG";

/// Two-stage compaction policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    /// Stage 0 → stage 1 cutover (strictly greater triggers).
    pub truncation_threshold_tokens: u64,
    /// Stage 1 → stage 2 cutover (strictly greater triggers).
    pub token_threshold: u64,
    pub recent_turns: usize,
    pub min_recent_turns: usize,
    /// Character limit for tool payloads in stage 1.
    pub max_tool_content_length: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            truncation_threshold_tokens: 20_000,
            token_threshold: 100_000,
            recent_turns: 5,
            min_recent_turns: 3,
            max_tool_content_length: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopSettings {
    pub check_interval_seconds: f64,
}

impl Default for StopSettings {
    fn default() -> Self {
        Self {
            check_interval_seconds: 1.0,
        }
    }
}

impl StopSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_seconds)
    }
}

/// Swarm limits and ping-pong detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSettings {
    pub max_handoffs: usize,
    pub max_iterations: usize,
    pub execution_timeout_seconds: u64,
    pub node_timeout_seconds: u64,
    pub repetitive_handoff_detection_window: usize,
    pub repetitive_handoff_min_unique_agents: usize,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            max_handoffs: 15,
            max_iterations: 15,
            execution_timeout_seconds: 600,
            node_timeout_seconds: 180,
            repetitive_handoff_detection_window: 6,
            repetitive_handoff_min_unique_agents: 2,
        }
    }
}

impl SwarmSettings {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Tools that may write the session artifact map; any of these in a batch
    /// forces sequential dispatch.
    pub artifact_mutating_tool_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    /// Uploaded files are also persisted to a cloud workspace.
    pub cloud_mode: bool,
    /// Office documents above this size are replaced by a filename hint in cloud mode.
    pub max_inline_document_bytes: usize,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            cloud_mode: false,
            max_inline_document_bytes: 4_500_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    /// LLM calls allowed in one turn before it fails.
    pub max_tool_rounds: usize,
    pub summary_strategy_id: String,
    pub summary_top_k: usize,
    pub summary_min_relevance: f64,
    /// Capacity of the bounded channel between the turn and the caller sink.
    pub event_channel_capacity: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: 20,
            summary_strategy_id: "summary".to_string(),
            summary_top_k: 5,
            summary_min_relevance: 0.0,
            event_channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            multiplier: 2.0,
        }
    }
}

/// All runtime knobs. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub compaction: CompactionSettings,
    pub stop: StopSettings,
    pub swarm: SwarmSettings,
    pub tools: ToolSettings,
    pub prompt: PromptSettings,
    pub turn: TurnSettings,
    pub retry: RetrySettings,
}

impl RuntimeSettings {
    /// Parse settings from TOML text (missing keys keep defaults).
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.compaction.truncation_threshold_tokens > self.compaction.token_threshold {
            return Err(WeftError::Configuration(format!(
                "compaction.truncation_threshold_tokens ({}) exceeds compaction.token_threshold ({})",
                self.compaction.truncation_threshold_tokens, self.compaction.token_threshold
            )));
        }
        if self.compaction.max_tool_content_length == 0 {
            return Err(WeftError::Configuration(
                "compaction.max_tool_content_length must be positive".into(),
            ));
        }
        if !(self.stop.check_interval_seconds.is_finite() && self.stop.check_interval_seconds >= 0.0)
        {
            return Err(WeftError::Configuration(
                "stop.check_interval_seconds must be a non-negative number".into(),
            ));
        }
        if self.swarm.repetitive_handoff_detection_window == 0 {
            return Err(WeftError::Configuration(
                "swarm.repetitive_handoff_detection_window must be positive".into(),
            ));
        }
        if self.turn.max_tool_rounds == 0 || self.turn.event_channel_capacity == 0 {
            return Err(WeftError::Configuration(
                "turn.max_tool_rounds and turn.event_channel_capacity must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(WeftError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Loads [`RuntimeSettings`] from file and environment.
#[derive(Debug, Clone, Default)]
pub struct SettingsLoader {
    path: Option<PathBuf>,
    skip_env: bool,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit settings file instead of `$WEFT_CONFIG` / `~/.weft/settings.toml`.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Ignore `WEFT_*` environment overrides.
    pub fn without_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn load(&self) -> Result<RuntimeSettings> {
        if !self.skip_env {
            let _ = dotenvy::dotenv(); // load .env if present, ignore error
        }

        let path = self.resolve_path();
        let mut settings = match path.as_deref() {
            Some(path) => load_file(path)?,
            None => RuntimeSettings::default(),
        };

        if !self.skip_env {
            apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
        }
        settings.validate()?;
        Ok(settings)
    }

    fn resolve_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.path {
            return Some(path.clone());
        }
        if !self.skip_env {
            if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
                return Some(PathBuf::from(path));
            }
        }
        let default = default_settings_path();
        default.exists().then_some(default)
    }
}

fn load_file(path: &Path) -> Result<RuntimeSettings> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        WeftError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    tracing::debug!(path = %path.display(), "loading settings file");
    let settings: RuntimeSettings = toml::from_str(&raw)?;
    Ok(settings)
}

/// `~/.weft/settings.toml`.
pub fn default_settings_path() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".weft"))
        .unwrap_or_else(|| PathBuf::from(".weft"))
        .join("settings.toml")
}

/// Apply `WEFT_<SECTION>_<KEY>` overrides read through `lookup`.
pub fn apply_env_overrides(
    settings: &mut RuntimeSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let env = EnvReader { lookup };

    let c = &mut settings.compaction;
    env.set("WEFT_COMPACTION_TRUNCATION_THRESHOLD_TOKENS", &mut c.truncation_threshold_tokens)?;
    env.set("WEFT_COMPACTION_TOKEN_THRESHOLD", &mut c.token_threshold)?;
    env.set("WEFT_COMPACTION_RECENT_TURNS", &mut c.recent_turns)?;
    env.set("WEFT_COMPACTION_MIN_RECENT_TURNS", &mut c.min_recent_turns)?;
    env.set("WEFT_COMPACTION_MAX_TOOL_CONTENT_LENGTH", &mut c.max_tool_content_length)?;

    env.set("WEFT_STOP_CHECK_INTERVAL_SECONDS", &mut settings.stop.check_interval_seconds)?;

    let s = &mut settings.swarm;
    env.set("WEFT_SWARM_MAX_HANDOFFS", &mut s.max_handoffs)?;
    env.set("WEFT_SWARM_MAX_ITERATIONS", &mut s.max_iterations)?;
    env.set("WEFT_SWARM_EXECUTION_TIMEOUT_SECONDS", &mut s.execution_timeout_seconds)?;
    env.set("WEFT_SWARM_NODE_TIMEOUT_SECONDS", &mut s.node_timeout_seconds)?;
    env.set(
        "WEFT_SWARM_REPETITIVE_HANDOFF_DETECTION_WINDOW",
        &mut s.repetitive_handoff_detection_window,
    )?;
    env.set(
        "WEFT_SWARM_REPETITIVE_HANDOFF_MIN_UNIQUE_AGENTS",
        &mut s.repetitive_handoff_min_unique_agents,
    )?;

    if let Some(raw) = (env.lookup)("WEFT_TOOLS_ARTIFACT_MUTATING_TOOL_IDS") {
        settings.tools.artifact_mutating_tool_ids = raw
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
    }

    env.set_bool("WEFT_PROMPT_CLOUD_MODE", &mut settings.prompt.cloud_mode)?;
    env.set(
        "WEFT_PROMPT_MAX_INLINE_DOCUMENT_BYTES",
        &mut settings.prompt.max_inline_document_bytes,
    )?;

    let t = &mut settings.turn;
    env.set("WEFT_TURN_MAX_TOOL_ROUNDS", &mut t.max_tool_rounds)?;
    env.set("WEFT_TURN_SUMMARY_STRATEGY_ID", &mut t.summary_strategy_id)?;
    env.set("WEFT_TURN_SUMMARY_TOP_K", &mut t.summary_top_k)?;
    env.set("WEFT_TURN_SUMMARY_MIN_RELEVANCE", &mut t.summary_min_relevance)?;
    env.set("WEFT_TURN_EVENT_CHANNEL_CAPACITY", &mut t.event_channel_capacity)?;

    let r = &mut settings.retry;
    env.set("WEFT_RETRY_MAX_ATTEMPTS", &mut r.max_attempts)?;
    env.set("WEFT_RETRY_INITIAL_BACKOFF_MS", &mut r.initial_backoff_ms)?;
    env.set("WEFT_RETRY_MAX_BACKOFF_MS", &mut r.max_backoff_ms)?;

    Ok(())
}

struct EnvReader<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn set<T>(&self, key: &str, slot: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = (self.lookup)(key) {
            *slot = raw
                .trim()
                .parse()
                .map_err(|e| WeftError::Configuration(format!("{key}={raw:?}: {e}")))?;
        }
        Ok(())
    }

    fn set_bool(&self, key: &str, slot: &mut bool) -> Result<()> {
        if let Some(raw) = (self.lookup)(key) {
            *slot = match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => {
                    return Err(WeftError::Configuration(format!(
                        "{key}={raw:?}: expected a boolean"
                    )))
                }
            };
        }
        Ok(())
    }
}
