//! Cooperative stop signals.
//!
//! A caller raises a per-`(user, session)` flag; the running turn polls it
//! through a [`StopPoller`] at most once per check interval.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{Result, WeftError};
use crate::history::file::path_label;

/// Per-session stop flag.
#[async_trait]
pub trait StopSignalProvider: Send + Sync {
    async fn is_requested(&self, user_id: &str, session_id: &str) -> Result<bool>;

    async fn request(&self, user_id: &str, session_id: &str) -> Result<()>;

    async fn clear(&self, user_id: &str, session_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryStopSignal {
    flags: RwLock<HashSet<(String, String)>>,
}

impl InMemoryStopSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StopSignalProvider for InMemoryStopSignal {
    async fn is_requested(&self, user_id: &str, session_id: &str) -> Result<bool> {
        Ok(self
            .flags
            .read()
            .await
            .contains(&(user_id.to_string(), session_id.to_string())))
    }

    async fn request(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.flags
            .write()
            .await
            .insert((user_id.to_string(), session_id.to_string()));
        Ok(())
    }

    async fn clear(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.flags
            .write()
            .await
            .remove(&(user_id.to_string(), session_id.to_string()));
        Ok(())
    }
}

/// Marker-file flag, visible across processes sharing a directory.
#[derive(Debug, Clone)]
pub struct FileStopSignal {
    dir: PathBuf,
}

impl FileStopSignal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn marker(&self, user_id: &str, session_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.stop",
            path_label(user_id),
            path_label(session_id)
        ))
    }
}

#[async_trait]
impl StopSignalProvider for FileStopSignal {
    async fn is_requested(&self, user_id: &str, session_id: &str) -> Result<bool> {
        match tokio::fs::metadata(self.marker(user_id, session_id)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(WeftError::StoreUnavailable(err.to_string())),
        }
    }

    async fn request(&self, user_id: &str, session_id: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.marker(user_id, session_id), b"").await?;
        Ok(())
    }

    async fn clear(&self, user_id: &str, session_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.marker(user_id, session_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Throttled, latching view of one session's stop flag.
///
/// Once a stop is observed the poller answers `true` without touching the
/// provider again, and the flag is cleared exactly once.
pub struct StopPoller {
    provider: Arc<dyn StopSignalProvider>,
    user_id: String,
    session_id: String,
    interval: Duration,
    last_check: Option<Instant>,
    observed: bool,
}

impl StopPoller {
    pub fn new(
        provider: Arc<dyn StopSignalProvider>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            provider,
            user_id: user_id.into(),
            session_id: session_id.into(),
            interval,
            last_check: None,
            observed: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a stop has already been observed.
    pub fn is_stopped(&self) -> bool {
        self.observed
    }

    /// Poll the provider unless the last poll was within the interval.
    pub async fn should_stop(&mut self) -> bool {
        if self.observed {
            return true;
        }
        let now = Instant::now();
        if let Some(last) = self.last_check {
            if now.duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_check = Some(now);

        match self
            .provider
            .is_requested(&self.user_id, &self.session_id)
            .await
        {
            Ok(true) => {
                self.observed = true;
                tracing::info!(
                    user_id = %self.user_id,
                    session_id = %self.session_id,
                    "stop requested"
                );
                if let Err(e) = self.provider.clear(&self.user_id, &self.session_id).await {
                    tracing::warn!(error = %e, "failed to clear stop flag");
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(error = %e, "stop signal check failed");
                false
            }
        }
    }
}
