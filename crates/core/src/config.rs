//! Core configuration and the context handed to every component.

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::macros::{PlayerConfig, RecorderConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Every tunable of the core, loadable from JSON. Missing fields take defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub connection: ConnectionConfig,
    pub recorder: RecorderConfig,
    pub player: PlayerConfig,
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Reject values that would stall or disable a component.
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        let checks: [(&str, bool); 7] = [
            ("connection.probe_timeout_ms", c.probe_timeout_ms > 0),
            ("connection.command_timeout_ms", c.command_timeout_ms > 0),
            ("connection.retry_budget", c.retry_budget > 0),
            ("connection.max_reconnect_attempts", c.max_reconnect_attempts > 0),
            ("connection.queue_depth", c.queue_depth > 0),
            ("recorder.max_events", self.recorder.max_events > 0),
            ("recorder.max_move_rate_hz", self.recorder.max_move_rate_hz > 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, ok)| !ok) {
            return Err(Error::Config(format!("{field} must be greater than zero")));
        }
        if !(self.player.speed.is_finite() && self.player.speed > 0.0) {
            return Err(Error::Config(format!(
                "player.speed must be a positive number, got {}",
                self.player.speed
            )));
        }
        Ok(())
    }
}

/// Configuration plus the tracing dispatcher that worker threads log through.
#[derive(Clone)]
pub struct CoreContext {
    pub config: Arc<CoreConfig>,
    pub dispatch: tracing::Dispatch,
}

impl CoreContext {
    /// Capture the caller's current default dispatcher.
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config: Arc::new(config),
            dispatch: tracing::dispatcher::get_default(|d| d.clone()),
        }
    }
}

impl Default for CoreContext {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
