//! Session configuration and tracing bootstrap.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Tunables for a debug session. All fields have defaults so an empty (or
/// absent) config file is valid.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DebuggerConfig {
    /// Upper bound on any single backend call before the session is
    /// declared deadlocked and the kill callback fires.
    pub deadlock_timeout_ms: u64,
    /// Background thread-tree poll interval while the debuggee is running.
    pub refresh_interval_ms: u64,
    /// Run to the stop class's `main` and stop there on session start.
    pub stop_on_main: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            deadlock_timeout_ms: 5_000,
            refresh_interval_ms: 5_000,
            stop_on_main: true,
        }
    }
}

impl DebuggerConfig {
    pub fn deadlock_timeout(&self) -> Duration {
        Duration::from_millis(self.deadlock_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Install the global tracing subscriber, filtered by `VIGIL_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("VIGIL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
