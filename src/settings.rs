//! Ambient client settings
//!
//! Knobs that are not part of a single connection: debug buffer size,
//! termination windows and the validator's allowed root. Loaded from the
//! environment and overridden from the command line, like `LogConfig`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of protocol messages retained for debugging
pub const DEFAULT_DEBUG_CAPACITY: usize = 500;

/// Default wait after the graceful stop signal
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Default wait after the forceful kill
pub const DEFAULT_KILL_WAIT: Duration = Duration::from_secs(2);

/// Client-wide settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Capacity of the protocol traffic ring buffer
    pub debug_capacity: usize,
    /// How long to wait for a process group to exit after the graceful signal
    pub terminate_grace: Duration,
    /// How long to wait for a process group to exit after the forceful kill
    pub kill_wait: Duration,
    /// Root that path-like command tokens must stay inside
    pub allowed_root: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            debug_capacity: DEFAULT_DEBUG_CAPACITY,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            kill_wait: DEFAULT_KILL_WAIT,
            allowed_root: None,
        }
    }
}

impl ClientSettings {
    /// Create settings from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            debug_capacity: env_parse("MCP_PROBE_DEBUG_CAPACITY")
                .unwrap_or(defaults.debug_capacity),
            terminate_grace: env_parse("MCP_PROBE_TERMINATE_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.terminate_grace),
            kill_wait: env_parse("MCP_PROBE_KILL_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.kill_wait),
            allowed_root: env::var("MCP_PROBE_ALLOWED_ROOT")
                .ok()
                .filter(|root| !root.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(
        mut self,
        debug_capacity: Option<usize>,
        allowed_root: Option<PathBuf>,
    ) -> Self {
        if let Some(capacity) = debug_capacity {
            self.debug_capacity = capacity;
        }
        if let Some(root) = allowed_root {
            self.allowed_root = Some(root);
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
