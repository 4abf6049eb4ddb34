//! Session lifecycle bounds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded waits for device sessions.
///
/// `ready_timeout_secs` caps how long a start request blocks waiting for a
/// session to report readiness. `stop_timeout_secs` caps how long a stop
/// request waits for the session's worker to exit. Neither is retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Default: 30
    #[serde(default = "SessionsConfig::default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Default: 5
    #[serde(default = "SessionsConfig::default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Time given to leftover tasks inside a session's scheduler once its
    /// main body has returned.
    /// Default: 500
    #[serde(default = "SessionsConfig::default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
}

impl SessionsConfig {
    fn default_ready_timeout_secs() -> u64 {
        30
    }

    fn default_stop_timeout_secs() -> u64 {
        5
    }

    fn default_teardown_grace_ms() -> u64 {
        500
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: Self::default_ready_timeout_secs(),
            stop_timeout_secs: Self::default_stop_timeout_secs(),
            teardown_grace_ms: Self::default_teardown_grace_ms(),
        }
    }
}
