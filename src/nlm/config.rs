//! Tunables for the NLM core (spec §6), loaded from a TOML file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::nlm::error::CoreError;

/// Configuration knobs for one [`crate::nlm::zone::Zone`].
///
/// All duration fields are stored in seconds/milliseconds on the wire
/// representation and converted to [`Duration`] by their accessor, matching
/// how [`crate::vfs`] keeps its RFC-derived constants as plain integers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NlmConfig {
    /// How long a restarted server refuses non-reclaim requests for.
    pub grace_period_secs: u64,
    /// How long an unreferenced host may sit on the idle LRU before the GC
    /// reclaims it.
    pub idle_timeout_secs: u64,
    /// Retransmit timeout used by the blocking-lock retry loop.
    pub retrans_timeout_secs: u64,
    /// Number of portmapper-resolution attempts when connecting to the
    /// local status monitor at startup.
    pub sm_bind_retries: u32,
    /// Backoff between status-monitor bind attempts, in milliseconds.
    pub sm_bind_backoff_ms: u64,
}

impl Default for NlmConfig {
    fn default() -> Self {
        NlmConfig {
            grace_period_secs: 45,
            idle_timeout_secs: 300,
            retrans_timeout_secs: 5,
            sm_bind_retries: 10,
            sm_bind_backoff_ms: 500,
        }
    }
}

impl NlmConfig {
    /// Parse configuration from a TOML document. Missing fields fall back
    /// to [`NlmConfig::default`].
    pub fn from_toml(text: &str) -> Result<Self, CoreError> {
        toml::from_str(text).map_err(|_| CoreError::InvalidConfig)
    }

    /// Load configuration from a file on disk, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|_| CoreError::InvalidConfig),
            Err(_) => Ok(NlmConfig::default()),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn retrans_timeout(&self) -> Duration {
        Duration::from_secs(self.retrans_timeout_secs)
    }

    pub fn sm_bind_backoff(&self) -> Duration {
        Duration::from_millis(self.sm_bind_backoff_ms)
    }
}
