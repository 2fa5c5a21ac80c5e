//! Session configuration.
//!
//! The core takes no environment or persisted state of its own; the
//! front-end hands a [`SessionConfig`] to session start. Operators supply
//! the same fields as a TOML fragment via whatever wrapper embeds the
//! core.

use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;

/// Context passed at front-end start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Global ceiling, in seconds, on how long the front-end waits for all
    /// back-ends of a probe before treating the round as closed.
    pub stream_timeout_secs: u64,

    /// Stop target processes on session attach.
    pub break_on_enter: bool,

    /// Stop target processes when the stream ceiling fires.
    pub break_on_timeout: bool,

    /// Verbose reporting (maps to TRACE-level logging).
    pub verbose: bool,

    /// Logging setup for this tier.
    pub log: LogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stream_timeout_secs: 60,
            break_on_enter: false,
            break_on_timeout: false,
            verbose: false,
            log: LogConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Parse a config from a TOML string. Missing fields take defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Stream ceiling in milliseconds, saturating.
    #[must_use]
    pub fn stream_timeout_ms(&self) -> u64 {
        self.stream_timeout_secs.saturating_mul(1000)
    }
}
