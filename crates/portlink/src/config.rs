//! Session configuration.

use std::time::Duration;

use crate::handshake::SUPPORTED_VERSION;

/// Default per-request deadline, matching the native helper's budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

pub const TIMEOUT_ENV: &str = "PORTLINK_TIMEOUT_MS";
pub const HANDSHAKE_TIMEOUT_ENV: &str = "PORTLINK_HANDSHAKE_TIMEOUT_MS";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identifier handed to the channel factory (native host name, worker name).
    pub peer: String,
    pub default_timeout: Duration,
    pub handshake_timeout: Duration,
    pub supported_version: u32,
}

impl SessionConfig {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            default_timeout: DEFAULT_TIMEOUT,
            handshake_timeout: DEFAULT_TIMEOUT,
            supported_version: SUPPORTED_VERSION,
        }
    }

    /// Same as [`SessionConfig::new`], with timeouts overridable through
    /// `PORTLINK_TIMEOUT_MS` and `PORTLINK_HANDSHAKE_TIMEOUT_MS`.
    pub fn from_env(peer: impl Into<String>) -> Self {
        let mut config = Self::new(peer);
        if let Some(timeout) = duration_from_env(TIMEOUT_ENV) {
            config.default_timeout = timeout;
        }
        if let Some(timeout) = duration_from_env(HANDSHAKE_TIMEOUT_ENV) {
            config.handshake_timeout = timeout;
        }
        config
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_supported_version(mut self, version: u32) -> Self {
        self.supported_version = version;
        self
    }
}

fn duration_from_env(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!(variable = name, value = %raw, error = %e, "Ignoring invalid timeout");
            None
        }
    }
}
