//! Timeout configuration for provider subprocesses.
//!
//! Every subprocess the executor starts runs under one of these limits:
//! the dispatch timeout for delegated work (overridable per request) and
//! the shorter auth-check timeout used by `verify`.

use std::time::Duration;

/// Default wall-clock limit for a delegated task.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Default wall-clock limit for a provider's auth check.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts applied to provider subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time allowed for one delegated task.
    /// Default: 300 seconds (5 minutes)
    pub dispatch_timeout: Duration,

    /// Maximum time allowed for an auth-check command.
    /// Default: 10 seconds
    pub auth_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from millisecond settings. Zero means "use the default".
    pub fn from_millis(dispatch_ms: u64, auth_ms: u64) -> Self {
        let mut config = Self::default();
        if dispatch_ms > 0 {
            config.dispatch_timeout = Duration::from_millis(dispatch_ms);
        }
        if auth_ms > 0 {
            config.auth_timeout = Duration::from_millis(auth_ms);
        }
        config
    }

    /// Sets the dispatch timeout.
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Sets the auth-check timeout.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// The timeout for a dispatch, preferring a per-request override.
    pub fn dispatch_timeout_for(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => self.dispatch_timeout,
        }
    }
}
