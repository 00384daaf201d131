use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome category of a failed dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The requested provider id or alias is not registered.
    UnknownProvider,
    /// Automatic selection found no provider with room for the task.
    NoEligibleProvider,
    /// Admission control rejected the task before spawning.
    QuotaExceeded,
    /// The provider's auth check failed.
    ProviderUnavailable,
    /// The provider command could not be started.
    SpawnFailure,
    /// The subprocess exceeded its wall-clock timeout and was killed.
    Timeout,
    /// The subprocess exited with a non-zero status.
    ExitFailure,
}

impl ErrorKind {
    /// Whether an attempt with this outcome consumed provider capacity.
    ///
    /// Pre-flight outcomes never reached the provider and are not charged.
    pub fn charges_quota(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::ExitFailure)
    }

    /// Whether the failure was detected before a subprocess was spawned.
    pub fn is_preflight(&self) -> bool {
        !self.charges_quota()
    }
}

/// One line of the usage log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub provider_id: String,
    pub estimated_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_tokens: Option<u64>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    /// Process-level session the attempt belongs to.
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl UsageRecord {
    /// Create a successful record stamped with the current time.
    pub fn success(provider_id: impl Into<String>, estimated_tokens: u64, duration_ms: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            provider_id: provider_id.into(),
            estimated_tokens,
            actual_tokens: None,
            success: true,
            duration_ms,
            error_kind: None,
            session_id: String::new(),
            model: None,
            exit_code: Some(0),
        }
    }

    /// Create a failed record stamped with the current time.
    pub fn failure(
        provider_id: impl Into<String>,
        estimated_tokens: u64,
        duration_ms: u64,
        kind: ErrorKind,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            provider_id: provider_id.into(),
            estimated_tokens,
            actual_tokens: None,
            success: false,
            duration_ms,
            error_kind: Some(kind),
            session_id: String::new(),
            model: None,
            exit_code: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_actual_tokens(mut self, tokens: Option<u64>) -> Self {
        self.actual_tokens = tokens;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Whether this attempt counts against the provider's quota.
    pub fn charges_quota(&self) -> bool {
        match self.error_kind {
            None => self.success,
            Some(kind) => kind.charges_quota(),
        }
    }

    /// Tokens charged against quota: the reported count when known, the estimate otherwise.
    pub fn charged_tokens(&self) -> u64 {
        self.actual_tokens.unwrap_or(self.estimated_tokens)
    }
}

/// Generate an identifier for the current process session.
pub fn generate_session_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let pid = std::process::id();
    format!("session-{}-{}", timestamp_ms, pid)
}
