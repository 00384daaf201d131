//! Error types for delegation.

use thiserror::Error;

use crate::config::ConfigError;
use crate::quota::QuotaError;
use crate::registry::RegistryError;
use crate::usage::UsageLogError;

/// Process exit code for a successful dispatch.
pub const EXIT_OK: i32 = 0;
/// Process exit code when the provider ran and failed or timed out.
pub const EXIT_DISPATCH_FAILURE: i32 = 1;
/// Process exit code when the task was rejected before a provider ran.
pub const EXIT_PREFLIGHT_REJECTED: i32 = 2;
/// Process exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: i32 = 3;

/// Errors from the delegation layer.
#[derive(Error, Debug)]
pub enum DelegationError {
    /// Bad provider id or alias.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// Admission control rejected the task.
    #[error("quota exceeded for '{provider}': {reason}")]
    QuotaExceeded { provider: String, reason: String },

    /// The provider's auth check failed.
    #[error("provider '{provider}' unavailable: {detail}")]
    ProviderUnavailable { provider: String, detail: String },

    #[error("provider '{provider}' timed out after {timeout_ms}ms")]
    SubprocessTimeout { provider: String, timeout_ms: u64 },

    #[error("provider '{provider}' failed{}: {detail}", .exit_code.map(|c| format!(" with exit code {}", c)).unwrap_or_default())]
    SubprocessFailure {
        provider: String,
        exit_code: Option<i32>,
        detail: String,
    },

    /// Quota file or usage log could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("no provider can take a {estimated_tokens}-token task: {}", .reasons.join("; "))]
    NoEligibleProvider {
        estimated_tokens: u64,
        reasons: Vec<String>,
    },

    #[error("invalid command template for '{provider}': {reason}")]
    CommandTemplate { provider: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DelegationError {
    /// Exit code the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DelegationError::UnknownProvider(_)
            | DelegationError::QuotaExceeded { .. }
            | DelegationError::ProviderUnavailable { .. }
            | DelegationError::NoEligibleProvider { .. } => EXIT_PREFLIGHT_REJECTED,
            DelegationError::SubprocessTimeout { .. }
            | DelegationError::SubprocessFailure { .. }
            | DelegationError::Persistence(_) => EXIT_DISPATCH_FAILURE,
            DelegationError::CommandTemplate { .. } | DelegationError::Config(_) => {
                EXIT_CONFIG_ERROR
            }
        }
    }

    /// Rejected before any provider process ran.
    pub fn is_preflight(&self) -> bool {
        self.exit_code() == EXIT_PREFLIGHT_REJECTED
    }
}

impl From<RegistryError> for DelegationError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownProvider(name) => DelegationError::UnknownProvider(name),
            other => DelegationError::Config(ConfigError::Registry(other)),
        }
    }
}

impl From<UsageLogError> for DelegationError {
    fn from(err: UsageLogError) -> Self {
        DelegationError::Persistence(err.to_string())
    }
}

impl From<QuotaError> for DelegationError {
    fn from(err: QuotaError) -> Self {
        DelegationError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DelegationError::UnknownProvider("x".into()).exit_code(), 2);
        assert_eq!(
            DelegationError::SubprocessTimeout {
                provider: "gemini".into(),
                timeout_ms: 10
            }
            .exit_code(),
            1
        );
        assert_eq!(
            DelegationError::CommandTemplate {
                provider: "gemini".into(),
                reason: "bad".into()
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn test_messages() {
        let err = DelegationError::SubprocessFailure {
            provider: "qwen".into(),
            exit_code: Some(2),
            detail: "boom".into(),
        };
        assert_eq!(err.to_string(), "provider 'qwen' failed with exit code 2: boom");

        let err = DelegationError::NoEligibleProvider {
            estimated_tokens: 50_000,
            reasons: vec!["qwen: context window too small".into(), "gemini: rpm".into()],
        };
        assert!(err.to_string().contains("qwen: context window too small; gemini: rpm"));
    }

    #[test]
    fn test_registry_conversion() {
        let err: DelegationError = RegistryError::UnknownProvider("nope".into()).into();
        assert!(matches!(err, DelegationError::UnknownProvider(ref n) if n == "nope"));
        assert!(err.is_preflight());
    }
}
