use std::time::Duration;

use serde::Serialize;

use crate::budget::RequestEstimate;
use crate::error::{EXIT_DISPATCH_FAILURE, EXIT_OK, EXIT_PREFLIGHT_REJECTED};
use crate::usage::ErrorKind;

/// A task to hand to a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegationRequest {
    pub prompt: String,
    /// Paths, directories or glob patterns.
    pub files: Vec<String>,
    /// Selection hint for automatic routing (`large_context`, `fast`, `cheap`).
    pub requirement: Option<String>,
    /// Provider id or alias; `None` or `"auto"` selects automatically.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub timeout: Option<Duration>,
    /// Run the provider's auth check before dispatching.
    pub check_auth: bool,
}

impl DelegationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirement = Some(requirement.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_auth_check(mut self) -> Self {
        self.check_auth = true;
        self
    }
}

/// Outcome of a dispatch. Quota and usage bookkeeping is complete when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationResult {
    pub provider_id: String,
    pub model: Option<String>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub estimated_tokens: u64,
    pub actual_tokens: Option<u64>,
    pub elapsed_ms: u64,
    pub error_kind: Option<ErrorKind>,
    /// Limiting metric, exit detail, or spawn error.
    pub detail: Option<String>,
    pub truncated: bool,
}

impl DelegationResult {
    /// A result for a task that never reached a provider process.
    pub fn rejected(
        provider_id: impl Into<String>,
        model: Option<String>,
        estimated_tokens: u64,
        elapsed_ms: u64,
        kind: ErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            model,
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            estimated_tokens,
            actual_tokens: None,
            elapsed_ms,
            error_kind: Some(kind),
            detail: Some(detail.into()),
            truncated: false,
        }
    }

    /// One-line classification: `OK`, `BLOCKED: quota (...)`, `FAILED: exit 2`, ...
    pub fn status_line(&self) -> String {
        let detail = self.detail.as_deref().unwrap_or("");
        let with_detail = |head: &str| {
            if detail.is_empty() {
                head.to_string()
            } else {
                format!("{} ({})", head, detail)
            }
        };

        match self.error_kind {
            None if self.success => "OK".to_string(),
            None => with_detail("FAILED"),
            Some(ErrorKind::QuotaExceeded) => with_detail("BLOCKED: quota"),
            Some(ErrorKind::UnknownProvider) => with_detail("BLOCKED: unknown provider"),
            Some(ErrorKind::NoEligibleProvider) => with_detail("BLOCKED: no eligible provider"),
            Some(ErrorKind::ProviderUnavailable) => with_detail("BLOCKED: provider unavailable"),
            Some(ErrorKind::Timeout) => with_detail("FAILED: timeout"),
            Some(ErrorKind::SpawnFailure) => with_detail("FAILED: spawn"),
            Some(ErrorKind::ExitFailure) => match self.exit_code {
                Some(code) => format!("FAILED: exit {}", code),
                None => with_detail("FAILED: exit"),
            },
        }
    }

    /// Process exit code the CLI reports for this result.
    pub fn process_exit_code(&self) -> i32 {
        match self.error_kind {
            None if self.success => EXIT_OK,
            Some(kind) if kind.is_preflight() && kind != ErrorKind::SpawnFailure => {
                EXIT_PREFLIGHT_REJECTED
            }
            _ => EXIT_DISPATCH_FAILURE,
        }
    }
}

/// Result of a provider auth check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub provider_id: String,
    pub available: bool,
    pub detail: String,
}

/// What a dispatch would do, without reserving quota or spawning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRun {
    pub provider_id: String,
    pub model: String,
    pub argv: Vec<String>,
    pub estimate: RequestEstimate,
    pub allowed: bool,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(kind: Option<ErrorKind>, exit_code: Option<i32>) -> DelegationResult {
        DelegationResult {
            provider_id: "gemini".to_string(),
            model: None,
            success: kind.is_none(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
            estimated_tokens: 100,
            actual_tokens: None,
            elapsed_ms: 5,
            error_kind: kind,
            detail: None,
            truncated: false,
        }
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(finished(None, Some(0)).status_line(), "OK");
        assert_eq!(
            finished(Some(ErrorKind::ExitFailure), Some(2)).status_line(),
            "FAILED: exit 2"
        );
        assert_eq!(finished(Some(ErrorKind::Timeout), None).status_line(), "FAILED: timeout");

        let blocked = DelegationResult::rejected(
            "gemini",
            None,
            100,
            0,
            ErrorKind::QuotaExceeded,
            "requests/day limit reached: 2 used + 1 requested > 2",
        );
        assert_eq!(
            blocked.status_line(),
            "BLOCKED: quota (requests/day limit reached: 2 used + 1 requested > 2)"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(finished(None, Some(0)).process_exit_code(), 0);
        assert_eq!(finished(Some(ErrorKind::Timeout), None).process_exit_code(), 1);
        assert_eq!(finished(Some(ErrorKind::SpawnFailure), None).process_exit_code(), 1);
        assert_eq!(finished(Some(ErrorKind::QuotaExceeded), None).process_exit_code(), 2);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(finished(Some(ErrorKind::Timeout), None)).unwrap();
        assert_eq!(json["providerId"], "gemini");
        assert_eq!(json["errorKind"], "timeout");
    }
}
