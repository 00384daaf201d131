use crate::usage::record::ErrorKind;

/// Convert an error kind into the stable label used in reports and CLI output.
pub fn error_kind_label(kind: &ErrorKind) -> &'static str {
    match kind {
        ErrorKind::UnknownProvider => "unknown_provider",
        ErrorKind::NoEligibleProvider => "no_eligible_provider",
        ErrorKind::QuotaExceeded => "quota_exceeded",
        ErrorKind::ProviderUnavailable => "provider_unavailable",
        ErrorKind::SpawnFailure => "spawn_failure",
        ErrorKind::Timeout => "timeout",
        ErrorKind::ExitFailure => "exit_failure",
    }
}
