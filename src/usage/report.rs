//! Aggregation of usage records into a human-readable summary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::labels::error_kind_label;
use crate::usage::record::UsageRecord;

/// Per-provider slice of a [`UsageSummary`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub attempts: u64,
    pub successes: u64,
    pub estimated_tokens: u64,
    pub charged_tokens: u64,
    pub total_duration_ms: u64,
}

impl ProviderUsage {
    fn add(&mut self, record: &UsageRecord) {
        self.attempts += 1;
        if record.success {
            self.successes += 1;
        }
        self.estimated_tokens = self.estimated_tokens.saturating_add(record.estimated_tokens);
        if record.charges_quota() {
            self.charged_tokens = self.charged_tokens.saturating_add(record.charged_tokens());
        }
        self.total_duration_ms = self.total_duration_ms.saturating_add(record.duration_ms);
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

/// Summary of the usage log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub since: Option<DateTime<Utc>>,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub estimated_tokens: u64,
    pub actual_tokens: u64,
    /// Attempts that reported an actual token count.
    pub attempts_with_actual: u64,
    pub average_duration_ms: f64,
    pub by_provider: BTreeMap<String, ProviderUsage>,
    pub by_error: BTreeMap<String, u64>,
    /// Appends that failed in this process.
    pub write_errors: u64,
}

impl UsageSummary {
    pub fn from_records(records: &[UsageRecord]) -> Self {
        let mut summary = Self::default();
        let mut total_duration: u64 = 0;

        for record in records {
            summary.attempts += 1;
            if record.success {
                summary.successes += 1;
            } else {
                summary.failures += 1;
            }
            summary.estimated_tokens = summary.estimated_tokens.saturating_add(record.estimated_tokens);
            if let Some(actual) = record.actual_tokens {
                summary.actual_tokens = summary.actual_tokens.saturating_add(actual);
                summary.attempts_with_actual += 1;
            }
            total_duration = total_duration.saturating_add(record.duration_ms);

            summary
                .by_provider
                .entry(record.provider_id.clone())
                .or_default()
                .add(record);
            if let Some(kind) = &record.error_kind {
                *summary
                    .by_error
                    .entry(error_kind_label(kind).to_string())
                    .or_insert(0) += 1;
            }
        }

        if summary.attempts > 0 {
            summary.average_duration_ms = total_duration as f64 / summary.attempts as f64;
        }
        summary
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }

    /// Format as a human-readable string.
    pub fn format(&self) -> String {
        let mut output = String::from("## Delegation Usage\n\n");

        if let Some(since) = self.since {
            output.push_str(&format!("**Since**: {}\n", since.to_rfc3339()));
        }
        output.push_str(&format!(
            "**Attempts**: {} ({} succeeded, {} failed)\n",
            self.attempts, self.successes, self.failures
        ));
        output.push_str(&format!(
            "**Success Rate**: {:.1}%\n",
            self.success_rate() * 100.0
        ));
        output.push_str(&format!("**Estimated Tokens**: {}\n", self.estimated_tokens));
        if self.attempts_with_actual > 0 {
            output.push_str(&format!(
                "**Reported Tokens**: {} (from {} attempts)\n",
                self.actual_tokens, self.attempts_with_actual
            ));
        }
        output.push_str(&format!(
            "**Average Duration**: {:.2}s\n",
            self.average_duration_ms / 1000.0
        ));

        if !self.by_provider.is_empty() {
            output.push_str("\n### Providers\n");
            for (provider, usage) in &self.by_provider {
                output.push_str(&format!(
                    "- **{}**: {} attempts, {:.1}% success, {} tokens charged\n",
                    provider,
                    usage.attempts,
                    usage.success_rate() * 100.0,
                    usage.charged_tokens
                ));
            }
        }

        if !self.by_error.is_empty() {
            output.push_str("\n### Failures\n");
            let mut errors: Vec<_> = self.by_error.iter().collect();
            errors.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            for (kind, count) in errors {
                output.push_str(&format!("- **{}**: {}\n", kind, count));
            }
        }

        if self.write_errors > 0 {
            output.push_str(&format!(
                "\n**Log write errors this session**: {}\n",
                self.write_errors
            ));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::record::ErrorKind;

    #[test]
    fn test_empty_summary() {
        let summary = UsageSummary::from_records(&[]);
        assert_eq!(summary.attempts, 0);
        assert_eq!(summary.success_rate(), 0.0);
        assert_eq!(summary.average_duration_ms, 0.0);
    }

    #[test]
    fn test_aggregates_across_providers() {
        let records = vec![
            UsageRecord::success("gemini", 1000, 2000).with_actual_tokens(Some(900)),
            UsageRecord::failure("gemini", 500, 4000, ErrorKind::Timeout),
            UsageRecord::failure("qwen", 300, 0, ErrorKind::QuotaExceeded),
        ];

        let summary = UsageSummary::from_records(&records);

        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.estimated_tokens, 1800);
        assert_eq!(summary.actual_tokens, 900);
        assert_eq!(summary.average_duration_ms, 2000.0);

        let gemini = &summary.by_provider["gemini"];
        assert_eq!(gemini.attempts, 2);
        assert_eq!(gemini.charged_tokens, 1400);

        // Quota rejections are logged but not charged.
        assert_eq!(summary.by_provider["qwen"].charged_tokens, 0);
        assert_eq!(summary.by_error["timeout"], 1);
        assert_eq!(summary.by_error["quota_exceeded"], 1);
    }

    #[test]
    fn test_format_lists_failures() {
        let records = vec![UsageRecord::failure("gemini", 10, 10, ErrorKind::ExitFailure)];
        let text = UsageSummary::from_records(&records).format();

        assert!(text.contains("**Attempts**: 1 (0 succeeded, 1 failed)"));
        assert!(text.contains("exit_failure"));
    }
}
