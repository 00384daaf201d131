//! Per-provider quota ceilings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How the per-minute and per-day windows are measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Counters reset at wall-clock boundaries (start of the UTC minute and
    /// UTC calendar day). A burst straddling a boundary can reach up to twice
    /// the per-window rate.
    #[default]
    Fixed,
    /// Counters cover the trailing 60 seconds and trailing 24 hours.
    Sliding,
}

/// One of the four metrics a provider can be limited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMetric {
    RequestsPerMinute,
    RequestsPerDay,
    TokensPerMinute,
    TokensPerDay,
}

impl QuotaMetric {
    pub const ALL: [QuotaMetric; 4] = [
        QuotaMetric::RequestsPerMinute,
        QuotaMetric::RequestsPerDay,
        QuotaMetric::TokensPerMinute,
        QuotaMetric::TokensPerDay,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            QuotaMetric::RequestsPerMinute => "requests/minute",
            QuotaMetric::RequestsPerDay => "requests/day",
            QuotaMetric::TokensPerMinute => "tokens/minute",
            QuotaMetric::TokensPerDay => "tokens/day",
        }
    }
}

impl fmt::Display for QuotaMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ceilings for a single provider. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub requests_per_minute: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,

    /// Fraction of a ceiling at which advisory warnings start (0.0 - 1.0).
    pub warning_threshold: f64,

    pub window: WindowMode,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl QuotaLimits {
    /// No ceilings; warnings at 80% if ceilings are added later.
    pub fn unlimited() -> Self {
        Self {
            requests_per_minute: None,
            requests_per_day: None,
            tokens_per_minute: None,
            tokens_per_day: None,
            warning_threshold: 0.8,
            window: WindowMode::Fixed,
        }
    }

    /// Gemini CLI free tier.
    pub fn gemini_free_tier() -> Self {
        Self {
            requests_per_minute: Some(60),
            requests_per_day: Some(1_000),
            tokens_per_minute: Some(32_000),
            tokens_per_day: Some(1_000_000),
            ..Self::unlimited()
        }
    }

    /// Qwen Code free tier.
    pub fn qwen_free_tier() -> Self {
        Self {
            requests_per_minute: Some(60),
            requests_per_day: Some(2_000),
            ..Self::unlimited()
        }
    }

    pub fn with_requests_per_minute(mut self, limit: u64) -> Self {
        self.requests_per_minute = Some(limit);
        self
    }

    pub fn with_requests_per_day(mut self, limit: u64) -> Self {
        self.requests_per_day = Some(limit);
        self
    }

    pub fn with_tokens_per_minute(mut self, limit: u64) -> Self {
        self.tokens_per_minute = Some(limit);
        self
    }

    pub fn with_tokens_per_day(mut self, limit: u64) -> Self {
        self.tokens_per_day = Some(limit);
        self
    }

    /// Set the warning threshold.
    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_window(mut self, window: WindowMode) -> Self {
        self.window = window;
        self
    }

    /// Ceiling for `metric`, if any.
    pub fn limit_for(&self, metric: QuotaMetric) -> Option<u64> {
        match metric {
            QuotaMetric::RequestsPerMinute => self.requests_per_minute,
            QuotaMetric::RequestsPerDay => self.requests_per_day,
            QuotaMetric::TokensPerMinute => self.tokens_per_minute,
            QuotaMetric::TokensPerDay => self.tokens_per_day,
        }
    }

    /// Check if any ceiling is configured.
    pub fn is_enabled(&self) -> bool {
        QuotaMetric::ALL.iter().any(|m| self.limit_for(*m).is_some())
    }

    /// Reject values that would make admission meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.warning_threshold > 0.0 && self.warning_threshold <= 1.0) {
            return Err(format!(
                "warning_threshold must be in (0, 1], got {}",
                self.warning_threshold
            ));
        }
        for metric in QuotaMetric::ALL {
            if self.limit_for(metric) == Some(0) {
                return Err(format!(
                    "{} limit of 0 blocks every request; omit it for unlimited",
                    metric
                ));
            }
        }
        Ok(())
    }
}
