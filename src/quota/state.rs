//! Rolling-window counters derived from charged entries.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::limits::{QuotaMetric, WindowMode};

/// Longest window any counter covers; older entries are never counted.
pub const RETENTION_HOURS: i64 = 24;

/// One charged request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub timestamp: DateTime<Utc>,
    pub tokens: u64,
}

impl QuotaEntry {
    pub fn new(timestamp: DateTime<Utc>, tokens: u64) -> Self {
        Self { timestamp, tokens }
    }
}

/// Counters for the current minute and day windows.
///
/// This is a view over the retained entries, recomputed on every mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    pub minute_start: DateTime<Utc>,
    pub requests_this_minute: u64,
    pub tokens_this_minute: u64,
    pub day_start: DateTime<Utc>,
    pub requests_today: u64,
    pub tokens_today: u64,
}

impl QuotaState {
    /// Zero counters with windows anchored at `now`.
    pub fn empty(now: DateTime<Utc>, mode: WindowMode) -> Self {
        let (minute_start, day_start) = window_starts(now, mode);
        Self {
            minute_start,
            requests_this_minute: 0,
            tokens_this_minute: 0,
            day_start,
            requests_today: 0,
            tokens_today: 0,
        }
    }

    /// Sum the entries that fall inside each window.
    pub fn from_entries<'a, I>(entries: I, now: DateTime<Utc>, mode: WindowMode) -> Self
    where
        I: IntoIterator<Item = &'a QuotaEntry>,
    {
        let mut state = Self::empty(now, mode);
        for entry in entries {
            if entry.timestamp >= state.day_start {
                state.requests_today = state.requests_today.saturating_add(1);
                state.tokens_today = state.tokens_today.saturating_add(entry.tokens);
            }
            if entry.timestamp >= state.minute_start {
                state.requests_this_minute = state.requests_this_minute.saturating_add(1);
                state.tokens_this_minute = state.tokens_this_minute.saturating_add(entry.tokens);
            }
        }
        state
    }

    /// Current value of `metric`.
    pub fn value(&self, metric: QuotaMetric) -> u64 {
        match metric {
            QuotaMetric::RequestsPerMinute => self.requests_this_minute,
            QuotaMetric::RequestsPerDay => self.requests_today,
            QuotaMetric::TokensPerMinute => self.tokens_this_minute,
            QuotaMetric::TokensPerDay => self.tokens_today,
        }
    }
}

/// Start of the minute and day windows containing `now`.
pub fn window_starts(now: DateTime<Utc>, mode: WindowMode) -> (DateTime<Utc>, DateTime<Utc>) {
    match mode {
        WindowMode::Fixed => {
            let minute = now
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            let day = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc())
                .unwrap_or(now);
            (minute, day)
        }
        WindowMode::Sliding => (now - Duration::seconds(60), now - Duration::hours(RETENTION_HOURS)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_fixed_window_starts() {
        let (minute, day) = window_starts(at(10, 15, 42), WindowMode::Fixed);
        assert_eq!(minute, at(10, 15, 0));
        assert_eq!(day, at(0, 0, 0));
    }

    #[test]
    fn test_sliding_window_starts() {
        let now = at(10, 15, 42);
        let (minute, day) = window_starts(now, WindowMode::Sliding);
        assert_eq!(minute, at(10, 14, 42));
        assert_eq!(day, now - Duration::hours(24));
    }

    #[test]
    fn test_from_entries_buckets_by_window() {
        let now = at(10, 15, 30);
        let entries = vec![
            QuotaEntry::new(at(10, 15, 5), 100),
            QuotaEntry::new(at(10, 14, 59), 50),
            QuotaEntry::new(at(1, 0, 0), 25),
            // Yesterday: outside both fixed windows.
            QuotaEntry::new(at(0, 0, 0) - Duration::minutes(1), 1_000),
        ];

        let state = QuotaState::from_entries(&entries, now, WindowMode::Fixed);

        assert_eq!(state.requests_this_minute, 1);
        assert_eq!(state.tokens_this_minute, 100);
        assert_eq!(state.requests_today, 3);
        assert_eq!(state.tokens_today, 175);
    }

    #[test]
    fn test_sliding_counts_across_minute_boundary() {
        let now = at(10, 15, 30);
        let entries = vec![QuotaEntry::new(at(10, 14, 59), 50)];

        let fixed = QuotaState::from_entries(&entries, now, WindowMode::Fixed);
        let sliding = QuotaState::from_entries(&entries, now, WindowMode::Sliding);

        assert_eq!(fixed.requests_this_minute, 0);
        assert_eq!(sliding.requests_this_minute, 1);
    }

    #[test]
    fn test_serializes_camel_case_schema() {
        let state = QuotaState::empty(at(10, 15, 30), WindowMode::Fixed);
        let json = serde_json::to_value(state).expect("serialize");

        for key in [
            "minuteStart",
            "requestsThisMinute",
            "tokensThisMinute",
            "dayStart",
            "requestsToday",
            "tokensToday",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }
}
