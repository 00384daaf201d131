use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::usage::record::UsageRecord;
use crate::usage::report::UsageSummary;

/// Errors that can occur while reading or writing the usage log.
#[derive(Error, Debug)]
pub enum UsageLogError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for usage log operations.
pub type UsageLogResult<T> = Result<T, UsageLogError>;

/// A malformed line found by [`UsageLog::validate`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LogIssue {
    /// 1-based line number.
    pub line: usize,
    pub message: String,
}

/// Append-only JSONL log of dispatch attempts.
///
/// Writes are best-effort: a failed append is logged and counted, never
/// returned to the caller.
#[derive(Debug)]
pub struct UsageLog {
    path: PathBuf,
    write_lock: Mutex<()>,
    write_errors: AtomicU64,
}

impl UsageLog {
    /// Create a logger writing to `path`. The file is created lazily on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            write_errors: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of appends that failed since this logger was created.
    pub fn error_count(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    /// Append a record. Failures are recorded, not propagated.
    pub fn log_attempt(&self, record: &UsageRecord) {
        if let Err(err) = self.try_append(record) {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                path = %self.path.display(),
                provider = %record.provider_id,
                error = %err,
                "failed to append usage record"
            );
        }
    }

    fn try_append(&self, record: &UsageRecord) -> UsageLogResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // One write per line so concurrent appenders never interleave partial lines.
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        debug!(provider = %record.provider_id, success = record.success, "usage record appended");
        Ok(())
    }

    /// Read all well-formed records, optionally only those at or after `since`.
    ///
    /// A missing log is empty. Malformed lines are skipped.
    pub fn records(&self, since: Option<DateTime<Utc>>) -> UsageLogResult<Vec<UsageRecord>> {
        let mut records = Vec::new();
        self.scan(|_, parsed| {
            if let Ok(record) = parsed {
                if since.map_or(true, |cutoff| record.timestamp >= cutoff) {
                    records.push(record);
                }
            }
        })?;
        Ok(records)
    }

    /// Aggregate the log into a summary.
    pub fn report(&self, since: Option<DateTime<Utc>>) -> UsageLogResult<UsageSummary> {
        let records = self.records(since)?;
        let mut summary = UsageSummary::from_records(&records);
        summary.since = since;
        summary.write_errors = self.error_count();
        Ok(summary)
    }

    /// List malformed lines without aborting on the first one.
    pub fn validate(&self) -> UsageLogResult<Vec<LogIssue>> {
        let mut issues = Vec::new();
        self.scan(|line, parsed| {
            if let Err(message) = parsed {
                issues.push(LogIssue { line, message });
            }
        })?;
        Ok(issues)
    }

    fn scan<F>(&self, mut visit: F) -> UsageLogResult<()>
    where
        F: FnMut(usize, Result<UsageRecord, String>),
    {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(UsageLogError::Io(err)),
        };

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line_no = index + 1;
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    visit(line_no, Err(format!("unreadable line: {}", err)));
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<UsageRecord>(&line).map_err(|e| e.to_string());
            visit(line_no, parsed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::record::ErrorKind;
    use chrono::Duration;
    use tempfile::TempDir;

    fn log_in(dir: &TempDir) -> UsageLog {
        UsageLog::new(dir.path().join("logs").join("usage.jsonl"))
    }

    #[test]
    fn test_append_creates_parent_dirs_and_one_line_per_record() {
        let dir = TempDir::new().expect("temp dir");
        let log = log_in(&dir);

        log.log_attempt(&UsageRecord::success("gemini", 100, 20));
        log.log_attempt(&UsageRecord::failure("gemini", 50, 10, ErrorKind::Timeout));

        let content = fs::read_to_string(log.path()).expect("read log");
        assert_eq!(content.lines().count(), 2);
        assert_eq!(log.error_count(), 0);
    }

    #[test]
    fn test_missing_log_reads_as_empty() {
        let dir = TempDir::new().expect("temp dir");
        let log = log_in(&dir);

        assert!(log.records(None).expect("records").is_empty());
        assert!(log.validate().expect("validate").is_empty());
    }

    #[test]
    fn test_validate_reports_malformed_lines_and_keeps_going() {
        let dir = TempDir::new().expect("temp dir");
        let log = log_in(&dir);
        log.log_attempt(&UsageRecord::success("gemini", 100, 20));
        {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(log.path())
                .expect("open");
            writeln!(file, "not json").expect("write");
            writeln!(file, "{{\"providerId\": \"x\"}}").expect("write");
        }
        log.log_attempt(&UsageRecord::success("qwen", 10, 5));

        let issues = log.validate().expect("validate");
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].line, 2);
        assert_eq!(issues[1].line, 3);

        let records = log.records(None).expect("records");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_records_since_filters_old_entries() {
        let dir = TempDir::new().expect("temp dir");
        let log = log_in(&dir);
        let now = Utc::now();
        log.log_attempt(&UsageRecord::success("gemini", 1, 1).with_timestamp(now - Duration::hours(3)));
        log.log_attempt(&UsageRecord::success("gemini", 2, 1).with_timestamp(now));

        let recent = log.records(Some(now - Duration::hours(1))).expect("records");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].estimated_tokens, 2);
    }

    #[test]
    fn test_unwritable_path_is_counted_not_raised() {
        let dir = TempDir::new().expect("temp dir");
        // A directory where the log file should be makes every append fail.
        let path = dir.path().join("usage.jsonl");
        fs::create_dir_all(&path).expect("mkdir");
        let log = UsageLog::new(&path);

        log.log_attempt(&UsageRecord::success("gemini", 1, 1));
        log.log_attempt(&UsageRecord::success("gemini", 1, 1));

        assert_eq!(log.error_count(), 2);
    }

    #[test]
    fn test_report_counts_write_errors() {
        let dir = TempDir::new().expect("temp dir");
        let log = log_in(&dir);
        log.log_attempt(&UsageRecord::success("gemini", 100, 20));
        log.log_attempt(&UsageRecord::failure("gemini", 100, 40, ErrorKind::ExitFailure));

        let summary = log.report(None).expect("report");
        assert_eq!(summary.attempts, 2);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.write_errors, 0);
    }
}
