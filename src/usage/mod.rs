//! Usage logging for delegated tasks.
//!
//! Every dispatch attempt, successful or not, is appended to a JSONL log.
//! The log is independent of quota accounting and is the source from which
//! quota counters can be rebuilt.

pub mod labels;
pub mod log;
pub mod record;
pub mod report;

pub use labels::error_kind_label;
pub use log::{LogIssue, UsageLog, UsageLogError, UsageLogResult};
pub use record::{generate_session_id, ErrorKind, UsageRecord};
pub use report::{ProviderUsage, UsageSummary};
