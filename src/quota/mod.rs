//! Per-provider quota tracking.
//!
//! # Overview
//!
//! - **QuotaLimits**: requests/tokens ceilings per minute and per day
//! - **QuotaState**: counters for the current windows, derived from charged entries
//! - **QuotaStore**: one JSON file per provider, written atomically
//! - **QuotaTracker**: admission checks, reservations, recording, cleanup
//!
//! # Example
//!
//! ```ignore
//! use conjure::quota::{QuotaLimits, QuotaTracker};
//!
//! let limits = QuotaLimits::unlimited().with_requests_per_minute(5);
//! let mut tracker = QuotaTracker::new("gemini", limits);
//!
//! if tracker.can_handle(1_200).allowed {
//!     tracker.record_request(1_200, None);
//! }
//! println!("{}", tracker.get_quota_status().format());
//! ```

mod limits;
mod state;
mod store;
mod tracker;

pub use limits::{QuotaLimits, QuotaMetric, WindowMode};
pub use state::{window_starts, QuotaEntry, QuotaState, RETENTION_HOURS};
pub use store::{
    LoadOutcome, PendingReservation, QuotaError, QuotaFile, QuotaResult, QuotaStore, StoreLock,
};
pub use tracker::{
    Admission, LoadStatus, MetricStatus, QuotaLevel, QuotaStatus, QuotaTracker, Reservation,
    SharedQuotaTracker,
};
