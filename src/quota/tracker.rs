//! Quota tracking and admission control for a single provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::limits::{QuotaLimits, QuotaMetric};
use super::state::{QuotaEntry, QuotaState, RETENTION_HOURS};
use super::store::{LoadOutcome, PendingReservation, QuotaFile, QuotaStore, StoreLock};
use crate::usage::UsageRecord;

/// Level of a single metric or of a whole provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QuotaLevel {
    /// Every counter below its warning threshold.
    Available,
    /// At least one counter at or above its warning threshold.
    Warning,
    /// At least one counter at or above its ceiling.
    Exhausted,
}

impl QuotaLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaLevel::Available => "AVAILABLE",
            QuotaLevel::Warning => "WARNING",
            QuotaLevel::Exhausted => "EXHAUSTED",
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Why the task was rejected.
    pub reason: Option<String>,
    /// The first metric whose ceiling the task would exceed.
    pub metric: Option<QuotaMetric>,
}

impl Admission {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            metric: None,
        }
    }

    pub fn reject(metric: QuotaMetric, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            metric: Some(metric),
        }
    }
}

/// Capacity held between admission and completion of a dispatch.
///
/// Must be handed back through [`QuotaTracker::commit`] or [`QuotaTracker::release`].
#[derive(Debug)]
#[must_use = "a reservation holds quota until committed or released"]
pub struct Reservation {
    id: u64,
    tokens: u64,
}

impl Reservation {
    pub fn tokens(&self) -> u64 {
        self.tokens
    }
}

/// Status of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStatus {
    pub metric: QuotaMetric,
    pub used: u64,
    pub limit: Option<u64>,
    /// `used / limit`, 0.0 when unlimited.
    pub fraction: f64,
    pub level: QuotaLevel,
}

/// Snapshot of a provider's quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub provider_id: String,
    pub level: QuotaLevel,
    pub state: QuotaState,
    pub metrics: Vec<MetricStatus>,
    pub warnings: Vec<String>,
}

impl QuotaStatus {
    /// Format as a human-readable string.
    pub fn format(&self) -> String {
        let mut output = format!("{} [{}]\n", self.provider_id, self.level.as_str());
        for status in &self.metrics {
            match status.limit {
                Some(limit) => output.push_str(&format!(
                    "  {:<16} {}/{} ({:.1}%)\n",
                    status.metric.label(),
                    status.used,
                    limit,
                    status.fraction * 100.0
                )),
                None => output.push_str(&format!(
                    "  {:<16} {} (unlimited)\n",
                    status.metric.label(),
                    status.used
                )),
            }
        }
        for warning in &self.warnings {
            output.push_str(&format!("  ! {}\n", warning));
        }
        output
    }
}

/// How the tracker's state was initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// Not backed by a file.
    InMemory,
    Loaded,
    Missing,
    Corrupt,
}

impl LoadStatus {
    /// Whether counters should be re-derived from the usage log.
    pub fn needs_replay(&self) -> bool {
        matches!(self, LoadStatus::Missing | LoadStatus::Corrupt)
    }
}

/// Most persistence problems kept for status output; older ones are dropped.
const MAX_PERSISTENCE_WARNINGS: usize = 8;

/// How long a reservation stays visible to other processes when the caller
/// gives no hold time.
const DEFAULT_RESERVATION_HOLD_MINUTES: i64 = 10;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// A reservation held by this tracker.
#[derive(Debug, Clone, Copy)]
struct Held {
    tokens: u64,
    expires_at: DateTime<Utc>,
}

/// Rolling request and token counters for one provider.
///
/// The retained entries are the tracker's state; [`QuotaState`] counters are
/// recomputed from them. When backed by a [`QuotaStore`] the file is shared
/// with other processes: every admission and mutation takes the file lock,
/// reloads the file, applies the change and writes it back, and outstanding
/// reservations are written too so overlapping dispatches see each other.
#[derive(Debug)]
pub struct QuotaTracker {
    provider_id: String,
    limits: QuotaLimits,
    store: Option<QuotaStore>,
    /// Identifies this instance's reservations in the shared file.
    holder: String,
    entries: Vec<QuotaEntry>,
    /// Entries recorded here whose last save failed.
    unsynced: Vec<QuotaEntry>,
    /// Outstanding reservations by id.
    reservations: HashMap<u64, Held>,
    /// Reservations other instances hold, as of the last reload.
    foreign: Vec<PendingReservation>,
    next_reservation: u64,
    load_status: LoadStatus,
    persistence_warnings: Vec<String>,
    cleanup_interval: Duration,
    last_cleanup: Option<DateTime<Utc>>,
}

impl QuotaTracker {
    /// Create an in-memory tracker.
    pub fn new(provider_id: impl Into<String>, limits: QuotaLimits) -> Self {
        Self {
            provider_id: provider_id.into(),
            limits,
            store: None,
            holder: format!(
                "{}-{}",
                std::process::id(),
                NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
            ),
            entries: Vec::new(),
            unsynced: Vec::new(),
            reservations: HashMap::new(),
            foreign: Vec::new(),
            next_reservation: 0,
            load_status: LoadStatus::InMemory,
            persistence_warnings: Vec::new(),
            cleanup_interval: Duration::hours(1),
            last_cleanup: None,
        }
    }

    /// Create a tracker backed by `store`, loading any persisted entries.
    ///
    /// A missing or malformed file yields zero counters; the latter is
    /// recorded as a persistence warning.
    pub fn open(provider_id: impl Into<String>, limits: QuotaLimits, store: QuotaStore) -> Self {
        Self::open_at(provider_id, limits, store, Utc::now())
    }

    pub fn open_at(
        provider_id: impl Into<String>,
        limits: QuotaLimits,
        store: QuotaStore,
        now: DateTime<Utc>,
    ) -> Self {
        let mut tracker = Self::new(provider_id, limits);
        tracker.store = Some(store);
        let _lock = tracker.lock_store();
        tracker.load_status = tracker.reload();
        if tracker.load_status == LoadStatus::Corrupt {
            warn!(provider = %tracker.provider_id, "quota file unreadable; starting from zero");
        }
        tracker.run_cleanup(now, RETENTION_HOURS as u64);
        tracker
    }

    /// Set how often old entries are pruned during recording.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    pub fn load_status(&self) -> &LoadStatus {
        &self.load_status
    }

    /// Persistence problems seen so far (load and save), without repeats.
    pub fn persistence_warnings(&self) -> &[String] {
        &self.persistence_warnings
    }

    /// Number of charged entries currently retained.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Charged entries, oldest first.
    pub fn entries(&self) -> &[QuotaEntry] {
        &self.entries
    }

    /// Pick up entries and reservations written by other processes.
    pub fn refresh(&mut self) {
        if self.store.is_some() {
            self.reload();
        }
    }

    /// Current counters.
    pub fn state(&self) -> QuotaState {
        self.state_at(Utc::now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> QuotaState {
        QuotaState::from_entries(&self.entries, now, self.limits.window)
    }

    /// Check whether a task of `estimated_tokens` may run now. Does not mutate state.
    pub fn can_handle(&self, estimated_tokens: u64) -> Admission {
        self.can_handle_at(estimated_tokens, Utc::now())
    }

    pub fn can_handle_at(&self, estimated_tokens: u64, now: DateTime<Utc>) -> Admission {
        let state = self.state_at(now);
        let foreign = self.foreign.iter().filter(|p| p.expires_at > now);
        let pending_requests = (self.reservations.len() + foreign.clone().count()) as u64;
        let pending_tokens = self
            .reservations
            .values()
            .map(|held| held.tokens)
            .chain(foreign.map(|p| p.tokens))
            .fold(0u64, |acc, t| acc.saturating_add(t));

        for metric in QuotaMetric::ALL {
            let Some(limit) = self.limits.limit_for(metric) else {
                continue;
            };
            let (used, requested) = match metric {
                QuotaMetric::RequestsPerMinute | QuotaMetric::RequestsPerDay => {
                    (state.value(metric).saturating_add(pending_requests), 1)
                }
                QuotaMetric::TokensPerMinute | QuotaMetric::TokensPerDay => {
                    (state.value(metric).saturating_add(pending_tokens), estimated_tokens)
                }
            };
            if used.saturating_add(requested) > limit {
                return Admission::reject(
                    metric,
                    format!(
                        "{} limit reached: {} used + {} requested > {}",
                        metric.label(),
                        used,
                        requested,
                        limit
                    ),
                );
            }
        }

        Admission::allow()
    }

    /// Admit a task and hold its capacity until [`commit`](Self::commit) or
    /// [`release`](Self::release).
    pub fn try_reserve(&mut self, estimated_tokens: u64) -> Result<Reservation, Admission> {
        self.try_reserve_at(estimated_tokens, Utc::now())
    }

    pub fn try_reserve_at(
        &mut self,
        estimated_tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, Admission> {
        let hold = Duration::minutes(DEFAULT_RESERVATION_HOLD_MINUTES);
        self.try_reserve_for_at(estimated_tokens, hold, now)
    }

    /// Like [`try_reserve`](Self::try_reserve), but other processes stop
    /// counting the reservation after `hold`.
    pub fn try_reserve_for(
        &mut self,
        estimated_tokens: u64,
        hold: Duration,
    ) -> Result<Reservation, Admission> {
        self.try_reserve_for_at(estimated_tokens, hold, Utc::now())
    }

    pub fn try_reserve_for_at(
        &mut self,
        estimated_tokens: u64,
        hold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation, Admission> {
        let _lock = self.lock_store();
        self.refresh();

        let admission = self.can_handle_at(estimated_tokens, now);
        if !admission.allowed {
            return Err(admission);
        }
        let id = self.next_reservation;
        self.next_reservation = self.next_reservation.wrapping_add(1);
        self.reservations.insert(
            id,
            Held {
                tokens: estimated_tokens,
                expires_at: now.checked_add_signed(hold).unwrap_or(now),
            },
        );
        self.persist(now);
        debug!(provider = %self.provider_id, tokens = estimated_tokens, "quota reserved");
        Ok(Reservation {
            id,
            tokens: estimated_tokens,
        })
    }

    /// Turn a reservation into a charged request.
    pub fn commit(&mut self, reservation: Reservation, actual_tokens: Option<u64>) {
        self.commit_at(reservation, actual_tokens, Utc::now());
    }

    /// Charge a reservation at `now`. Use the same instant for the usage
    /// record so a replay lands the attempt in the same window.
    pub fn commit_at(
        &mut self,
        reservation: Reservation,
        actual_tokens: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let _lock = self.lock_store();
        self.refresh();
        self.reservations.remove(&reservation.id);
        self.charge(reservation.tokens, actual_tokens, now);
    }

    /// Drop a reservation without charging anything.
    pub fn release(&mut self, reservation: Reservation) {
        let _lock = self.lock_store();
        self.refresh();
        self.reservations.remove(&reservation.id);
        self.persist(Utc::now());
        debug!(provider = %self.provider_id, tokens = reservation.tokens, "quota reservation released");
    }

    /// Charge one request. Uses `actual_tokens` when known, else the estimate.
    pub fn record_request(&mut self, estimated_tokens: u64, actual_tokens: Option<u64>) {
        self.record_request_at(estimated_tokens, actual_tokens, Utc::now());
    }

    pub fn record_request_at(
        &mut self,
        estimated_tokens: u64,
        actual_tokens: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let _lock = self.lock_store();
        self.refresh();
        self.charge(estimated_tokens, actual_tokens, now);
    }

    /// Insert a charged entry and persist. The caller holds the store lock.
    fn charge(&mut self, estimated_tokens: u64, actual_tokens: Option<u64>, now: DateTime<Utc>) {
        let entry = QuotaEntry::new(now, actual_tokens.unwrap_or(estimated_tokens));
        let index = self.entries.partition_point(|e| e.timestamp <= entry.timestamp);
        self.entries.insert(index, entry);
        if self.store.is_some() {
            self.unsynced.push(entry);
        }

        let due = self
            .last_cleanup
            .map_or(true, |last| now - last >= self.cleanup_interval);
        if due {
            self.prune(now, RETENTION_HOURS as u64);
            self.last_cleanup = Some(now);
        }
        self.persist(now);
    }

    /// Remove entries older than `max_age_hours` and persist. Returns the number removed.
    pub fn cleanup_old_data(&mut self, max_age_hours: u64) -> usize {
        self.cleanup_old_data_at(max_age_hours, Utc::now())
    }

    pub fn cleanup_old_data_at(&mut self, max_age_hours: u64, now: DateTime<Utc>) -> usize {
        let _lock = self.lock_store();
        self.refresh();
        self.run_cleanup(now, max_age_hours)
    }

    fn run_cleanup(&mut self, now: DateTime<Utc>, max_age_hours: u64) -> usize {
        let removed = self.prune(now, max_age_hours);
        self.last_cleanup = Some(now);
        if removed > 0 || self.load_status == LoadStatus::Corrupt {
            self.persist(now);
        }
        removed
    }

    fn prune(&mut self, now: DateTime<Utc>, max_age_hours: u64) -> usize {
        let cutoff = i64::try_from(max_age_hours)
            .ok()
            .and_then(Duration::try_hours)
            .and_then(|age| now.checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|e| e.timestamp >= cutoff);
        self.unsynced.retain(|e| e.timestamp >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(provider = %self.provider_id, removed, "pruned old quota entries");
        }
        removed
    }

    /// Replace the retained entries with those derived from usage log records.
    pub fn rebuild_from_records(&mut self, records: &[UsageRecord]) {
        self.rebuild_from_records_at(records, Utc::now());
    }

    pub fn rebuild_from_records_at(&mut self, records: &[UsageRecord], now: DateTime<Utc>) {
        let _lock = self.lock_store();
        self.refresh();

        let cutoff = now - Duration::hours(RETENTION_HOURS);
        self.entries = records
            .iter()
            .filter(|r| r.provider_id == self.provider_id && r.charges_quota())
            .filter(|r| r.timestamp >= cutoff)
            .map(|r| QuotaEntry::new(r.timestamp, r.charged_tokens()))
            .collect();
        self.entries.sort_by_key(|e| e.timestamp);
        self.unsynced.clear();
        info!(
            provider = %self.provider_id,
            entries = self.entries.len(),
            "quota state rebuilt from usage log"
        );
        self.last_cleanup = Some(now);
        self.persist(now);
    }

    /// Per-metric levels and advisory warnings.
    pub fn get_quota_status(&self) -> QuotaStatus {
        self.get_quota_status_at(Utc::now())
    }

    pub fn get_quota_status_at(&self, now: DateTime<Utc>) -> QuotaStatus {
        let state = self.state_at(now);
        let mut metrics = Vec::with_capacity(QuotaMetric::ALL.len());
        let mut warnings = Vec::new();

        for metric in QuotaMetric::ALL {
            let used = state.value(metric);
            let limit = self.limits.limit_for(metric);
            let fraction = match limit {
                Some(limit) if limit > 0 => used as f64 / limit as f64,
                _ => 0.0,
            };
            let level = self.compute_level(limit, fraction);
            match level {
                QuotaLevel::Exhausted => warnings.push(format!(
                    "{} exhausted ({}/{})",
                    metric.label(),
                    used,
                    limit.unwrap_or(0)
                )),
                QuotaLevel::Warning => warnings.push(format!(
                    "{} at {:.0}%",
                    metric.label(),
                    (fraction * 100.0).floor()
                )),
                QuotaLevel::Available => {}
            }
            metrics.push(MetricStatus {
                metric,
                used,
                limit,
                fraction,
                level,
            });
        }

        for detail in &self.persistence_warnings {
            warnings.push(format!("persistence: {}", detail));
        }

        let level = metrics
            .iter()
            .map(|m| m.level)
            .max()
            .unwrap_or(QuotaLevel::Available);

        QuotaStatus {
            provider_id: self.provider_id.clone(),
            level,
            state,
            metrics,
            warnings,
        }
    }

    fn compute_level(&self, limit: Option<u64>, fraction: f64) -> QuotaLevel {
        if limit.is_none() {
            QuotaLevel::Available
        } else if fraction >= 1.0 {
            QuotaLevel::Exhausted
        } else if fraction >= self.limits.warning_threshold {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Available
        }
    }

    /// Record a persistence problem once; repeats of a known problem are only logged at debug.
    fn note_persistence_problem(&mut self, detail: String) {
        if self.persistence_warnings.contains(&detail) {
            debug!(provider = %self.provider_id, %detail, "persistence problem persists");
            return;
        }
        warn!(provider = %self.provider_id, %detail, "quota persistence problem; continuing in memory");
        self.persistence_warnings.push(detail);
        if self.persistence_warnings.len() > MAX_PERSISTENCE_WARNINGS {
            self.persistence_warnings.remove(0);
        }
    }

    fn lock_store(&mut self) -> Option<StoreLock> {
        let store = self.store.as_ref()?;
        match store.lock(&self.provider_id) {
            Ok(lock) => Some(lock),
            Err(err) => {
                self.note_persistence_problem(format!("failed to lock quota file: {}", err));
                None
            }
        }
    }

    /// Adopt the shared file's entries and foreign reservations. Entries this
    /// tracker failed to save are kept on top; a missing or unreadable file
    /// leaves the in-memory entries as they are.
    fn reload(&mut self) -> LoadStatus {
        let Some(store) = &self.store else {
            return LoadStatus::InMemory;
        };
        match store.load(&self.provider_id) {
            LoadOutcome::Loaded(file) => {
                let mut entries = file.entries;
                entries.extend(self.unsynced.iter().copied());
                entries.sort_by_key(|e| e.timestamp);
                self.entries = entries;
                self.foreign = file
                    .pending
                    .into_iter()
                    .filter(|p| p.holder != self.holder)
                    .collect();
                LoadStatus::Loaded
            }
            LoadOutcome::Missing => {
                self.foreign.clear();
                LoadStatus::Missing
            }
            LoadOutcome::Corrupt(detail) => {
                self.foreign.clear();
                self.note_persistence_problem(detail);
                LoadStatus::Corrupt
            }
        }
    }

    fn persist(&mut self, now: DateTime<Utc>) {
        let Some(store) = &self.store else {
            return;
        };
        let pending = self
            .reservations
            .iter()
            .map(|(id, held)| PendingReservation {
                holder: self.holder.clone(),
                id: *id,
                tokens: held.tokens,
                expires_at: held.expires_at,
            })
            .chain(self.foreign.iter().filter(|p| p.expires_at > now).cloned())
            .collect();
        let file = QuotaFile {
            provider: self.provider_id.clone(),
            state: self.state_at(now),
            updated_at: now,
            entries: self.entries.clone(),
            pending,
        };
        match store.save(&file) {
            Ok(()) => self.unsynced.clear(),
            Err(err) => {
                let detail = format!(
                    "failed to write {}: {}",
                    store.path_for(&self.provider_id).display(),
                    err
                );
                self.note_persistence_problem(detail);
            }
        }
    }
}

/// Thread-safe handle to a provider's tracker.
///
/// All admission and recording for one provider goes through this lock, so
/// two dispatches can never both be admitted against the same headroom.
/// Reads refresh from the shared quota file first.
#[derive(Debug, Clone)]
pub struct SharedQuotaTracker {
    inner: Arc<Mutex<QuotaTracker>>,
}

impl SharedQuotaTracker {
    pub fn new(tracker: QuotaTracker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tracker)),
        }
    }

    /// Lock the tracker for a compound operation.
    pub fn lock(&self) -> MutexGuard<'_, QuotaTracker> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn can_handle(&self, estimated_tokens: u64) -> Admission {
        let mut tracker = self.lock();
        tracker.refresh();
        tracker.can_handle(estimated_tokens)
    }

    pub fn try_reserve(&self, estimated_tokens: u64) -> Result<Reservation, Admission> {
        self.lock().try_reserve(estimated_tokens)
    }

    pub fn try_reserve_for(
        &self,
        estimated_tokens: u64,
        hold: Duration,
    ) -> Result<Reservation, Admission> {
        self.lock().try_reserve_for(estimated_tokens, hold)
    }

    pub fn commit(&self, reservation: Reservation, actual_tokens: Option<u64>) {
        self.lock().commit(reservation, actual_tokens);
    }

    pub fn commit_at(&self, reservation: Reservation, actual_tokens: Option<u64>, now: DateTime<Utc>) {
        self.lock().commit_at(reservation, actual_tokens, now);
    }

    pub fn release(&self, reservation: Reservation) {
        self.lock().release(reservation);
    }

    pub fn record_request(&self, estimated_tokens: u64, actual_tokens: Option<u64>) {
        self.lock().record_request(estimated_tokens, actual_tokens);
    }

    pub fn get_quota_status(&self) -> QuotaStatus {
        let mut tracker = self.lock();
        tracker.refresh();
        tracker.get_quota_status()
    }

    pub fn state(&self) -> QuotaState {
        let mut tracker = self.lock();
        tracker.refresh();
        tracker.state()
    }

    pub fn cleanup_old_data(&self, max_age_hours: u64) -> usize {
        self.lock().cleanup_old_data(max_age_hours)
    }
}
