//! Dispatch orchestration: provider resolution, admission, execution, bookkeeping.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::command::{build_command, expand_file_args};
use super::runner::{ProcessRunner, ProcessSpec, TokioProcessRunner, DEFAULT_MAX_OUTPUT_BYTES};
use super::selection::{rank_providers, Requirement};
use super::types::{DelegationRequest, DelegationResult, DryRun, Verification};
use crate::budget::{TokenEstimator, TokenUsageParser};
use crate::config::ConjureConfig;
use crate::error::DelegationError;
use crate::quota::{QuotaLimits, QuotaStatus, QuotaStore, QuotaTracker, Reservation, SharedQuotaTracker, RETENTION_HOURS};
use crate::registry::{ServiceConfig, ServiceRegistry, AUTO_PROVIDER};
use crate::timeout::TimeoutConfig;
use crate::usage::{generate_session_id, ErrorKind, LogIssue, UsageLog, UsageRecord, UsageSummary};

/// Capture limit for auth-check output.
const AUTH_OUTPUT_BYTES: usize = 64 * 1024;

/// Added to the dispatch timeout to get how long other processes count a
/// reservation: covers output draining and bookkeeping after the kill.
const RESERVATION_SLACK: Duration = Duration::from_secs(30);

/// Builds a [`DelegationExecutor`].
pub struct ExecutorBuilder {
    registry: ServiceRegistry,
    usage_log_path: PathBuf,
    limits: HashMap<String, QuotaLimits>,
    quota_store: Option<QuotaStore>,
    estimator: TokenEstimator,
    runner: Arc<dyn ProcessRunner>,
    timeouts: TimeoutConfig,
    max_output_bytes: usize,
    cleanup_interval: Option<chrono::Duration>,
}

impl ExecutorBuilder {
    pub fn new(registry: ServiceRegistry, usage_log_path: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            usage_log_path: usage_log_path.into(),
            limits: HashMap::new(),
            quota_store: None,
            estimator: TokenEstimator::default(),
            runner: Arc::new(TokioProcessRunner),
            timeouts: TimeoutConfig::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            cleanup_interval: None,
        }
    }

    pub fn with_limits(mut self, provider_id: impl Into<String>, limits: QuotaLimits) -> Self {
        self.limits.insert(provider_id.into(), limits);
        self
    }

    pub fn with_all_limits(mut self, limits: HashMap<String, QuotaLimits>) -> Self {
        self.limits.extend(limits);
        self
    }

    /// Persist quota state in `store`. Without one, trackers are in-memory.
    pub fn with_quota_store(mut self, store: QuotaStore) -> Self {
        self.quota_store = Some(store);
        self
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: chrono::Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Open one tracker per provider. Trackers whose quota file was missing or
    /// corrupt are rebuilt from the last day of the usage log.
    pub fn build(self) -> DelegationExecutor {
        let usage = UsageLog::new(&self.usage_log_path);
        let mut replay: Option<Vec<UsageRecord>> = None;
        let mut trackers = HashMap::new();

        for service in self.registry.list_available() {
            let limits = self.limits.get(&service.id).cloned().unwrap_or_default();
            let mut tracker = match &self.quota_store {
                Some(store) => QuotaTracker::open(service.id.clone(), limits, store.clone()),
                None => QuotaTracker::new(service.id.clone(), limits),
            };
            if let Some(interval) = self.cleanup_interval {
                tracker = tracker.with_cleanup_interval(interval);
            }

            if tracker.load_status().needs_replay() {
                let records = replay.get_or_insert_with(|| recent_records(&usage));
                if records.iter().any(|r| r.provider_id == service.id) {
                    info!(provider = %service.id, "rebuilding quota state from usage log");
                }
                tracker.rebuild_from_records(records);
            }

            trackers.insert(service.id.clone(), SharedQuotaTracker::new(tracker));
        }

        DelegationExecutor {
            inner: Arc::new(ExecutorInner {
                registry: self.registry,
                trackers,
                usage,
                estimator: self.estimator,
                parser: TokenUsageParser::new(),
                runner: self.runner,
                timeouts: self.timeouts,
                max_output_bytes: self.max_output_bytes,
                session_id: generate_session_id(),
            }),
        }
    }
}

fn recent_records(usage: &UsageLog) -> Vec<UsageRecord> {
    let since = chrono::Duration::try_hours(RETENTION_HOURS)
        .and_then(|window| Utc::now().checked_sub_signed(window));
    match usage.records(since) {
        Ok(records) => records,
        Err(err) => {
            warn!(path = %usage.path().display(), error = %err, "cannot read usage log for quota replay");
            Vec::new()
        }
    }
}

struct ExecutorInner {
    registry: ServiceRegistry,
    trackers: HashMap<String, SharedQuotaTracker>,
    usage: UsageLog,
    estimator: TokenEstimator,
    parser: TokenUsageParser,
    runner: Arc<dyn ProcessRunner>,
    timeouts: TimeoutConfig,
    max_output_bytes: usize,
    session_id: String,
}

/// A reserved dispatch on its way to the provider.
struct Job {
    provider_id: String,
    model: String,
    argv: Vec<String>,
    estimated_tokens: u64,
    timeout: Duration,
    started: Instant,
    tracker: SharedQuotaTracker,
    reservation: Reservation,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn first_line(text: &str) -> &str {
    text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

impl ExecutorInner {
    fn tracker(&self, provider_id: &str) -> Result<SharedQuotaTracker, DelegationError> {
        self.trackers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| DelegationError::UnknownProvider(provider_id.to_string()))
    }

    fn log(&self, record: UsageRecord) {
        self.usage
            .log_attempt(&record.with_session(self.session_id.clone()));
    }

    fn record_for(&self, result: &DelegationResult, timestamp: DateTime<Utc>) -> UsageRecord {
        let record = match result.error_kind {
            None => UsageRecord::success(&result.provider_id, result.estimated_tokens, result.elapsed_ms),
            Some(kind) => UsageRecord::failure(
                &result.provider_id,
                result.estimated_tokens,
                result.elapsed_ms,
                kind,
            ),
        };
        record
            .with_timestamp(timestamp)
            .with_actual_tokens(result.actual_tokens)
            .with_model(result.model.clone())
            .with_exit_code(result.exit_code)
    }

    /// Log a result that never reached a provider and hand it back.
    fn reject(&self, result: DelegationResult) -> DelegationResult {
        self.log(self.record_for(&result, Utc::now()));
        result
    }

    fn select_provider(
        &self,
        requirement: Option<&str>,
        estimated_tokens: u64,
    ) -> Result<String, DelegationError> {
        let requirement = Requirement::parse(requirement);
        let mut reasons = Vec::new();

        for service in rank_providers(self.registry.list_available(), requirement) {
            if service.context_window_tokens <= estimated_tokens {
                reasons.push(format!(
                    "{}: context window {} too small",
                    service.id, service.context_window_tokens
                ));
                continue;
            }
            let admission = self.tracker(&service.id)?.can_handle(estimated_tokens);
            if admission.allowed {
                debug!(
                    provider = %service.id,
                    requirement = requirement.as_str(),
                    estimated_tokens,
                    "selected provider"
                );
                return Ok(service.id.clone());
            }
            reasons.push(format!(
                "{}: {}",
                service.id,
                admission.reason.unwrap_or_else(|| "quota exhausted".to_string())
            ));
        }

        Err(DelegationError::NoEligibleProvider {
            estimated_tokens,
            reasons,
        })
    }

    fn resolve(
        &self,
        request: &DelegationRequest,
        estimated_tokens: u64,
    ) -> Result<Arc<ServiceConfig>, DelegationError> {
        match request.provider.as_deref() {
            Some(name) if !name.trim().eq_ignore_ascii_case(AUTO_PROVIDER) => {
                Ok(self.registry.lookup(name)?)
            }
            _ => {
                let id = self.select_provider(request.requirement.as_deref(), estimated_tokens)?;
                Ok(self.registry.lookup(&id)?)
            }
        }
    }

    async fn verify(&self, service: &ServiceConfig) -> Verification {
        let unavailable = |detail: String| Verification {
            provider_id: service.id.clone(),
            available: false,
            detail,
        };

        if service.auth_check_command.is_empty() {
            return Verification {
                provider_id: service.id.clone(),
                available: true,
                detail: "no auth check configured".to_string(),
            };
        }

        let spec = ProcessSpec::new(service.auth_check_command.clone(), self.timeouts.auth_timeout)
            .with_max_output_bytes(AUTH_OUTPUT_BYTES);

        match self.runner.run(&spec).await {
            Ok(output) if output.success() => {
                let detail = match first_line(&output.stdout) {
                    "" => "auth check passed".to_string(),
                    line => line.to_string(),
                };
                Verification {
                    provider_id: service.id.clone(),
                    available: true,
                    detail,
                }
            }
            Ok(output) if output.timed_out => unavailable(format!(
                "auth check timed out after {}ms",
                self.timeouts.auth_timeout.as_millis()
            )),
            Ok(output) => {
                let code = output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                match first_line(&output.stderr) {
                    "" => unavailable(format!("auth check exited with {}", code)),
                    line => unavailable(format!("auth check exited with {}: {}", code, line)),
                }
            }
            Err(err) => unavailable(format!("failed to start '{}': {}", spec.program(), err)),
        }
    }

    /// Run a reserved job and complete its bookkeeping.
    async fn run_job(&self, job: Job) -> DelegationResult {
        let spec = ProcessSpec::new(job.argv, job.timeout).with_max_output_bytes(self.max_output_bytes);
        let outcome = self.runner.run(&spec).await;

        let mut result = DelegationResult::rejected(
            job.provider_id.clone(),
            Some(job.model),
            job.estimated_tokens,
            elapsed_ms(job.started),
            ErrorKind::SpawnFailure,
            "",
        );

        // One instant for the quota entry and the usage record, so a replay
        // from the log puts the attempt in the same minute and day.
        let finished = Utc::now();

        match outcome {
            Err(err) => {
                // Nothing reached the provider; hand the capacity back.
                job.tracker.release(job.reservation);
                warn!(provider = %job.provider_id, program = %spec.program(), error = %err, "failed to start provider");
                result.detail = Some(format!("failed to start '{}': {}", spec.program(), err));
            }
            Ok(output) => {
                let reported = self.parser.actual_tokens(&output.stdout);
                result.exit_code = output.exit_code;
                result.truncated = output.truncated;

                if output.timed_out {
                    // Charged at the estimate.
                    job.tracker.commit_at(job.reservation, None, finished);
                    result.error_kind = Some(ErrorKind::Timeout);
                    result.detail = Some(format!("after {}ms", job.timeout.as_millis()));
                } else if output.exit_code == Some(0) {
                    job.tracker.commit_at(job.reservation, reported, finished);
                    result.success = true;
                    result.error_kind = None;
                    result.detail = None;
                    result.actual_tokens = reported;
                } else {
                    job.tracker.commit_at(job.reservation, reported, finished);
                    result.error_kind = Some(ErrorKind::ExitFailure);
                    result.actual_tokens = reported;
                    result.detail = match first_line(&output.stderr) {
                        "" => None,
                        line => Some(line.to_string()),
                    };
                }

                result.stdout = output.stdout;
                result.stderr = output.stderr;
            }
        }

        self.log(self.record_for(&result, finished));

        info!(
            provider = %result.provider_id,
            success = result.success,
            error_kind = ?result.error_kind,
            elapsed_ms = result.elapsed_ms,
            estimated_tokens = result.estimated_tokens,
            actual_tokens = ?result.actual_tokens,
            "dispatch finished"
        );
        result
    }
}

/// Routes tasks to providers under quota control.
///
/// Cheap to clone; clones share registry, trackers and usage log, so
/// concurrent dispatches see one consistent quota state per provider.
#[derive(Clone)]
pub struct DelegationExecutor {
    inner: Arc<ExecutorInner>,
}

impl DelegationExecutor {
    /// Build an executor from loaded configuration.
    pub fn from_config(config: &ConjureConfig) -> Result<Self, DelegationError> {
        let registry = config.registry()?;
        let limits = config.resolved_limits(&registry)?;
        let cleanup_interval = i64::try_from(config.cleanup_interval_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::hours(1));

        Ok(ExecutorBuilder::new(registry, config.resolved_usage_log_path())
            .with_quota_store(QuotaStore::new(config.resolved_quota_dir()))
            .with_all_limits(limits)
            .with_estimator(TokenEstimator::new(config.chars_per_token_fallback))
            .with_timeouts(TimeoutConfig::from_millis(
                config.default_timeout_ms,
                config.auth_timeout_ms,
            ))
            .with_max_output_bytes(config.max_output_bytes)
            .with_cleanup_interval(cleanup_interval)
            .build())
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.inner.estimator
    }

    pub fn usage_log(&self) -> &UsageLog {
        &self.inner.usage
    }

    /// Quota tracker for a provider id or alias.
    pub fn tracker(&self, provider: &str) -> Result<SharedQuotaTracker, DelegationError> {
        let id = self.inner.registry.resolve_alias(provider)?;
        self.inner.tracker(&id)
    }

    /// Run a provider's auth check. No quota or usage side effects.
    pub async fn verify(&self, provider: &str) -> Result<Verification, DelegationError> {
        let service = self.inner.registry.lookup(provider)?;
        let verification = self.inner.verify(&service).await;
        debug!(provider = %service.id, available = verification.available, "auth check");
        Ok(verification)
    }

    /// Best provider for a task of `estimated_tokens`: its context window must
    /// exceed the estimate and its quota must admit the task.
    pub fn select_provider(
        &self,
        requirement: Option<&str>,
        estimated_tokens: u64,
    ) -> Result<String, DelegationError> {
        self.inner.select_provider(requirement, estimated_tokens)
    }

    /// Dispatch a task.
    ///
    /// Every call appends exactly one usage record. Quota rejection, timeout,
    /// non-zero exit and spawn failure come back as `Ok` with `success == false`;
    /// `Err` is reserved for unknown providers, no eligible provider, and
    /// broken command templates. Once quota is reserved the provider runs in
    /// its own task, so dropping this future does not skip bookkeeping.
    pub async fn dispatch(
        &self,
        request: DelegationRequest,
    ) -> Result<DelegationResult, DelegationError> {
        let started = Instant::now();
        let inner = &self.inner;
        let estimate = inner
            .estimator
            .estimate_request(&request.prompt, &request.files);
        let estimated_tokens = estimate.total();

        let service = match inner.resolve(&request, estimated_tokens) {
            Ok(service) => service,
            Err(err) => {
                let (provider, kind) = match &err {
                    DelegationError::UnknownProvider(name) => {
                        (name.clone(), ErrorKind::UnknownProvider)
                    }
                    _ => (AUTO_PROVIDER.to_string(), ErrorKind::NoEligibleProvider),
                };
                warn!(provider = %provider, error = %err, "dispatch rejected");
                inner.log(UsageRecord::failure(
                    provider,
                    estimated_tokens,
                    elapsed_ms(started),
                    kind,
                ));
                return Err(err);
            }
        };

        let model = service.resolve_model(request.model.as_deref());
        let file_args = expand_file_args(&request.files);
        let argv = match build_command(&service.command_template, &model, &request.prompt, &file_args) {
            Ok(argv) => argv,
            Err(err) => {
                inner.log(
                    UsageRecord::failure(
                        &service.id,
                        estimated_tokens,
                        elapsed_ms(started),
                        ErrorKind::SpawnFailure,
                    )
                    .with_model(Some(model)),
                );
                return Err(DelegationError::CommandTemplate {
                    provider: service.id.clone(),
                    reason: err.to_string(),
                });
            }
        };

        if request.check_auth {
            let verification = inner.verify(&service).await;
            if !verification.available {
                info!(provider = %service.id, detail = %verification.detail, "provider unavailable");
                return Ok(inner.reject(DelegationResult::rejected(
                    service.id.clone(),
                    Some(model),
                    estimated_tokens,
                    elapsed_ms(started),
                    ErrorKind::ProviderUnavailable,
                    verification.detail,
                )));
            }
        }

        let timeout = inner.timeouts.dispatch_timeout_for(request.timeout);
        let hold = chrono::Duration::from_std(timeout.saturating_add(RESERVATION_SLACK))
            .unwrap_or_else(|_| chrono::Duration::hours(RETENTION_HOURS));
        let tracker = inner.tracker(&service.id)?;
        let reservation = match tracker.try_reserve_for(estimated_tokens, hold) {
            Ok(reservation) => reservation,
            Err(admission) => {
                let reason = admission
                    .reason
                    .unwrap_or_else(|| "quota exhausted".to_string());
                info!(provider = %service.id, %reason, "dispatch blocked by quota");
                return Ok(inner.reject(DelegationResult::rejected(
                    service.id.clone(),
                    Some(model),
                    estimated_tokens,
                    elapsed_ms(started),
                    ErrorKind::QuotaExceeded,
                    reason,
                )));
            }
        };

        let job = Job {
            provider_id: service.id.clone(),
            model,
            argv,
            estimated_tokens,
            timeout,
            started,
            tracker,
            reservation,
        };

        debug!(
            provider = %job.provider_id,
            model = %job.model,
            estimated_tokens,
            timeout_ms = job.timeout.as_millis() as u64,
            "dispatching"
        );

        let task_inner = Arc::clone(&self.inner);
        tokio::spawn(async move { task_inner.run_job(job).await })
            .await
            .map_err(|err| DelegationError::SubprocessFailure {
                provider: service.id.clone(),
                exit_code: None,
                detail: format!("dispatch task failed: {}", err),
            })
    }

    /// Resolve, estimate and build the command without reserving quota or spawning.
    pub fn dry_run(&self, request: &DelegationRequest) -> Result<DryRun, DelegationError> {
        let inner = &self.inner;
        let estimate = inner
            .estimator
            .estimate_request(&request.prompt, &request.files);
        let service = inner.resolve(request, estimate.total())?;
        let model = service.resolve_model(request.model.as_deref());
        let argv = build_command(
            &service.command_template,
            &model,
            &request.prompt,
            &expand_file_args(&request.files),
        )
        .map_err(|err| DelegationError::CommandTemplate {
            provider: service.id.clone(),
            reason: err.to_string(),
        })?;
        let admission = inner.tracker(&service.id)?.can_handle(estimate.total());

        Ok(DryRun {
            provider_id: service.id.clone(),
            model,
            argv,
            estimate,
            allowed: admission.allowed,
            reason: admission.reason,
        })
    }

    /// Quota status for every provider, sorted by id.
    pub fn status(&self) -> Vec<QuotaStatus> {
        self.inner
            .registry
            .ids()
            .filter_map(|id| self.inner.trackers.get(id))
            .map(|tracker| tracker.get_quota_status())
            .collect()
    }

    /// Drop quota entries older than `max_age_hours`; returns removed counts per provider.
    pub fn cleanup(&self, max_age_hours: u64) -> Vec<(String, usize)> {
        self.inner
            .registry
            .ids()
            .filter_map(|id| {
                self.inner
                    .trackers
                    .get(id)
                    .map(|tracker| (id.to_string(), tracker.cleanup_old_data(max_age_hours)))
            })
            .collect()
    }

    pub fn report(&self, since: Option<DateTime<Utc>>) -> Result<UsageSummary, DelegationError> {
        Ok(self.inner.usage.report(since)?)
    }

    pub fn validate_log(&self) -> Result<Vec<LogIssue>, DelegationError> {
        Ok(self.inner.usage.validate()?)
    }
}
