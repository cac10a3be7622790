//! Batch job state machine: update application, stall detection and the
//! provider-facing lifecycle operations.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use payclass_adapters::BatchProvider;
use payclass_core::{BatchJob, BatchJobMetadata, BatchStatus, StatusUpdate, UpdateSource};
use payclass_storage::{retry_with_backoff, BackoffPolicy};
use tracing::{info, info_span, Instrument};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    WrongJob { expected: String, found: String },
    TerminalJob { status: BatchStatus },
    Stale {
        current: DateTime<Utc>,
        incoming: DateTime<Utc>,
    },
    StatusRegression { from: BatchStatus, to: BatchStatus },
    InvalidTransition { from: BatchStatus, to: BatchStatus },
    CounterRegression { counter: &'static str, current: u32, incoming: u32 },
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::WrongJob { expected, found } => {
                write!(f, "update for {found} applied to {expected}")
            }
            IgnoreReason::TerminalJob { status } => write!(f, "job is already {status}"),
            IgnoreReason::Stale { current, incoming } => {
                write!(f, "snapshot from {incoming} is older than {current}")
            }
            IgnoreReason::StatusRegression { from, to } => {
                write!(f, "status would regress from {from} to {to}")
            }
            IgnoreReason::InvalidTransition { from, to } => {
                write!(f, "no transition from {from} to {to}")
            }
            IgnoreReason::CounterRegression {
                counter,
                current,
                incoming,
            } => write!(f, "{counter} count would drop from {current} to {incoming}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied(BatchJob),
    Ignored(IgnoreReason),
}

/// Pure merge of a status snapshot into the current job. Never panics; any
/// snapshot that would move the job backwards is ignored.
pub fn apply_status_update(current: &BatchJob, incoming: &StatusUpdate) -> UpdateOutcome {
    if current.id != incoming.job_id {
        return UpdateOutcome::Ignored(IgnoreReason::WrongJob {
            expected: current.id.clone(),
            found: incoming.job_id.clone(),
        });
    }
    if current.status.is_terminal() {
        return UpdateOutcome::Ignored(IgnoreReason::TerminalJob {
            status: current.status,
        });
    }
    if incoming.observed_at < current.observed_at {
        return UpdateOutcome::Ignored(IgnoreReason::Stale {
            current: current.observed_at,
            incoming: incoming.observed_at,
        });
    }
    if incoming.status.rank() < current.status.rank() {
        return UpdateOutcome::Ignored(IgnoreReason::StatusRegression {
            from: current.status,
            to: incoming.status,
        });
    }
    if !current.status.can_transition_to(incoming.status) {
        return UpdateOutcome::Ignored(IgnoreReason::InvalidTransition {
            from: current.status,
            to: incoming.status,
        });
    }

    let now = &current.request_counts;
    let next = &incoming.request_counts;
    for (counter, current_value, incoming_value) in [
        ("total", now.total, next.total),
        ("completed", now.completed, next.completed),
        ("failed", now.failed, next.failed),
    ] {
        if incoming_value < current_value {
            return UpdateOutcome::Ignored(IgnoreReason::CounterRegression {
                counter,
                current: current_value,
                incoming: incoming_value,
            });
        }
    }

    let mut job = current.clone();
    job.status = incoming.status;
    job.request_counts = incoming.request_counts;
    job.timestamps.merge_set_once(&incoming.timestamps);
    job.timestamps.stamp(incoming.status, incoming.observed_at);
    if incoming.output_file_id.is_some() {
        job.output_file_id = incoming.output_file_id.clone();
    }
    if !incoming.errors.is_empty() {
        job.errors = incoming.errors.clone();
    }
    job.observed_at = incoming.observed_at;
    UpdateOutcome::Applied(job)
}

/// Age thresholds for long-running jobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallPolicy {
    pub queue_timeout: Duration,
    pub stall_timeout: Duration,
    pub hard_ceiling: Duration,
    pub auto_cancel_enabled: bool,
    /// Completion fraction below which an old job counts as stalled.
    pub stall_progress_threshold: f64,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::hours(4),
            stall_timeout: Duration::hours(24),
            hard_ceiling: Duration::hours(48),
            auto_cancel_enabled: true,
            stall_progress_threshold: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallAssessment {
    pub age: Duration,
    pub progress: f64,
    pub queued_too_long: bool,
    pub possibly_stalled: bool,
    pub exceeded_ceiling: bool,
    pub auto_cancel: bool,
}

impl StallAssessment {
    /// Human-readable advice for the operator, if any.
    pub fn advisory(&self) -> Option<String> {
        let hours = self.age.num_hours();
        if self.exceeded_ceiling {
            Some(format!(
                "Job has been running for {hours}h without finishing and exceeded the hard limit"
            ))
        } else if self.possibly_stalled {
            Some(format!(
                "Job is {:.0}% complete after {hours}h and may be stalled; consider cancelling",
                self.progress * 100.0
            ))
        } else if self.queued_too_long {
            Some(format!("Job has been queued for {hours}h without progress"))
        } else {
            None
        }
    }
}

impl StallPolicy {
    pub fn assess(&self, job: &BatchJob, now: DateTime<Utc>) -> StallAssessment {
        let age = job.age(now);
        let progress = job.request_counts.progress_fraction();
        if job.status.is_terminal() {
            return StallAssessment {
                age,
                progress,
                queued_too_long: false,
                possibly_stalled: false,
                exceeded_ceiling: false,
                auto_cancel: false,
            };
        }
        let queued_too_long = matches!(job.status, BatchStatus::Validating | BatchStatus::InProgress)
            && !job.request_counts.has_progress()
            && age > self.queue_timeout;
        let possibly_stalled = progress < self.stall_progress_threshold && age > self.stall_timeout;
        let exceeded_ceiling = age > self.hard_ceiling;
        StallAssessment {
            age,
            progress,
            queued_too_long,
            possibly_stalled,
            exceeded_ceiling,
            auto_cancel: exceeded_ceiling && self.auto_cancel_enabled,
        }
    }
}

/// Provider-facing half of the state machine.
pub struct JobLifecycle {
    provider: Arc<dyn BatchProvider>,
    provider_backoff: BackoffPolicy,
    cancel_backoff: BackoffPolicy,
}

impl JobLifecycle {
    pub const CANCEL_RETRIES: usize = 2;

    pub fn new(provider: Arc<dyn BatchProvider>, provider_backoff: BackoffPolicy) -> Self {
        let cancel_backoff = BackoffPolicy {
            max_retries: Self::CANCEL_RETRIES,
            ..provider_backoff
        };
        Self {
            provider,
            provider_backoff,
            cancel_backoff,
        }
    }

    pub fn provider(&self) -> &Arc<dyn BatchProvider> {
        &self.provider
    }

    pub fn provider_backoff(&self) -> &BackoffPolicy {
        &self.provider_backoff
    }

    /// Submits the unique names and returns the new job in `validating`.
    pub async fn create(
        &self,
        unique_names: &[String],
        description: Option<&str>,
    ) -> Result<BatchJob, SyncError> {
        let span = info_span!("create_job", payees = unique_names.len());
        async move {
            let remote = self.provider.create_job(unique_names, description).await?;
            let job = remote
                .to_status_update(Utc::now(), UpdateSource::Local)?
                .into_job(BatchJobMetadata {
                    description: description.map(str::to_string),
                    payee_count: unique_names.len(),
                });
            info!(job_id = %job.id, status = %job.status, "batch job created");
            Ok(job)
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_update(&self, job_id: &str) -> Result<StatusUpdate, SyncError> {
        let remote = retry_with_backoff(&self.provider_backoff, "get_job", || {
            self.provider.get_job(job_id)
        })
        .await?;
        Ok(remote.to_status_update(Utc::now(), UpdateSource::Poll)?)
    }

    /// Requests remote cancellation. Local state is not touched here; the
    /// returned snapshot goes through the normal update path.
    pub async fn cancel(&self, job_id: &str) -> Result<StatusUpdate, SyncError> {
        let span = info_span!("cancel_job", job_id);
        async move {
            let remote = retry_with_backoff(&self.cancel_backoff, "cancel_job", || {
                self.provider.cancel_job(job_id)
            })
            .await?;
            Ok(remote.to_status_update(Utc::now(), UpdateSource::Local)?)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payclass_core::{LifecycleTimestamps, RequestCounts};

    fn job_at(status: BatchStatus, completed: u32, observed_at: DateTime<Utc>) -> BatchJob {
        BatchJob {
            id: "batch_1".to_string(),
            status,
            request_counts: RequestCounts {
                total: 100,
                completed,
                failed: 0,
            },
            timestamps: LifecycleTimestamps::created(observed_at),
            metadata: BatchJobMetadata::default(),
            output_file_id: None,
            errors: Vec::new(),
            observed_at,
        }
    }

    fn update(status: BatchStatus, completed: u32, observed_at: DateTime<Utc>) -> StatusUpdate {
        StatusUpdate {
            job_id: "batch_1".to_string(),
            status,
            request_counts: RequestCounts {
                total: 100,
                completed,
                failed: 0,
            },
            timestamps: LifecycleTimestamps::created(observed_at),
            output_file_id: None,
            errors: Vec::new(),
            observed_at,
            source: UpdateSource::Poll,
        }
    }

    #[test]
    fn counters_never_move_backwards() {
        let t0 = Utc::now();
        let job = job_at(BatchStatus::InProgress, 0, t0);
        let updates = [
            update(BatchStatus::InProgress, 40, t0 + Duration::seconds(30)),
            update(BatchStatus::InProgress, 20, t0 + Duration::seconds(10)),
            update(BatchStatus::InProgress, 35, t0 + Duration::seconds(60)),
            update(BatchStatus::Finalizing, 100, t0 + Duration::seconds(90)),
        ];
        let mut current = job;
        let mut seen = vec![current.request_counts.completed];
        for u in &updates {
            if let UpdateOutcome::Applied(next) = apply_status_update(&current, u) {
                current = next;
            }
            seen.push(current.request_counts.completed);
        }
        assert_eq!(seen, vec![0, 40, 40, 40, 100]);
        assert_eq!(current.status, BatchStatus::Finalizing);
    }

    #[test]
    fn terminal_jobs_ignore_everything() {
        let t0 = Utc::now();
        let job = job_at(BatchStatus::Completed, 100, t0);
        let outcome = apply_status_update(&job, &update(BatchStatus::InProgress, 100, t0 + Duration::hours(1)));
        assert_eq!(
            outcome,
            UpdateOutcome::Ignored(IgnoreReason::TerminalJob {
                status: BatchStatus::Completed
            })
        );
    }

    #[test]
    fn status_rank_regression_is_ignored() {
        let t0 = Utc::now();
        let job = job_at(BatchStatus::Finalizing, 100, t0);
        let outcome = apply_status_update(&job, &update(BatchStatus::InProgress, 100, t0 + Duration::seconds(5)));
        assert!(matches!(outcome, UpdateOutcome::Ignored(IgnoreReason::StatusRegression { .. })));
    }

    #[test]
    fn timestamps_are_set_once() {
        let t0 = Utc::now();
        let job = job_at(BatchStatus::Validating, 0, t0);
        let first = update(BatchStatus::InProgress, 1, t0 + Duration::seconds(5));
        let UpdateOutcome::Applied(job) = apply_status_update(&job, &first) else {
            panic!("first update should apply");
        };
        let again = update(BatchStatus::InProgress, 2, t0 + Duration::seconds(50));
        let UpdateOutcome::Applied(job) = apply_status_update(&job, &again) else {
            panic!("second update should apply");
        };
        assert_eq!(job.timestamps.in_progress_at, Some(t0 + Duration::seconds(5)));
        assert_eq!(job.observed_at, t0 + Duration::seconds(50));
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        let t0 = Utc::now();
        let job = job_at(BatchStatus::InProgress, 10, t0);
        let outcome = apply_status_update(&job, &update(BatchStatus::InProgress, 12, t0 - Duration::seconds(1)));
        assert!(matches!(outcome, UpdateOutcome::Ignored(IgnoreReason::Stale { .. })));
    }

    #[test]
    fn stuck_job_is_advisory_until_ceiling() {
        let policy = StallPolicy::default();
        let now = Utc::now();

        let young = job_at(BatchStatus::InProgress, 0, now - Duration::hours(2));
        assert!(policy.assess(&young, now).advisory().is_none());

        let queued = job_at(BatchStatus::InProgress, 0, now - Duration::hours(5));
        let a = policy.assess(&queued, now);
        assert!(a.queued_too_long && !a.possibly_stalled && !a.auto_cancel);

        let stalled = job_at(BatchStatus::InProgress, 5, now - Duration::hours(25));
        let a = policy.assess(&stalled, now);
        assert!(a.possibly_stalled);
        assert!(!a.auto_cancel);
        assert!(a.advisory().unwrap().contains("stalled"));

        let ancient = job_at(BatchStatus::InProgress, 80, now - Duration::hours(49));
        let a = policy.assess(&ancient, now);
        assert!(a.exceeded_ceiling && a.auto_cancel);

        let manual_only = StallPolicy {
            auto_cancel_enabled: false,
            ..policy
        };
        assert!(!manual_only.assess(&ancient, now).auto_cancel);
    }
}
