//! Orphan detection, phantom cleanup, stuck-job recovery and the scheduled
//! cleanup sweep.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use payclass_core::{BatchJob, BatchStatus};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

use crate::machine::StallAssessment;
use crate::persistence::SaveStats;
use crate::pipeline::CompletionReport;
use crate::service::JobService;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnsureOutcome {
    AlreadyPresent { rows: usize },
    Recovered(CompletionReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// `(job_id, reason)`
    pub removed: Vec<(String, String)>,
    pub kept: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Cancel the remote job and submit the same unique names again.
    Recreate,
    /// Classify locally with deterministic rules.
    LocalFallback,
}

impl RecoveryStrategy {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "recreate" => Some(Self::Recreate),
            "local" | "local_fallback" => Some(Self::LocalFallback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recreated { previous: String, job: BatchJob },
    LocalFallback { stats: SaveStats },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoCleanupReport {
    pub cancelled: Vec<String>,
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

impl JobService {
    /// Completed jobs in the store that have no classification rows.
    pub async fn find_orphaned_jobs(&self) -> Result<Vec<BatchJob>, SyncError> {
        let mut orphans = Vec::new();
        for job in self.store().list_jobs().await? {
            if job.status != BatchStatus::Completed {
                continue;
            }
            if self.store().count_classifications(&job.id).await? == 0 {
                orphans.push(job);
            }
        }
        Ok(orphans)
    }

    pub async fn ensure_results(&self, job_id: &str) -> Result<EnsureOutcome, SyncError> {
        let rows = self.store().count_classifications(job_id).await?;
        if rows > 0 {
            return Ok(EnsureOutcome::AlreadyPresent { rows });
        }
        info!(job_id, "no stored results, running completion again");
        Ok(EnsureOutcome::Recovered(self.complete_job(job_id).await?))
    }

    /// Drops jobs the provider could never know about or confirms it does
    /// not. Anything short of a definite answer keeps the job.
    pub async fn cleanup_phantom_jobs(&self, jobs: &[BatchJob]) -> CleanupReport {
        let mut report = CleanupReport::default();
        let provider = self.lifecycle.provider();
        for job in jobs {
            let reason = if !provider.is_valid_job_id(&job.id) {
                Some("malformed job id".to_string())
            } else {
                match self.lifecycle.fetch_update(&job.id).await {
                    Ok(_) => None,
                    Err(SyncError::Provider(err)) if err.is_not_found() => {
                        Some("not found at provider".to_string())
                    }
                    Err(err) => {
                        report.errors.push(format!("{}: {err}", job.id));
                        None
                    }
                }
            };
            match reason {
                Some(reason) => {
                    let deleted = self.delete_job(&job.id).await;
                    for step in deleted.failures() {
                        report.errors.push(format!(
                            "{}: {} failed: {}",
                            job.id,
                            step.step,
                            step.error.as_deref().unwrap_or_default()
                        ));
                    }
                    warn!(job_id = %job.id, %reason, "phantom job removed");
                    report.removed.push((job.id.clone(), reason));
                }
                None => report.kept += 1,
            }
        }
        report
    }

    /// Active jobs that deserve operator attention right now.
    pub async fn stuck_jobs(&self, now: DateTime<Utc>) -> Vec<(BatchJob, StallAssessment)> {
        self.state
            .jobs()
            .await
            .into_iter()
            .filter_map(|job| {
                let assessment = self.config.stall.assess(&job, now);
                assessment.advisory().map(|_| (job, assessment))
            })
            .collect()
    }

    pub async fn recover_stuck_job(
        &self,
        job_id: &str,
        strategy: RecoveryStrategy,
    ) -> Result<RecoveryOutcome, SyncError> {
        let span = info_span!("recover_job", job_id, ?strategy);
        async move {
            let job = self.job(job_id).await?;
            let data = self.payee_data_for(job_id).await?;
            match strategy {
                RecoveryStrategy::Recreate => {
                    if job.is_active() {
                        match self.cancel(job_id).await {
                            Ok(_) => {}
                            Err(SyncError::Provider(err)) if err.is_not_found() => {
                                warn!(job_id, "job already gone at provider");
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    let description = job.metadata.description.as_deref();
                    let fresh = self
                        .lifecycle
                        .create(&data.unique_payee_names, description)
                        .await?;
                    self.state.set_payee_data(&fresh.id, data.clone()).await;
                    self.state.upsert_job(fresh.clone()).await;
                    self.persistence.save_job(&fresh, Some(&*data)).await?;
                    info!(previous = job_id, job_id = %fresh.id, "job recreated");
                    Ok(RecoveryOutcome::Recreated {
                        previous: job_id.to_string(),
                        job: fresh,
                    })
                }
                RecoveryStrategy::LocalFallback => {
                    let results = self.local.classify_all(&data.unique_payee_names);
                    let report = self.persist_results(job_id, &data, results).await?;
                    Ok(RecoveryOutcome::LocalFallback {
                        stats: report.stats,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Auto-cancels jobs past the hard ceiling and removes terminal jobs
    /// older than the retention window. Failures are collected, not raised.
    pub async fn auto_cleanup(&self, now: DateTime<Utc>) -> AutoCleanupReport {
        let mut report = AutoCleanupReport::default();
        for job in self.state.jobs().await {
            if job.status.is_terminal() {
                if job.age(now) > self.config.retention {
                    let deleted = self.delete_job(&job.id).await;
                    if !deleted.is_clean() {
                        report
                            .errors
                            .push(format!("{}: delete incomplete", job.id));
                    }
                    report.removed.push(job.id);
                }
                continue;
            }
            if self.config.stall.assess(&job, now).auto_cancel {
                match self.cancel(&job.id).await {
                    Ok(_) => {
                        warn!(job_id = %job.id, "job exceeded hard ceiling, cancelled");
                        report.cancelled.push(job.id);
                    }
                    Err(err) => report.errors.push(format!("{}: {err}", job.id)),
                }
            }
        }
        if !report.cancelled.is_empty() || !report.removed.is_empty() || !report.errors.is_empty()
        {
            info!(
                cancelled = report.cancelled.len(),
                removed = report.removed.len(),
                errors = report.errors.len(),
                "auto cleanup finished"
            );
        }
        report
    }
}

/// Cron-driven `auto_cleanup`, only when the scheduler is enabled.
pub async fn build_cleanup_scheduler(service: Arc<JobService>) -> Result<Option<JobScheduler>> {
    if !service.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = service.config().cleanup_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            service.auto_cleanup(Utc::now()).await;
        })
    })
    .with_context(|| format!("creating cleanup job for cron {cron}"))?;
    sched.add(job).await.context("adding cleanup job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names() {
        assert_eq!(RecoveryStrategy::parse("recreate"), Some(RecoveryStrategy::Recreate));
        assert_eq!(RecoveryStrategy::parse("Local-Fallback"), Some(RecoveryStrategy::LocalFallback));
        assert_eq!(RecoveryStrategy::parse("local"), Some(RecoveryStrategy::LocalFallback));
        assert_eq!(RecoveryStrategy::parse("retry"), None);
    }
}
