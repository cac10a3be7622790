//! Completion pipeline: fetch results, reconcile, expand, persist, verify.

use payclass_classify::{expand_chunked, IndustryCodeLedger, UniqueResults};
use payclass_core::{BatchStatus, ClassificationRow, PayeeRowData};
use payclass_storage::retry_with_backoff;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::persistence::SaveStats;
use crate::service::JobService;
use crate::state::JobEvent;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionReport {
    pub job_id: String,
    pub unique_results: usize,
    pub rows: usize,
    pub failed_records: usize,
    pub stats: SaveStats,
}

impl JobService {
    /// Turns a completed remote job into persisted per-row classifications.
    pub async fn complete_job(&self, job_id: &str) -> Result<CompletionReport, SyncError> {
        let span = info_span!("complete_job", job_id);
        async move {
            let job = self.job(job_id).await?;
            Self::require_status(&job, BatchStatus::Completed, "process results")?;
            let data = self.payee_data_for(job_id).await?;

            let provider = self.lifecycle.provider();
            let raw = retry_with_backoff(
                self.lifecycle.provider_backoff(),
                "get_job_results",
                || provider.get_job_results(&job, &data.unique_payee_names),
            )
            .await?;
            let results = self.reconciler.reconcile_all(&raw, &data);
            self.persist_results(job_id, &data, results).await
        }
        .instrument(span)
        .await
    }

    /// Expands unique results onto every original row and saves them. The
    /// industry codes seen after reconciliation must survive expansion and the
    /// round trip through the store unchanged.
    pub async fn persist_results(
        &self,
        job_id: &str,
        data: &PayeeRowData,
        results: UniqueResults,
    ) -> Result<CompletionReport, SyncError> {
        let ledger = IndustryCodeLedger::capture(&results, data);
        let unique_results = results.len();
        let failed_records = results.values().filter(|r| r.is_failed()).count();

        let state = self.state.clone();
        let progress_job = job_id.to_string();
        let rows = expand_chunked(
            &results,
            data,
            self.config.expansion_chunk_size,
            |progress| {
                state.publish(JobEvent::Progress {
                    job_id: progress_job.clone(),
                    progress,
                });
            },
        )
        .await?;
        ledger.verify_rows("expansion", &rows)?;

        if !self.state.contains_job(job_id).await {
            return Err(SyncError::JobRemoved(job_id.to_string()));
        }

        let to_save: Vec<ClassificationRow> = rows
            .iter()
            .map(|row| ClassificationRow::from_expanded(job_id, row))
            .collect();
        let stats = self
            .persistence
            .save_classifications(job_id, &to_save)
            .await?;

        if stats.cached_locally == 0 && !ledger.is_empty() {
            let stored = self.expanded_rows(job_id).await?;
            if let Err(err) = ledger.verify_rows("persistence", &stored) {
                self.discard_rows(job_id).await;
                return Err(err.into());
            }
        }
        if !stats.industry_code_errors.is_empty() {
            warn!(
                job_id,
                issues = stats.industry_code_errors.len(),
                "industry code problems in saved rows"
            );
        }

        self.state.publish(JobEvent::ResultsSaved {
            job_id: job_id.to_string(),
            rows: rows.len(),
        });
        info!(
            job_id,
            unique = unique_results,
            rows = rows.len(),
            failed = failed_records,
            "results persisted"
        );
        Ok(CompletionReport {
            job_id: job_id.to_string(),
            unique_results,
            rows: rows.len(),
            failed_records,
            stats,
        })
    }

    /// Drops rows that failed verification so the job reads as orphaned and
    /// `ensure_results` can run the pipeline again.
    async fn discard_rows(&self, job_id: &str) {
        match self.store().delete_classifications(job_id).await {
            Ok(removed) => warn!(job_id, removed, "unverified rows discarded"),
            Err(err) => error!(job_id, error = %err, "could not discard unverified rows"),
        }
        if let Err(err) = self.store().mark_artifact_stale(job_id).await {
            warn!(job_id, error = %err, "could not mark download artifact stale");
        }
    }
}
