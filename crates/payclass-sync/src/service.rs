use std::sync::Arc;

use chrono::Utc;
use payclass_adapters::BatchProvider;
use payclass_classify::{
    build_mapping, export_csv, IndustryCodePolicy, KeywordMatcher, LocalClassifier, Reconciler,
};
use payclass_core::{
    BatchJob, BatchStatus, DownloadArtifact, ExpandedRow, OriginalFileData, PayeeRowData,
    StatusUpdate,
};
use payclass_storage::{sha256_hex, BlobStore, LocalCache};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::machine::{apply_status_update, JobLifecycle, UpdateOutcome};
use crate::persistence::{DeleteReport, Persistence, PersistOutcome};
use crate::state::{AppState, JobEvent};
use crate::store::JobStore;
use crate::SyncError;

/// Application services shared by the engine, the HTTP API, the CLI and
/// the recovery jobs.
pub struct JobService {
    pub(crate) config: SyncConfig,
    pub(crate) state: Arc<AppState>,
    pub(crate) lifecycle: JobLifecycle,
    pub(crate) persistence: Persistence,
    pub(crate) reconciler: Reconciler,
    pub(crate) local: LocalClassifier,
    /// Held from reading a job through persisting its merged state.
    updates: Mutex<()>,
}

impl JobService {
    pub fn new(
        config: SyncConfig,
        state: Arc<AppState>,
        provider: Arc<dyn BatchProvider>,
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        keywords: KeywordMatcher,
    ) -> Self {
        let lifecycle = JobLifecycle::new(provider, config.provider_backoff);
        let persistence = Persistence::new(
            store,
            LocalCache::new(config.cache_dir.clone()),
            blobs,
            config.store_backoff,
        );
        Self {
            reconciler: Reconciler::new(keywords.clone(), IndustryCodePolicy::default()),
            local: LocalClassifier::new(keywords),
            config,
            state,
            lifecycle,
            persistence,
            updates: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn lifecycle(&self) -> &JobLifecycle {
        &self.lifecycle
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.persistence.store()
    }

    /// Loads stored jobs and their row data into the working set.
    pub async fn hydrate(&self) -> Result<usize, SyncError> {
        let jobs = self.store().list_jobs().await?;
        let count = jobs.len();
        for job in jobs {
            if let Some(data) = self.store().get_payee_data(&job.id).await? {
                self.state.set_payee_data(&job.id, Arc::new(data)).await;
            }
            self.state.upsert_job(job).await;
        }
        Ok(count)
    }

    /// Working-set copy first, then the store.
    pub async fn job(&self, job_id: &str) -> Result<BatchJob, SyncError> {
        if let Some(job) = self.state.job(job_id).await {
            return Ok(job);
        }
        match self.store().get_job(job_id).await? {
            Some(job) => {
                self.state.upsert_job(job.clone()).await;
                Ok(job)
            }
            None => Err(SyncError::JobNotFound(job_id.to_string())),
        }
    }

    pub async fn payee_data_for(&self, job_id: &str) -> Result<Arc<PayeeRowData>, SyncError> {
        if let Some(data) = self.state.payee_data(job_id).await {
            return Ok(data);
        }
        match self.store().get_payee_data(job_id).await? {
            Some(data) => {
                let data = Arc::new(data);
                self.state.set_payee_data(job_id, data.clone()).await;
                Ok(data)
            }
            None => Err(SyncError::MissingPayeeData(job_id.to_string())),
        }
    }

    /// Maps the upload, creates the remote job from the unique names and
    /// records both locally.
    pub async fn submit(
        &self,
        file: OriginalFileData,
        payee_column: &str,
        description: Option<&str>,
    ) -> Result<BatchJob, SyncError> {
        let data = build_mapping(file, payee_column)?;
        if data.unique_payee_names.iter().all(|n| n.trim().is_empty()) {
            return Err(SyncError::InvalidInput(format!(
                "no payee names found in column {payee_column:?}"
            )));
        }
        let span = info_span!("submit", rows = data.row_count(), unique = data.unique_count());
        async move {
            let job = self
                .lifecycle
                .create(&data.unique_payee_names, description)
                .await?;
            let data = Arc::new(data);
            self.state.set_payee_data(&job.id, data.clone()).await;
            self.state.upsert_job(job.clone()).await;
            if let PersistOutcome::CachedLocally { reason } =
                self.persistence.save_job(&job, Some(&*data)).await?
            {
                warn!(job_id = %job.id, %reason, "new job only cached locally");
            }
            self.state.publish(JobEvent::Updated { job: job.clone() });
            Ok(job)
        }
        .instrument(span)
        .await
    }

    /// Runs one snapshot through the state machine and persists the result.
    /// The working set only changes once the store (or the local cache) has
    /// taken the new state, so a failed save leaves the update re-appliable.
    pub async fn apply_update(&self, update: &StatusUpdate) -> Result<UpdateOutcome, SyncError> {
        let _serialized = self.updates.lock().await;
        let current = self
            .state
            .job(&update.job_id)
            .await
            .ok_or_else(|| SyncError::JobNotFound(update.job_id.clone()))?;
        let outcome = apply_status_update(&current, update);
        match &outcome {
            UpdateOutcome::Applied(job) => {
                self.persistence.save_job(job, None).await?;
                self.state.upsert_job(job.clone()).await;
                if job.status != current.status {
                    info!(job_id = %job.id, from = %current.status, to = %job.status, "job status changed");
                }
            }
            UpdateOutcome::Ignored(reason) => {
                debug!(job_id = %update.job_id, source = ?update.source, %reason, "status update ignored");
            }
        }
        Ok(outcome)
    }

    /// Cancels at the provider, then applies the provider's answer. On
    /// failure local state is left as it was.
    pub async fn cancel(&self, job_id: &str) -> Result<BatchJob, SyncError> {
        let job = self.job(job_id).await?;
        if job.status.is_terminal() {
            return Err(SyncError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                action: "cancel",
            });
        }
        let update = self.lifecycle.cancel(job_id).await?;
        match self.apply_update(&update).await? {
            UpdateOutcome::Applied(job) => {
                self.state.publish(JobEvent::Updated { job: job.clone() });
                Ok(job)
            }
            UpdateOutcome::Ignored(_) => self.job(job_id).await,
        }
    }

    pub async fn delete_job(&self, job_id: &str) -> DeleteReport {
        let was_tracked = {
            let _serialized = self.updates.lock().await;
            self.state.remove_job(job_id).await
        };
        let report = self.persistence.delete_job(job_id).await;
        if was_tracked {
            self.state.publish(JobEvent::Removed {
                job_id: job_id.to_string(),
            });
        }
        info!(job_id, clean = report.is_clean(), "job deleted");
        report
    }

    pub async fn expanded_rows(&self, job_id: &str) -> Result<Vec<ExpandedRow>, SyncError> {
        Ok(self
            .persistence
            .load_rows(job_id)
            .await?
            .iter()
            .map(|row| row.to_expanded())
            .collect())
    }

    /// Returns the current CSV artifact, regenerating it when missing or
    /// stale.
    pub async fn download(&self, job_id: &str) -> Result<DownloadArtifact, SyncError> {
        if let Some(artifact) = self.store().get_artifact(job_id).await? {
            if !artifact.stale {
                return Ok(artifact);
            }
        }
        let rows = self.expanded_rows(job_id).await?;
        if rows.is_empty() {
            return Err(SyncError::NoResults(job_id.to_string()));
        }
        let columns = match self.payee_data_for(job_id).await {
            Ok(data) => data.original_file_data.columns.clone(),
            Err(SyncError::MissingPayeeData(_)) => Vec::new(),
            Err(err) => return Err(err),
        };
        let bytes = export_csv(&rows, &columns)?;
        let storage_key = format!("{job_id}/classifications.csv");
        let url = self.persistence.blobs().upload(&storage_key, &bytes).await?;
        let artifact = DownloadArtifact {
            job_id: job_id.to_string(),
            storage_key,
            url,
            generated_at: Utc::now(),
            byte_size: bytes.len(),
            content_hash: sha256_hex(&bytes),
            stale: false,
        };
        self.store().upsert_artifact(&artifact).await?;
        info!(job_id, bytes = artifact.byte_size, "download artifact generated");
        Ok(artifact)
    }

    pub(crate) fn require_status(
        job: &BatchJob,
        status: BatchStatus,
        action: &'static str,
    ) -> Result<(), SyncError> {
        if job.status == status {
            Ok(())
        } else {
            Err(SyncError::InvalidState {
                job_id: job.id.clone(),
                status: job.status,
                action,
            })
        }
    }
}
