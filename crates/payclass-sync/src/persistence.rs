//! Idempotent persistence with a local-cache fallback when the store is
//! unreachable.

use std::collections::HashSet;
use std::sync::Arc;

use payclass_classify::is_valid_industry_code;
use payclass_core::{BatchJob, ClassificationRow, PayeeRowData, ValidationWarning};
use payclass_storage::{
    retry_with_backoff, BackoffPolicy, BlobStore, LocalCache, RetryDisposition, Retryable,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::store::{JobStore, StoreError};
use crate::SyncError;

const WRITE_CHUNK: usize = 500;
const JOB_CACHE_KEY: &str = "job";
const PAYEE_DATA_CACHE_KEY: &str = "payee-data";
const ROWS_CACHE_PREFIX: &str = "classifications-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndustryCodeIssue {
    Missing { row_index: usize, payee_name: String },
    Malformed { row_index: usize, payee_name: String, raw: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveStats {
    pub attempted: usize,
    pub written: usize,
    pub duplicates_skipped: usize,
    pub failed_rows: usize,
    pub industry_code_errors: Vec<IndustryCodeIssue>,
    pub cached_locally: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PersistOutcome {
    Stored,
    CachedLocally { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteStep {
    pub step: &'static str,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub job_id: String,
    pub steps: Vec<DeleteStep>,
}

impl DeleteReport {
    pub fn failures(&self) -> Vec<&DeleteStep> {
        self.steps.iter().filter(|s| s.error.is_some()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub jobs_replayed: usize,
    pub rows_replayed: usize,
    pub entries_remaining: usize,
}

fn exhausted(err: &StoreError) -> bool {
    err.disposition() == RetryDisposition::Retryable
}

pub struct Persistence {
    store: Arc<dyn JobStore>,
    cache: LocalCache,
    blobs: Arc<dyn BlobStore>,
    backoff: BackoffPolicy,
}

impl Persistence {
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: LocalCache,
        blobs: Arc<dyn BlobStore>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            blobs,
            backoff,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Upserts the job (and its row data when given). Falls back to the local
    /// cache once retries against the store are exhausted. Row data is cached
    /// under its own key so later job-only saves never drop it.
    pub async fn save_job(
        &self,
        job: &BatchJob,
        payee_data: Option<&PayeeRowData>,
    ) -> Result<PersistOutcome, SyncError> {
        let write = retry_with_backoff(&self.backoff, "save_job", || async move {
            self.store.upsert_job(job).await?;
            if let Some(data) = payee_data {
                self.store.upsert_payee_data(&job.id, data).await?;
            }
            Ok::<_, StoreError>(())
        })
        .await;

        match write {
            Ok(()) => Ok(PersistOutcome::Stored),
            Err(err) if exhausted(&err) => {
                if let Some(data) = payee_data {
                    self.cache.put(&job.id, PAYEE_DATA_CACHE_KEY, data).await?;
                }
                self.cache.put(&job.id, JOB_CACHE_KEY, job).await?;
                warn!(job_id = %job.id, error = %err, "store unreachable, job cached locally");
                Ok(PersistOutcome::CachedLocally {
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Dedups by id and row index (first wins), rejects rows with a malformed
    /// industry code, then upserts in chunks. Any write marks the job's
    /// download artifact stale.
    pub async fn save_classifications(
        &self,
        job_id: &str,
        rows: &[ClassificationRow],
    ) -> Result<SaveStats, SyncError> {
        let span = info_span!("save_classifications", job_id, rows = rows.len());
        async move {
            let mut stats = SaveStats {
                attempted: rows.len(),
                ..SaveStats::default()
            };

            let mut seen_ids = HashSet::new();
            let mut seen_indexes = HashSet::new();
            let mut accepted: Vec<ClassificationRow> = Vec::with_capacity(rows.len());
            for row in rows {
                if !seen_ids.insert(row.id) || !seen_indexes.insert(row.row_index) {
                    stats.duplicates_skipped += 1;
                    continue;
                }
                if let Some(code) = row.record.sic_code.as_deref() {
                    if !is_valid_industry_code(code) {
                        stats.failed_rows += 1;
                        stats.industry_code_errors.push(IndustryCodeIssue::Malformed {
                            row_index: row.row_index,
                            payee_name: row.payee_name.clone(),
                            raw: code.to_string(),
                        });
                        continue;
                    }
                }
                if row
                    .record
                    .warnings
                    .contains(&ValidationWarning::MissingIndustryCode)
                {
                    stats.industry_code_errors.push(IndustryCodeIssue::Missing {
                        row_index: row.row_index,
                        payee_name: row.payee_name.clone(),
                    });
                }
                accepted.push(ClassificationRow {
                    batch_id: job_id.to_string(),
                    ..row.clone()
                });
            }

            let mut next_seq = None;
            for chunk in accepted.chunks(WRITE_CHUNK) {
                let write = retry_with_backoff(&self.backoff, "upsert_classifications", || {
                    self.store.upsert_classifications(chunk)
                })
                .await;
                match write {
                    Ok(written) => stats.written += written,
                    Err(err) if exhausted(&err) => {
                        let seq = match next_seq {
                            Some(seq) => seq,
                            None => self.next_rows_seq(job_id).await?,
                        };
                        next_seq = Some(seq + 1);
                        let key = format!("{ROWS_CACHE_PREFIX}{seq:08}");
                        self.cache.put(job_id, &key, &chunk.to_vec()).await?;
                        stats.cached_locally += chunk.len();
                        stats.warnings.push(format!(
                            "{} rows cached locally, store unreachable: {err}",
                            chunk.len()
                        ));
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            if stats.written > 0 {
                if let Err(err) = self.store.mark_artifact_stale(job_id).await {
                    warn!(job_id, error = %err, "could not mark download artifact stale");
                }
            }
            info!(
                attempted = stats.attempted,
                written = stats.written,
                duplicates = stats.duplicates_skipped,
                failed = stats.failed_rows,
                cached = stats.cached_locally,
                "classifications saved"
            );
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    /// Cached row chunks are numbered per job so every fallback save is kept
    /// and replayed in the order it was written.
    async fn next_rows_seq(&self, job_id: &str) -> Result<u64, SyncError> {
        let last = self
            .cache
            .keys(job_id)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(ROWS_CACHE_PREFIX)?.parse::<u64>().ok())
            .max();
        Ok(last.map_or(0, |seq| seq + 1))
    }

    pub async fn load_rows(&self, job_id: &str) -> Result<Vec<ClassificationRow>, SyncError> {
        Ok(
            retry_with_backoff(&self.backoff, "load_classifications", || {
                self.store.load_classifications(job_id)
            })
            .await?,
        )
    }

    /// Re-sends cached payloads. Entries are removed only after the store
    /// accepted them.
    pub async fn replay_cached(&self) -> Result<ReplayReport, SyncError> {
        let mut report = ReplayReport::default();
        for namespace in self.cache.namespaces().await? {
            let keys = self.cache.keys(&namespace).await?;
            let mut remaining = 0usize;
            for key in keys {
                let replayed = if key == JOB_CACHE_KEY {
                    self.replay_job(&namespace).await.map(|n| {
                        report.jobs_replayed += n;
                    })
                } else if key == PAYEE_DATA_CACHE_KEY {
                    self.replay_payee_data(&namespace).await
                } else if key.starts_with(ROWS_CACHE_PREFIX) {
                    self.replay_rows(&namespace, &key).await.map(|n| {
                        report.rows_replayed += n;
                    })
                } else {
                    Ok(())
                };
                match replayed {
                    Ok(()) => self.cache.remove(&namespace, &key).await?,
                    Err(err) => {
                        warn!(job_id = %namespace, key = %key, error = %err, "cached payload not replayed");
                        remaining += 1;
                    }
                }
            }
            if remaining == 0 {
                self.cache.remove_namespace(&namespace).await?;
            }
            report.entries_remaining += remaining;
        }
        Ok(report)
    }

    async fn replay_job(&self, namespace: &str) -> Result<usize, SyncError> {
        let Some(job) = self.cache.get::<BatchJob>(namespace, JOB_CACHE_KEY).await? else {
            return Ok(0);
        };
        if let Some(stored) = self.store.get_job(namespace).await? {
            if stored.observed_at > job.observed_at {
                info!(job_id = %job.id, "store already holds a newer snapshot, cached job dropped");
                return Ok(0);
            }
        }
        self.store.upsert_job(&job).await?;
        Ok(1)
    }

    async fn replay_payee_data(&self, namespace: &str) -> Result<(), SyncError> {
        if let Some(data) = self
            .cache
            .get::<PayeeRowData>(namespace, PAYEE_DATA_CACHE_KEY)
            .await?
        {
            self.store.upsert_payee_data(namespace, &data).await?;
        }
        Ok(())
    }

    async fn replay_rows(&self, namespace: &str, key: &str) -> Result<usize, SyncError> {
        let Some(rows) = self.cache.get::<Vec<ClassificationRow>>(namespace, key).await? else {
            return Ok(0);
        };
        let written = self.store.upsert_classifications(&rows).await?;
        self.store.mark_artifact_stale(namespace).await?;
        Ok(written)
    }

    /// Removes everything stored for a job. Every step runs even if an
    /// earlier one failed.
    pub async fn delete_job(&self, job_id: &str) -> DeleteReport {
        let mut steps = Vec::new();
        let mut record = |step: &'static str, result: Result<(), SyncError>| {
            if let Err(err) = &result {
                warn!(job_id, step, error = %err, "delete step failed");
            }
            steps.push(DeleteStep {
                step,
                error: result.err().map(|e| e.to_string()),
            });
        };

        record(
            "job_metadata",
            self.store.delete_job(job_id).await.map(|_| ()).map_err(Into::into),
        );
        record(
            "row_mapping",
            self.store.delete_payee_data(job_id).await.map(|_| ()).map_err(Into::into),
        );
        record(
            "classification_rows",
            self.store
                .delete_classifications(job_id)
                .await
                .map(|_| ())
                .map_err(Into::into),
        );
        let artifact = match self.store.delete_artifact(job_id).await {
            Ok(artifact) => {
                record("download_artifact", Ok(()));
                artifact
            }
            Err(err) => {
                record("download_artifact", Err(err.into()));
                None
            }
        };
        if let Some(artifact) = artifact {
            record(
                "artifact_blob",
                self.blobs
                    .remove(&artifact.storage_key)
                    .await
                    .map_err(Into::into),
            );
        }
        record(
            "local_cache",
            self.cache.remove_namespace(job_id).await.map_err(Into::into),
        );

        DeleteReport {
            job_id: job_id.to_string(),
            steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;
    use payclass_core::{ClassificationRecord, OriginalRow};
    use payclass_storage::FsBlobStore;
    use std::time::Duration;

    fn row(batch: &str, index: usize, sic: Option<&str>) -> ClassificationRow {
        let mut record = ClassificationRecord::placeholder("Acme Inc");
        record.sic_code = sic.map(str::to_string);
        ClassificationRow {
            id: ClassificationRow::deterministic_id(batch, index),
            batch_id: batch.to_string(),
            row_index: index,
            payee_name: "Acme Inc".to_string(),
            record,
            original: OriginalRow::new(),
        }
    }

    fn persistence(dir: &tempfile::TempDir, store: Arc<MemoryJobStore>) -> Persistence {
        Persistence::new(
            store,
            LocalCache::new(dir.path().join("cache")),
            Arc::new(FsBlobStore::new(dir.path().join("blobs"), "/files")),
            BackoffPolicy::with_retries(1, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn saving_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let persistence = persistence(&dir, store.clone());
        let rows = vec![row("batch_a", 0, Some("5812")), row("batch_a", 1, None), row("batch_a", 1, None)];

        let first = persistence.save_classifications("batch_a", &rows).await.unwrap();
        assert_eq!(first.attempted, 3);
        assert_eq!(first.written, 2);
        assert_eq!(first.duplicates_skipped, 1);

        persistence.save_classifications("batch_a", &rows).await.unwrap();
        assert_eq!(store.count_classifications("batch_a").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn malformed_codes_are_rejected_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let persistence = persistence(&dir, store.clone());
        let rows = vec![row("batch_a", 0, Some("58x2")), row("batch_a", 1, Some("5812"))];

        let stats = persistence.save_classifications("batch_a", &rows).await.unwrap();
        assert_eq!(stats.failed_rows, 1);
        assert_eq!(stats.written, 1);
        assert!(matches!(
            stats.industry_code_errors.as_slice(),
            [IndustryCodeIssue::Malformed { row_index: 0, .. }]
        ));
    }

    #[tokio::test]
    async fn unreachable_store_falls_back_then_replays() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let persistence = persistence(&dir, store.clone());
        store.fail_next_writes(2);

        let stats = persistence
            .save_classifications("batch_a", &[row("batch_a", 0, None)])
            .await
            .unwrap();
        assert_eq!(stats.cached_locally, 1);
        assert_eq!(stats.written, 0);
        assert_eq!(stats.warnings.len(), 1);

        let report = persistence.replay_cached().await.unwrap();
        assert_eq!(report.rows_replayed, 1);
        assert_eq!(report.entries_remaining, 0);
        assert_eq!(store.count_classifications("batch_a").await.unwrap(), 1);
        assert!(persistence.cache().namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_offline_save_is_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let persistence = persistence(&dir, store.clone());
        store.set_offline(true);

        for index in 0..2 {
            let stats = persistence
                .save_classifications("batch_a", &[row("batch_a", index, None)])
                .await
                .unwrap();
            assert_eq!(stats.cached_locally, 1);
        }
        assert_eq!(persistence.cache().keys("batch_a").await.unwrap().len(), 2);

        store.set_offline(false);
        let report = persistence.replay_cached().await.unwrap();
        assert_eq!(report.rows_replayed, 2);
        assert_eq!(store.count_classifications("batch_a").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_attempts_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let persistence = persistence(&dir, store.clone());
        persistence
            .save_classifications("batch_a", &[row("batch_a", 0, None)])
            .await
            .unwrap();
        store.set_failing_deletes(true);

        let report = persistence.delete_job("batch_a").await;
        assert!(!report.is_clean());
        let failed: Vec<&str> = report.failures().iter().map(|s| s.step).collect();
        assert_eq!(failed, vec!["classification_rows"]);
        assert!(report.steps.iter().any(|s| s.step == "download_artifact"));
        assert!(report.steps.iter().any(|s| s.step == "local_cache"));
    }
}
