//! Job store contract with Postgres and in-memory implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use payclass_core::{BatchJob, ClassificationRow, DownloadArtifact, PayeeRowData};
use payclass_storage::{RetryDisposition, Retryable};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflicting row: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serializing {what}: {source}")]
    Codec {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl Retryable for StoreError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
            StoreError::Database(err) => match err {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                    RetryDisposition::Retryable
                }
                _ => RetryDisposition::NonRetryable,
            },
            StoreError::Conflict(_) | StoreError::Migrate(_) | StoreError::Codec { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// Persistence for jobs, their row mappings, classification rows and
/// download artifacts. Every write is an upsert.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn upsert_job(&self, job: &BatchJob) -> Result<(), StoreError>;
    async fn get_job(&self, job_id: &str) -> Result<Option<BatchJob>, StoreError>;
    async fn list_jobs(&self) -> Result<Vec<BatchJob>, StoreError>;
    async fn delete_job(&self, job_id: &str) -> Result<bool, StoreError>;

    async fn upsert_payee_data(&self, job_id: &str, data: &PayeeRowData) -> Result<(), StoreError>;
    async fn get_payee_data(&self, job_id: &str) -> Result<Option<PayeeRowData>, StoreError>;
    async fn delete_payee_data(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Upserts by row id; returns the number of rows written.
    async fn upsert_classifications(&self, rows: &[ClassificationRow]) -> Result<usize, StoreError>;
    /// Rows for a job, ordered by row index.
    async fn load_classifications(&self, job_id: &str) -> Result<Vec<ClassificationRow>, StoreError>;
    async fn count_classifications(&self, job_id: &str) -> Result<usize, StoreError>;
    async fn delete_classifications(&self, job_id: &str) -> Result<usize, StoreError>;

    async fn upsert_artifact(&self, artifact: &DownloadArtifact) -> Result<(), StoreError>;
    async fn get_artifact(&self, job_id: &str) -> Result<Option<DownloadArtifact>, StoreError>;
    async fn mark_artifact_stale(&self, job_id: &str) -> Result<bool, StoreError>;
    /// Removes and returns the artifact record so its blob can be cleaned up.
    async fn delete_artifact(&self, job_id: &str) -> Result<Option<DownloadArtifact>, StoreError>;
}

fn decode<T: DeserializeOwned>(what: &'static str, value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|source| StoreError::Codec { what, source })
}

fn encode<T: serde::Serialize>(what: &'static str, value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Codec { what, source })
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_job(&self, job: &BatchJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO batch_jobs (id, status, job_json, created_at, observed_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (id) DO UPDATE
               SET status = EXCLUDED.status,
                   job_json = EXCLUDED.job_json,
                   observed_at = EXCLUDED.observed_at,
                   updated_at = NOW()
            "#,
        )
        .bind(&job.id)
        .bind(job.status.as_str())
        .bind(encode("batch job", job)?)
        .bind(job.timestamps.created_at)
        .bind(job.observed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<BatchJob>, StoreError> {
        let row = sqlx::query("SELECT job_json FROM batch_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode("batch job", r.try_get("job_json")?))
            .transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<BatchJob>, StoreError> {
        let rows = sqlx::query("SELECT job_json FROM batch_jobs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(decode("batch job", row.try_get("job_json")?)?);
        }
        Ok(out)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM batch_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_payee_data(&self, job_id: &str, data: &PayeeRowData) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payee_row_data (job_id, unique_count, row_count, data_json, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (job_id) DO UPDATE
               SET unique_count = EXCLUDED.unique_count,
                   row_count = EXCLUDED.row_count,
                   data_json = EXCLUDED.data_json,
                   updated_at = NOW()
            "#,
        )
        .bind(job_id)
        .bind(data.unique_count() as i64)
        .bind(data.row_count() as i64)
        .bind(encode("payee row data", data)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payee_data(&self, job_id: &str) -> Result<Option<PayeeRowData>, StoreError> {
        let row = sqlx::query("SELECT data_json FROM payee_row_data WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode("payee row data", r.try_get("data_json")?))
            .transpose()
    }

    async fn delete_payee_data(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM payee_row_data WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_classifications(&self, rows: &[ClassificationRow]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO classification_records
                    (id, batch_id, row_index, payee_name, classification, confidence, sic_code,
                     record_json, original_json, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
                ON CONFLICT (id) DO UPDATE
                   SET payee_name = EXCLUDED.payee_name,
                       classification = EXCLUDED.classification,
                       confidence = EXCLUDED.confidence,
                       sic_code = EXCLUDED.sic_code,
                       record_json = EXCLUDED.record_json,
                       original_json = EXCLUDED.original_json,
                       updated_at = NOW()
                "#,
            )
            .bind(row.id)
            .bind(&row.batch_id)
            .bind(row.row_index as i64)
            .bind(&row.payee_name)
            .bind(row.record.classification.as_str())
            .bind(i16::from(row.record.confidence))
            .bind(row.record.sic_code.as_deref())
            .bind(encode("classification record", &row.record)?)
            .bind(encode("original row", &row.original)?)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn load_classifications(&self, job_id: &str) -> Result<Vec<ClassificationRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, batch_id, row_index, payee_name, record_json, original_json
              FROM classification_records
             WHERE batch_id = $1
             ORDER BY row_index
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let row_index: i64 = row.try_get("row_index")?;
            out.push(ClassificationRow {
                id: row.try_get("id")?,
                batch_id: row.try_get("batch_id")?,
                row_index: row_index.max(0) as usize,
                payee_name: row.try_get("payee_name")?,
                record: decode("classification record", row.try_get("record_json")?)?,
                original: decode("original row", row.try_get("original_json")?)?,
            });
        }
        Ok(out)
    }

    async fn count_classifications(&self, job_id: &str) -> Result<usize, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM classification_records WHERE batch_id = $1")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }

    async fn delete_classifications(&self, job_id: &str) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM classification_records WHERE batch_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn upsert_artifact(&self, artifact: &DownloadArtifact) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO download_artifacts
                (job_id, storage_key, url, generated_at, byte_size, content_hash, stale)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id) DO UPDATE
               SET storage_key = EXCLUDED.storage_key,
                   url = EXCLUDED.url,
                   generated_at = EXCLUDED.generated_at,
                   byte_size = EXCLUDED.byte_size,
                   content_hash = EXCLUDED.content_hash,
                   stale = EXCLUDED.stale
            "#,
        )
        .bind(&artifact.job_id)
        .bind(&artifact.storage_key)
        .bind(&artifact.url)
        .bind(artifact.generated_at)
        .bind(artifact.byte_size as i64)
        .bind(&artifact.content_hash)
        .bind(artifact.stale)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_artifact(&self, job_id: &str) -> Result<Option<DownloadArtifact>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, storage_key, url, generated_at, byte_size, content_hash, stale
              FROM download_artifacts
             WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let byte_size: i64 = row.try_get("byte_size")?;
        Ok(Some(DownloadArtifact {
            job_id: row.try_get("job_id")?,
            storage_key: row.try_get("storage_key")?,
            url: row.try_get("url")?,
            generated_at: row.try_get("generated_at")?,
            byte_size: byte_size.max(0) as usize,
            content_hash: row.try_get("content_hash")?,
            stale: row.try_get("stale")?,
        }))
    }

    async fn mark_artifact_stale(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE download_artifacts SET stale = TRUE WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_artifact(&self, job_id: &str) -> Result<Option<DownloadArtifact>, StoreError> {
        let existing = self.get_artifact(job_id).await?;
        sqlx::query("DELETE FROM download_artifacts WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(existing)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<String, BatchJob>,
    payee_data: HashMap<String, PayeeRowData>,
    rows: HashMap<String, BTreeMap<usize, ClassificationRow>>,
    artifacts: HashMap<String, DownloadArtifact>,
}

/// In-process store with the same upsert and uniqueness rules as the
/// Postgres schema. Failures can be injected to exercise fallback paths.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: RwLock<MemoryState>,
    offline: AtomicBool,
    failing_writes: AtomicUsize,
    failing_deletes: AtomicBool,
    dropping_codes: AtomicBool,
    rejected_job_writes: AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a retryable error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fails the next `count` classification writes with a retryable error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Makes classification deletes fail until cleared.
    pub fn set_failing_deletes(&self, failing: bool) {
        self.failing_deletes.store(failing, Ordering::SeqCst);
    }

    /// Rejects the next `count` job upserts with a non-retryable error.
    pub fn reject_next_job_writes(&self, count: usize) {
        self.rejected_job_writes.store(count, Ordering::SeqCst);
    }

    /// Loaded rows come back without industry codes until cleared.
    pub fn set_dropping_industry_codes(&self, dropping: bool) {
        self.dropping_codes.store(dropping, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn upsert_job(&self, job: &BatchJob) -> Result<(), StoreError> {
        self.check_online()?;
        if self
            .rejected_job_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict(format!("job {} write rejected", job.id)));
        }
        self.state.write().await.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<BatchJob>, StoreError> {
        self.check_online()?;
        Ok(self.state.read().await.jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<BatchJob>, StoreError> {
        self.check_online()?;
        let mut jobs: Vec<BatchJob> = self.state.read().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.timestamps.created_at.cmp(&a.timestamps.created_at));
        Ok(jobs)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        Ok(self.state.write().await.jobs.remove(job_id).is_some())
    }

    async fn upsert_payee_data(&self, job_id: &str, data: &PayeeRowData) -> Result<(), StoreError> {
        self.check_online()?;
        self.state
            .write()
            .await
            .payee_data
            .insert(job_id.to_string(), data.clone());
        Ok(())
    }

    async fn get_payee_data(&self, job_id: &str) -> Result<Option<PayeeRowData>, StoreError> {
        self.check_online()?;
        Ok(self.state.read().await.payee_data.get(job_id).cloned())
    }

    async fn delete_payee_data(&self, job_id: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        Ok(self.state.write().await.payee_data.remove(job_id).is_some())
    }

    async fn upsert_classifications(&self, rows: &[ClassificationRow]) -> Result<usize, StoreError> {
        self.check_online()?;
        if self.take_write_failure() {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        let mut state = self.state.write().await;
        for row in rows {
            if let Some(existing) = state.rows.get(&row.batch_id).and_then(|m| m.get(&row.row_index)) {
                if existing.id != row.id {
                    return Err(StoreError::Conflict(format!(
                        "({}, {}) already holds row {}",
                        row.batch_id, row.row_index, existing.id
                    )));
                }
            }
        }
        for row in rows {
            state
                .rows
                .entry(row.batch_id.clone())
                .or_default()
                .insert(row.row_index, row.clone());
        }
        Ok(rows.len())
    }

    async fn load_classifications(&self, job_id: &str) -> Result<Vec<ClassificationRow>, StoreError> {
        self.check_online()?;
        let mut rows: Vec<ClassificationRow> = self
            .state
            .read()
            .await
            .rows
            .get(job_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        if self.dropping_codes.load(Ordering::SeqCst) {
            for row in &mut rows {
                row.record.sic_code = None;
            }
        }
        Ok(rows)
    }

    async fn count_classifications(&self, job_id: &str) -> Result<usize, StoreError> {
        self.check_online()?;
        Ok(self.state.read().await.rows.get(job_id).map_or(0, BTreeMap::len))
    }

    async fn delete_classifications(&self, job_id: &str) -> Result<usize, StoreError> {
        self.check_online()?;
        if self.failing_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected delete failure".to_string()));
        }
        Ok(self
            .state
            .write()
            .await
            .rows
            .remove(job_id)
            .map_or(0, |m| m.len()))
    }

    async fn upsert_artifact(&self, artifact: &DownloadArtifact) -> Result<(), StoreError> {
        self.check_online()?;
        self.state
            .write()
            .await
            .artifacts
            .insert(artifact.job_id.clone(), artifact.clone());
        Ok(())
    }

    async fn get_artifact(&self, job_id: &str) -> Result<Option<DownloadArtifact>, StoreError> {
        self.check_online()?;
        Ok(self.state.read().await.artifacts.get(job_id).cloned())
    }

    async fn mark_artifact_stale(&self, job_id: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut state = self.state.write().await;
        match state.artifacts.get_mut(job_id) {
            Some(artifact) => {
                artifact.stale = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_artifact(&self, job_id: &str) -> Result<Option<DownloadArtifact>, StoreError> {
        self.check_online()?;
        Ok(self.state.write().await.artifacts.remove(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payclass_core::{ClassificationRecord, OriginalRow};

    fn row(batch: &str, index: usize) -> ClassificationRow {
        ClassificationRow {
            id: ClassificationRow::deterministic_id(batch, index),
            batch_id: batch.to_string(),
            row_index: index,
            payee_name: "Jane Doe".to_string(),
            record: ClassificationRecord::placeholder("Jane Doe"),
            original: OriginalRow::new(),
        }
    }

    #[tokio::test]
    async fn memory_store_upserts_by_row_id() {
        let store = MemoryJobStore::new();
        store.upsert_classifications(&[row("batch_a", 0), row("batch_a", 1)]).await.unwrap();
        store.upsert_classifications(&[row("batch_a", 1)]).await.unwrap();
        assert_eq!(store.count_classifications("batch_a").await.unwrap(), 2);
        assert_eq!(store.count_classifications("batch_b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_store_enforces_batch_row_uniqueness() {
        let store = MemoryJobStore::new();
        store.upsert_classifications(&[row("batch_a", 0)]).await.unwrap();
        let mut clash = row("batch_a", 0);
        clash.id = uuid::Uuid::new_v4();
        let err = store.upsert_classifications(&[clash]).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_retryable() {
        let store = MemoryJobStore::new();
        store.fail_next_writes(1);
        let err = store.upsert_classifications(&[row("batch_a", 0)]).await.unwrap_err();
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        store.upsert_classifications(&[row("batch_a", 0)]).await.unwrap();

        store.set_offline(true);
        assert!(store.ping().await.is_err());
    }
}
