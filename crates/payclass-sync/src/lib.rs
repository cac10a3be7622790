//! Batch job lifecycle, persistence, status sync and recovery.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use payclass_adapters::{provider_for_kind, BatchProvider, ProviderError};
use payclass_classify::{ConsistencyError, ExportError, KeywordMatcher, MappingError};
use payclass_core::BatchStatus;
use payclass_storage::{FsBlobStore, RetryDisposition, Retryable, StorageError};
use thiserror::Error;
use tracing::{info, warn};

pub mod config;
pub mod machine;
pub mod persistence;
pub mod pipeline;
pub mod polling;
pub mod recovery;
pub mod service;
pub mod state;
pub mod store;

pub use config::SyncConfig;
pub use machine::{
    apply_status_update, IgnoreReason, JobLifecycle, StallAssessment, StallPolicy, UpdateOutcome,
};
pub use persistence::{
    DeleteReport, DeleteStep, IndustryCodeIssue, Persistence, PersistOutcome, ReplayReport,
    SaveStats,
};
pub use pipeline::CompletionReport;
pub use polling::{
    render_probability, AgeSampler, AlwaysRender, NeverRender, RenderSampler, SyncEngine,
};
pub use recovery::{
    build_cleanup_scheduler, AutoCleanupReport, CleanupReport, EnsureOutcome, RecoveryOutcome,
    RecoveryStrategy,
};
pub use service::JobService;
pub use state::{AppState, JobEvent};
pub use store::{JobStore, MemoryJobStore, PgJobStore, StoreError};

pub const CRATE_NAME: &str = "payclass-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {job_id} is {status}; cannot {action}")]
    InvalidState {
        job_id: String,
        status: BatchStatus,
        action: &'static str,
    },
    #[error("no payee data stored for job {0}")]
    MissingPayeeData(String),
    #[error("job {0} was removed while its results were being processed")]
    JobRemoved(String),
    #[error("job {0} has no classification results yet")]
    NoResults(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("sync engine is not running")]
    EngineStopped,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Provider(err) => err.disposition() == RetryDisposition::Retryable,
            SyncError::Store(err) => err.disposition() == RetryDisposition::Retryable,
            SyncError::Storage(StorageError::Io { .. }) => true,
            _ => false,
        }
    }

    /// Message shown to the person who triggered the action.
    pub fn user_message(&self) -> String {
        if self.is_retryable() {
            format!("{self}. This looks temporary, please retry.")
        } else {
            self.to_string()
        }
    }
}

/// Keyword rules from YAML when the file exists, built-in defaults otherwise.
pub fn load_keywords(path: &Path) -> anyhow::Result<KeywordMatcher> {
    if path.exists() {
        let matcher = KeywordMatcher::from_yaml_path(path)?;
        info!(path = %path.display(), keywords = matcher.len(), "loaded keyword rules");
        Ok(matcher)
    } else {
        warn!(path = %path.display(), "keyword rules missing, using built-in list");
        Ok(KeywordMatcher::default())
    }
}

pub async fn open_store(config: &SyncConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgJobStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, jobs are kept in memory only");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

/// Everything a running process needs, wired from one config.
#[derive(Clone)]
pub struct SyncRuntime {
    pub service: Arc<JobService>,
    pub engine: Arc<SyncEngine>,
}

impl SyncRuntime {
    pub fn new(service: Arc<JobService>, sampler: Arc<dyn RenderSampler>) -> Self {
        let engine = SyncEngine::start(service.clone(), sampler);
        Self { service, engine }
    }

    pub fn state(&self) -> &Arc<AppState> {
        self.service.state()
    }
}

pub async fn build_runtime(config: SyncConfig) -> anyhow::Result<SyncRuntime> {
    let provider: Arc<dyn BatchProvider> = provider_for_kind(config.provider, config.openai.clone())
        .context("building batch provider")?;
    let store = open_store(&config).await?;
    let blobs = Arc::new(FsBlobStore::new(
        config.artifacts_dir.clone(),
        config.artifacts_base_url.clone(),
    ));
    let keywords = load_keywords(&config.keyword_rules_path)?;
    let state = Arc::new(AppState::new());
    let service = Arc::new(JobService::new(config, state, provider, store, blobs, keywords));

    let hydrated = service.hydrate().await.context("loading stored jobs")?;
    match service.persistence().replay_cached().await {
        Ok(report) if report.jobs_replayed + report.rows_replayed > 0 => {
            info!(?report, "replayed locally cached writes");
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "could not replay local cache"),
    }

    let runtime = SyncRuntime::new(service, Arc::new(AgeSampler::default()));
    runtime.engine.resume_active().await;
    info!(jobs = hydrated, "sync runtime ready");
    Ok(runtime)
}

pub async fn runtime_from_env() -> anyhow::Result<SyncRuntime> {
    build_runtime(SyncConfig::from_env()).await
}
