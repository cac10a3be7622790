//! Process-wide working set shared by the engine, the API and recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use payclass_classify::ExpansionProgress;
use payclass_core::{BatchJob, PayeeRowData};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

const EVENT_CAPACITY: usize = 256;

/// What subscribers (UI, CLI watch) get told about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Updated { job: BatchJob },
    Progress { job_id: String, progress: ExpansionProgress },
    ResultsSaved { job_id: String, rows: usize },
    CompletionFailed { job_id: String, message: String },
    Removed { job_id: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Updated { job } => &job.id,
            JobEvent::Progress { job_id, .. }
            | JobEvent::ResultsSaved { job_id, .. }
            | JobEvent::CompletionFailed { job_id, .. }
            | JobEvent::Removed { job_id } => job_id,
        }
    }
}

pub struct AppState {
    jobs: RwLock<HashMap<String, BatchJob>>,
    payee_data: RwLock<HashMap<String, Arc<PayeeRowData>>>,
    emergency_stop: AtomicBool,
    events: broadcast::Sender<JobEvent>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            payee_data: RwLock::new(HashMap::new()),
            emergency_stop: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Fire-and-forget; having no subscribers is not an error.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    pub fn emergency_stop(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    pub fn set_emergency_stop(&self, on: bool) {
        self.emergency_stop.store(on, Ordering::SeqCst);
    }

    pub async fn job(&self, job_id: &str) -> Option<BatchJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn contains_job(&self, job_id: &str) -> bool {
        self.jobs.read().await.contains_key(job_id)
    }

    /// Newest first.
    pub async fn jobs(&self) -> Vec<BatchJob> {
        let mut jobs: Vec<BatchJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.timestamps.created_at.cmp(&a.timestamps.created_at));
        jobs
    }

    pub async fn active_job_ids(&self) -> Vec<String> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.is_active())
            .map(|j| j.id.clone())
            .collect()
    }

    pub async fn upsert_job(&self, job: BatchJob) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }

    /// Drops the job and its row data from the working set.
    pub async fn remove_job(&self, job_id: &str) -> bool {
        let removed = self.jobs.write().await.remove(job_id).is_some();
        self.payee_data.write().await.remove(job_id);
        removed
    }

    pub async fn set_payee_data(&self, job_id: &str, data: Arc<PayeeRowData>) {
        self.payee_data.write().await.insert(job_id.to_string(), data);
    }

    pub async fn payee_data(&self, job_id: &str) -> Option<Arc<PayeeRowData>> {
        self.payee_data.read().await.get(job_id).cloned()
    }
}
