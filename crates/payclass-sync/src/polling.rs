//! Status sync: one poller per active job plus push updates, funnelled
//! through a single queue and applied in one place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use payclass_core::{BatchJob, BatchStatus, OriginalFileData, StatusUpdate};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::machine::UpdateOutcome;
use crate::persistence::DeleteReport;
use crate::pipeline::CompletionReport;
use crate::recovery::{CleanupReport, RecoveryOutcome, RecoveryStrategy};
use crate::service::JobService;
use crate::state::JobEvent;
use crate::SyncError;

const QUEUE_CAPACITY: usize = 256;

/// Decides whether a non-status-changing update is worth publishing.
pub trait RenderSampler: Send + Sync {
    fn should_render(&self, job_id: &str, age: chrono::Duration) -> bool;
}

/// Older jobs are published less often.
pub fn render_probability(age: chrono::Duration) -> f64 {
    if age < chrono::Duration::hours(1) {
        1.0
    } else if age < chrono::Duration::hours(6) {
        0.5
    } else if age < chrono::Duration::hours(24) {
        0.2
    } else {
        0.05
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AgeSampler;

impl RenderSampler for AgeSampler {
    fn should_render(&self, _job_id: &str, age: chrono::Duration) -> bool {
        rand::random::<f64>() < render_probability(age)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRender;

impl RenderSampler for AlwaysRender {
    fn should_render(&self, _job_id: &str, _age: chrono::Duration) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRender;

impl RenderSampler for NeverRender {
    fn should_render(&self, _job_id: &str, _age: chrono::Duration) -> bool {
        false
    }
}

struct QueuedUpdate {
    update: StatusUpdate,
    reply: Option<oneshot::Sender<Result<UpdateOutcome, SyncError>>>,
}

type TaskMap = Mutex<HashMap<String, JoinHandle<()>>>;

fn lock(map: &TaskMap) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct SyncEngine {
    service: Arc<JobService>,
    queue: mpsc::Sender<QueuedUpdate>,
    pollers: TaskMap,
    completions: TaskMap,
    sampler: Arc<dyn RenderSampler>,
}

impl SyncEngine {
    /// Spawns the single consumer that applies every queued update.
    pub fn start(service: Arc<JobService>, sampler: Arc<dyn RenderSampler>) -> Arc<Self> {
        let (queue, mut rx) = mpsc::channel::<QueuedUpdate>(QUEUE_CAPACITY);
        let engine = Arc::new(Self {
            service,
            queue,
            pollers: Mutex::new(HashMap::new()),
            completions: Mutex::new(HashMap::new()),
            sampler,
        });
        let weak = Arc::downgrade(&engine);
        tokio::spawn(
            async move {
                while let Some(queued) = rx.recv().await {
                    let Some(engine) = weak.upgrade() else {
                        break;
                    };
                    let result = engine.handle(queued.update).await;
                    if let Err(err) = &result {
                        warn!(error = %err, "status update not applied");
                    }
                    if let Some(reply) = queued.reply {
                        let _ = reply.send(result);
                    }
                }
                debug!("update consumer stopped");
            }
            .instrument(info_span!("update_consumer")),
        );
        engine
    }

    pub fn service(&self) -> &Arc<JobService> {
        &self.service
    }

    async fn enqueue(
        &self,
        update: StatusUpdate,
        reply: Option<oneshot::Sender<Result<UpdateOutcome, SyncError>>>,
    ) -> Result<(), SyncError> {
        self.queue
            .send(QueuedUpdate { update, reply })
            .await
            .map_err(|_| SyncError::EngineStopped)
    }

    /// Queues an externally pushed snapshot and waits for it to be applied.
    pub async fn ingest_push(&self, update: StatusUpdate) -> Result<UpdateOutcome, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(update, Some(tx)).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    /// Fetches the job once and applies the answer through the queue.
    pub async fn poll_now(&self, job_id: &str) -> Result<UpdateOutcome, SyncError> {
        let update = self.service.lifecycle().fetch_update(job_id).await?;
        self.ingest_push(update).await
    }

    /// Starts a poller for the job unless one is already running.
    pub fn track(self: &Arc<Self>, job_id: &str) {
        let mut pollers = lock(&self.pollers);
        if pollers.get(job_id).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.service.config().poll_interval;
        let id = job_id.to_string();
        let handle = tokio::spawn(
            poll_loop(weak, id.clone(), interval).instrument(info_span!("poller", job_id = %id)),
        );
        pollers.insert(job_id.to_string(), handle);
    }

    pub fn stop_polling(&self, job_id: &str) -> bool {
        match lock(&self.pollers).remove(job_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn active_pollers(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.pollers)
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Starts pollers for every non-terminal job in the working set.
    pub async fn resume_active(self: &Arc<Self>) -> usize {
        let ids = self.service.state().active_job_ids().await;
        for id in &ids {
            self.track(id);
        }
        if !ids.is_empty() {
            info!(jobs = ids.len(), "resumed polling");
        }
        ids.len()
    }

    /// Submits through the service and starts tracking the new job.
    pub async fn submit(
        self: &Arc<Self>,
        file: OriginalFileData,
        payee_column: &str,
        description: Option<&str>,
    ) -> Result<BatchJob, SyncError> {
        let job = self.service.submit(file, payee_column, description).await?;
        self.track(&job.id);
        Ok(job)
    }

    /// Stops polling and cancels remotely. A failed cancel resumes polling.
    pub async fn cancel(self: &Arc<Self>, job_id: &str) -> Result<BatchJob, SyncError> {
        let was_polling = self.stop_polling(job_id);
        match self.service.cancel(job_id).await {
            Ok(job) => Ok(job),
            Err(err) => {
                if was_polling {
                    self.track(job_id);
                }
                Err(err)
            }
        }
    }

    /// A completion task already in flight is left to finish; it notices the
    /// job is gone and discards its result.
    pub async fn delete(&self, job_id: &str) -> DeleteReport {
        self.stop_polling(job_id);
        let detached = lock(&self.completions).remove(job_id);
        drop(detached);
        self.service.delete_job(job_id).await
    }

    /// Runs a recovery with the job's poller paused. A recreated job gets its
    /// own poller; a failed recovery resumes polling the original job.
    pub async fn recover(
        self: &Arc<Self>,
        job_id: &str,
        strategy: RecoveryStrategy,
    ) -> Result<RecoveryOutcome, SyncError> {
        let was_polling = strategy == RecoveryStrategy::Recreate && self.stop_polling(job_id);
        let outcome = self.service.recover_stuck_job(job_id, strategy).await;
        match &outcome {
            Ok(RecoveryOutcome::Recreated { job, .. }) => self.track(&job.id),
            Ok(RecoveryOutcome::LocalFallback { .. }) => {}
            Err(_) if was_polling => {
                let still_active = self
                    .service
                    .state()
                    .job(job_id)
                    .await
                    .is_some_and(|job| job.is_active());
                if still_active {
                    self.track(job_id);
                }
            }
            Err(_) => {}
        }
        outcome
    }

    /// Phantom cleanup that also drops the pollers of removed jobs.
    pub async fn cleanup_phantom_jobs(&self, jobs: &[BatchJob]) -> CleanupReport {
        let report = self.service.cleanup_phantom_jobs(jobs).await;
        for (job_id, _) in &report.removed {
            self.stop_polling(job_id);
            lock(&self.completions).remove(job_id);
        }
        report
    }

    /// Waits for the completion task of a job, if one was started.
    pub async fn wait_for_completion(&self, job_id: &str) -> bool {
        let handle = lock(&self.completions).remove(job_id);
        match handle {
            Some(handle) => handle.await.is_ok(),
            None => false,
        }
    }

    async fn handle(self: &Arc<Self>, update: StatusUpdate) -> Result<UpdateOutcome, SyncError> {
        let previous = self.service.state().job(&update.job_id).await;
        let outcome = self.service.apply_update(&update).await?;
        if let UpdateOutcome::Applied(job) = &outcome {
            let status_changed = previous.map_or(true, |p| p.status != job.status);
            if self.should_publish(job, status_changed) {
                self.service
                    .state()
                    .publish(JobEvent::Updated { job: job.clone() });
            }
            if job.status.is_terminal() {
                self.stop_polling(&job.id);
            }
            if status_changed && job.status == BatchStatus::Completed {
                self.spawn_completion(&job.id);
            }
        }
        Ok(outcome)
    }

    fn should_publish(&self, job: &BatchJob, status_changed: bool) -> bool {
        if job.status.is_terminal() {
            return true;
        }
        if self.service.state().emergency_stop() {
            return false;
        }
        status_changed || self.sampler.should_render(&job.id, job.age(Utc::now()))
    }

    fn spawn_completion(&self, job_id: &str) {
        let service = self.service.clone();
        let id = job_id.to_string();
        let handle = tokio::spawn(
            async move {
                report_completion(&service, &id, service.complete_job(&id).await);
            }
            .instrument(info_span!("completion", job_id)),
        );
        lock(&self.completions).insert(job_id.to_string(), handle);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for (_, handle) in lock(&self.pollers).drain() {
            handle.abort();
        }
    }
}

fn report_completion(
    service: &JobService,
    job_id: &str,
    result: Result<CompletionReport, SyncError>,
) {
    match result {
        Ok(report) => info!(job_id, rows = report.rows, "completion pipeline finished"),
        Err(SyncError::JobRemoved(_)) => {
            debug!(job_id, "job removed during completion, results discarded");
        }
        Err(err) => {
            error!(job_id, error = %err, "completion pipeline failed");
            service.state().publish(JobEvent::CompletionFailed {
                job_id: job_id.to_string(),
                message: err.user_message(),
            });
        }
    }
}

/// Polls until the job settles or leaves the working set. A snapshot that
/// could not be applied is fetched again on the next tick.
async fn poll_loop(engine: Weak<SyncEngine>, job_id: String, interval: std::time::Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(strong) = engine.upgrade() else {
            return;
        };
        if !strong.service.state().contains_job(&job_id).await {
            debug!(%job_id, "job no longer tracked, polling stopped");
            return;
        }
        let fetched = strong.service.lifecycle().fetch_update(&job_id).await;
        match fetched {
            Ok(update) => {
                let terminal = update.status.is_terminal();
                match strong.ingest_push(update).await {
                    Ok(_) if terminal => return,
                    Ok(_) => {}
                    Err(SyncError::EngineStopped) => return,
                    Err(err) => warn!(%job_id, error = %err, "poll result not applied, will retry"),
                }
            }
            Err(SyncError::Provider(err)) if err.is_not_found() => {
                warn!(%job_id, "job unknown to provider, polling stopped");
                return;
            }
            Err(err) => warn!(%job_id, error = %err, "poll failed, will retry next interval"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_probability_falls_with_age() {
        assert_eq!(render_probability(chrono::Duration::minutes(10)), 1.0);
        assert_eq!(render_probability(chrono::Duration::hours(2)), 0.5);
        assert_eq!(render_probability(chrono::Duration::hours(12)), 0.2);
        assert_eq!(render_probability(chrono::Duration::days(3)), 0.05);
    }

    #[test]
    fn fixed_samplers() {
        assert!(AlwaysRender.should_render("batch_x", chrono::Duration::days(10)));
        assert!(!NeverRender.should_render("batch_x", chrono::Duration::zero()));
        assert!(AgeSampler.should_render("batch_x", chrono::Duration::zero()));
    }
}
