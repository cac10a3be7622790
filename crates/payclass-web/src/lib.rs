//! Axum action API over the sync runtime.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use payclass_classify::read_csv;
use payclass_core::BatchJob;
use payclass_sync::{
    build_cleanup_scheduler, build_runtime, EnsureOutcome, RecoveryOutcome, RecoveryStrategy,
    SyncConfig, SyncError, SyncRuntime,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "payclass-web";

const DEFAULT_PAYEE_COLUMN: &str = "Payee";

#[derive(Clone)]
pub struct WebState {
    pub runtime: SyncRuntime,
}

impl WebState {
    pub fn new(runtime: SyncRuntime) -> Self {
        Self { runtime }
    }
}

/// Result of a user-initiated action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub ok: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl ActionOutcome {
    fn success(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            job_id,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            job_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: BatchJob,
    pub advisory: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SubmitQuery {
    payee_column: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RecoverQuery {
    strategy: Option<String>,
}

type Shared = State<Arc<WebState>>;

pub fn app(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(list_jobs_handler).post(submit_handler))
        .route("/jobs/{id}", get(job_handler).delete(delete_handler))
        .route("/jobs/{id}/cancel", post(cancel_handler))
        .route("/jobs/{id}/recover", post(recover_handler))
        .route("/jobs/{id}/ensure-results", post(ensure_results_handler))
        .route("/jobs/{id}/download", get(download_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(runtime: SyncRuntime, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "action api listening");
    axum::serve(listener, app(WebState::new(runtime))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port = config.web_port;
    let runtime = build_runtime(config).await?;
    let scheduler = build_cleanup_scheduler(runtime.service.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
    }
    serve(runtime, port).await
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::JobNotFound(_) | SyncError::MissingPayeeData(_) | SyncError::NoResults(_) => {
            StatusCode::NOT_FOUND
        }
        SyncError::InvalidState { .. } | SyncError::JobRemoved(_) => StatusCode::CONFLICT,
        SyncError::InvalidInput(_) | SyncError::Mapping(_) => StatusCode::BAD_REQUEST,
        err if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn action_error(err: SyncError) -> Response {
    warn!(error = %err, "action failed");
    (status_for(&err), Json(ActionOutcome::failure(err.user_message()))).into_response()
}

fn action_ok(message: impl Into<String>, job_id: Option<String>) -> Response {
    Json(ActionOutcome::success(message, job_id)).into_response()
}

fn view(state: &WebState, job: BatchJob) -> JobView {
    let advisory = state
        .runtime
        .service
        .config()
        .stall
        .assess(&job, Utc::now())
        .advisory();
    JobView { job, advisory }
}

async fn health_handler(State(state): Shared) -> Response {
    let jobs = state.runtime.state().jobs().await.len();
    let store = match state.runtime.service.store().ping().await {
        Ok(()) => "ok",
        Err(_) => "unavailable",
    };
    Json(serde_json::json!({
        "ok": true,
        "jobs": jobs,
        "store": store,
        "pollers": state.runtime.engine.active_pollers().len(),
    }))
    .into_response()
}

async fn list_jobs_handler(State(state): Shared) -> Response {
    let jobs = state.runtime.state().jobs().await;
    let views: Vec<JobView> = jobs.into_iter().map(|job| view(&state, job)).collect();
    Json(views).into_response()
}

async fn job_handler(State(state): Shared, AxumPath(id): AxumPath<String>) -> Response {
    match state.runtime.service.job(&id).await {
        Ok(job) => Json(view(&state, job)).into_response(),
        Err(err) => action_error(err),
    }
}

async fn submit_handler(
    State(state): Shared,
    Query(query): Query<SubmitQuery>,
    body: Bytes,
) -> Response {
    let file = match read_csv(&body) {
        Ok(file) => file,
        Err(err) => return action_error(SyncError::InvalidInput(format!("unreadable csv: {err}"))),
    };
    let column = query
        .payee_column
        .as_deref()
        .unwrap_or(DEFAULT_PAYEE_COLUMN);
    match state
        .runtime
        .engine
        .submit(file, column, query.description.as_deref())
        .await
    {
        Ok(job) => action_ok(
            format!(
                "Submitted {} unique payees as {}",
                job.metadata.payee_count, job.id
            ),
            Some(job.id),
        ),
        Err(err) => action_error(err),
    }
}

async fn cancel_handler(State(state): Shared, AxumPath(id): AxumPath<String>) -> Response {
    match state.runtime.engine.cancel(&id).await {
        Ok(job) => action_ok(format!("Job {} is {}", job.id, job.status), Some(job.id)),
        Err(err) => action_error(err),
    }
}

async fn delete_handler(State(state): Shared, AxumPath(id): AxumPath<String>) -> Response {
    let report = state.runtime.engine.delete(&id).await;
    if report.is_clean() {
        return action_ok(format!("Deleted job {id}"), Some(id));
    }
    let failed: Vec<String> = report
        .failures()
        .iter()
        .map(|step| {
            format!(
                "{} ({})",
                step.step,
                step.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ActionOutcome::failure(format!(
            "Job {id} removed locally but cleanup failed for: {}",
            failed.join(", ")
        ))),
    )
        .into_response()
}

async fn recover_handler(
    State(state): Shared,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<RecoverQuery>,
) -> Response {
    let raw = query.strategy.as_deref().unwrap_or("recreate");
    let Some(strategy) = RecoveryStrategy::parse(raw) else {
        return action_error(SyncError::InvalidInput(format!(
            "unknown recovery strategy {raw:?}"
        )));
    };
    match state.runtime.engine.recover(&id, strategy).await {
        Ok(RecoveryOutcome::Recreated { previous, job }) => {
            action_ok(
                format!("Job {previous} recreated as {}", job.id),
                Some(job.id),
            )
        }
        Ok(RecoveryOutcome::LocalFallback { stats }) => action_ok(
            format!(
                "Classified {} rows locally ({} failed)",
                stats.written, stats.failed_rows
            ),
            Some(id),
        ),
        Err(err) => action_error(err),
    }
}

async fn ensure_results_handler(
    State(state): Shared,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.runtime.service.ensure_results(&id).await {
        Ok(EnsureOutcome::AlreadyPresent { rows }) => {
            action_ok(format!("{rows} rows already stored"), Some(id))
        }
        Ok(EnsureOutcome::Recovered(report)) => action_ok(
            format!("Recovered {} rows for job {id}", report.rows),
            Some(id),
        ),
        Err(err) => action_error(err),
    }
}

async fn download_handler(State(state): Shared, AxumPath(id): AxumPath<String>) -> Response {
    match state.runtime.service.download(&id).await {
        Ok(artifact) => Json(artifact).into_response(),
        Err(err) => action_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use payclass_adapters::FixtureBatchProvider;
    use payclass_classify::KeywordMatcher;
    use payclass_storage::{BackoffPolicy, FsBlobStore};
    use payclass_sync::{AppState, JobService, MemoryJobStore, NeverRender};
    use tower::ServiceExt;

    const UPLOAD: &str = "Vendor,Amount\nAcme Inc,120.00\nAcme Inc,80.50\nJane Doe,15.00\n";

    fn test_app(dir: &std::path::Path) -> (Router, SyncRuntime) {
        let quick = BackoffPolicy::with_retries(0, Duration::from_millis(1));
        let config = SyncConfig {
            cache_dir: dir.join("cache"),
            artifacts_dir: dir.join("artifacts"),
            poll_interval: Duration::from_secs(3600),
            store_backoff: quick,
            provider_backoff: quick,
            ..SyncConfig::default()
        };
        let service = Arc::new(JobService::new(
            config,
            Arc::new(AppState::new()),
            FixtureBatchProvider::shared(),
            Arc::new(MemoryJobStore::new()),
            Arc::new(FsBlobStore::new(dir.join("artifacts"), "/artifacts")),
            KeywordMatcher::default(),
        ));
        let runtime = SyncRuntime::new(service, Arc::new(NeverRender));
        (app(WebState::new(runtime.clone())), runtime)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn submit(app: &Router) -> String {
        let (status, body) = send(app, "POST", "/jobs?payee_column=Vendor", UPLOAD).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        body["job_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_store_and_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _runtime) = test_app(dir.path());
        let (status, body) = send(&app, "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "ok");
        assert_eq!(body["jobs"], 0);
    }

    #[tokio::test]
    async fn submit_then_list_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (app, runtime) = test_app(dir.path());
        let job_id = submit(&app).await;
        assert_eq!(runtime.engine.active_pollers(), vec![job_id.clone()]);

        let (status, list) = send(&app, "GET", "/jobs", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, job) = send(&app, "GET", &format!("/jobs/{job_id}"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "validating");
        assert!(job["advisory"].is_null());
    }

    #[tokio::test]
    async fn submit_with_unknown_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _runtime) = test_app(dir.path());
        let (status, body) = send(&app, "POST", "/jobs?payee_column=Payee", UPLOAD).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert!(body["message"].as_str().unwrap().contains("Payee"));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _runtime) = test_app(dir.path());
        let (status, body) = send(&app, "GET", "/jobs/batch_nope", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn cancel_twice_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let (app, runtime) = test_app(dir.path());
        let job_id = submit(&app).await;

        let (status, body) = send(&app, "POST", &format!("/jobs/{job_id}/cancel"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().ends_with("cancelled"));
        assert!(runtime.engine.active_pollers().is_empty());

        let (status, body) = send(&app, "POST", &format!("/jobs/{job_id}/cancel"), "").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn results_actions_before_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _runtime) = test_app(dir.path());
        let job_id = submit(&app).await;

        let (status, _) = send(&app, "GET", &format!("/jobs/{job_id}/download"), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "POST", &format!("/jobs/{job_id}/ensure-results"), "").await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn local_recovery_then_download_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (app, runtime) = test_app(dir.path());
        let job_id = submit(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/jobs/{job_id}/recover?strategy=local"),
            "",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().starts_with("Classified 3 rows"));

        let (status, artifact) = send(&app, "GET", &format!("/jobs/{job_id}/download"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            artifact["url"],
            format!("/artifacts/{job_id}/classifications.csv")
        );

        let (status, body) = send(&app, "DELETE", &format!("/jobs/{job_id}"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert!(!runtime.state().contains_job(&job_id).await);
    }

    #[tokio::test]
    async fn unknown_recovery_strategy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _runtime) = test_app(dir.path());
        let job_id = submit(&app).await;
        let (status, _) = send(
            &app,
            "POST",
            &format!("/jobs/{job_id}/recover?strategy=pray"),
            "",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
