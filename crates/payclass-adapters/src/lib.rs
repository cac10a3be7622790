//! Batch classification provider contracts + HTTP and fixture implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payclass_core::{BatchJob, BatchStatus, LifecycleTimestamps, RequestCounts, StatusUpdate, UpdateSource};
use payclass_storage::{
    build_http_client, classify_reqwest_error, classify_status, HttpClientConfig, RetryDisposition,
    Retryable,
};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "payclass-adapters";

/// Prefix of the per-request id used to map provider output back to unique payees.
pub const CUSTOM_ID_PREFIX: &str = "payee-";

pub const CLASSIFIER_PROMPT: &str = "You classify payee names from accounts-payable exports. \
Respond with a JSON object with keys: classification (\"Business\" or \"Individual\"), \
confidence (0 to 1), reasoning (one sentence), sicCode (2-4 digit SIC code, businesses only), \
sicDescription (SIC industry title, businesses only).";

pub fn custom_id_for(unique_index: usize) -> String {
    format!("{CUSTOM_ID_PREFIX}{unique_index}")
}

pub fn unique_index_from_custom_id(custom_id: &str) -> Option<usize> {
    custom_id.strip_prefix(CUSTOM_ID_PREFIX)?.parse().ok()
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("batch job {0} not found at provider")]
    NotFound(String),
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),
    #[error("provider rejected request: {0}")]
    InvalidRequest(String),
    #[error("provider temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding provider payload: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Only a confirmed "does not exist" answer, never a transport failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

impl Retryable for ProviderError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            ProviderError::Unavailable(_) => RetryDisposition::Retryable,
            ProviderError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            ProviderError::Request(err) => classify_reqwest_error(err),
            ProviderError::NotFound(_)
            | ProviderError::Unauthorized(_)
            | ProviderError::InvalidRequest(_)
            | ProviderError::Decode(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderRequestCounts {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderErrors {
    #[serde(default)]
    pub data: Vec<ProviderErrorDetail>,
}

/// Batch object as reported by the provider. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderJob {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub request_counts: Option<ProviderRequestCounts>,
    pub created_at: i64,
    #[serde(default)]
    pub in_progress_at: Option<i64>,
    #[serde(default)]
    pub finalizing_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub failed_at: Option<i64>,
    #[serde(default)]
    pub expired_at: Option<i64>,
    #[serde(default)]
    pub cancelling_at: Option<i64>,
    #[serde(default)]
    pub cancelled_at: Option<i64>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub errors: Option<ProviderErrors>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

fn unix_to_utc(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

impl ProviderJob {
    pub fn batch_status(&self) -> Result<BatchStatus, ProviderError> {
        BatchStatus::parse(&self.status).ok_or_else(|| {
            ProviderError::Decode(format!("unknown batch status {:?} for {}", self.status, self.id))
        })
    }

    /// Normalizes this snapshot for the state machine.
    pub fn to_status_update(
        &self,
        observed_at: DateTime<Utc>,
        source: UpdateSource,
    ) -> Result<StatusUpdate, ProviderError> {
        let status = self.batch_status()?;
        let created_at = unix_to_utc(Some(self.created_at)).ok_or_else(|| {
            ProviderError::Decode(format!("invalid created_at {} for {}", self.created_at, self.id))
        })?;
        let mut timestamps = LifecycleTimestamps::created(created_at);
        timestamps.validating_at = Some(created_at);
        timestamps.in_progress_at = unix_to_utc(self.in_progress_at);
        timestamps.finalizing_at = unix_to_utc(self.finalizing_at);
        timestamps.completed_at = unix_to_utc(self.completed_at);
        timestamps.failed_at = unix_to_utc(self.failed_at);
        timestamps.expired_at = unix_to_utc(self.expired_at);
        timestamps.cancelling_at = unix_to_utc(self.cancelling_at);
        timestamps.cancelled_at = unix_to_utc(self.cancelled_at);

        let counts = self.request_counts.unwrap_or_default();
        Ok(StatusUpdate {
            job_id: self.id.clone(),
            status,
            request_counts: RequestCounts {
                total: counts.total,
                completed: counts.completed,
                failed: counts.failed,
            },
            timestamps,
            output_file_id: self.output_file_id.clone(),
            errors: self
                .errors
                .as_ref()
                .map(|e| e.data.iter().map(|d| d.message.clone()).collect())
                .unwrap_or_default(),
            observed_at,
            source,
        })
    }
}

/// One line of provider output, still untyped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResult {
    pub custom_id: String,
    pub unique_index: Option<usize>,
    pub payee_name: Option<String>,
    /// Model message content; expected to be a JSON object.
    pub content: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait BatchProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    /// Cheap syntactic check used to spot ids the provider could never have issued.
    fn is_valid_job_id(&self, id: &str) -> bool {
        id.starts_with("batch_")
            && id.len() > "batch_".len()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    async fn create_job(
        &self,
        names: &[String],
        description: Option<&str>,
    ) -> Result<ProviderJob, ProviderError>;

    async fn get_job(&self, id: &str) -> Result<ProviderJob, ProviderError>;

    async fn cancel_job(&self, id: &str) -> Result<ProviderJob, ProviderError>;

    async fn get_job_results(
        &self,
        job: &BatchJob,
        names: &[String],
    ) -> Result<Vec<RawResult>, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct OutputLine {
    custom_id: String,
    #[serde(default)]
    response: Option<OutputResponse>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    status_code: u16,
    #[serde(default)]
    body: JsonValue,
}

fn error_message(value: &JsonValue) -> String {
    value
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Parses a batch output file (JSON lines) into raw results keyed back to `names`.
/// Lines that are not valid JSON are skipped; their payees fall back to placeholders.
pub fn parse_output_jsonl(text: &str, names: &[String]) -> Vec<RawResult> {
    let mut out = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: OutputLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(line_no, error = %err, "skipping unparseable batch output line");
                continue;
            }
        };

        let unique_index = unique_index_from_custom_id(&parsed.custom_id);
        let payee_name = unique_index.and_then(|i| names.get(i)).cloned();

        let (content, error) = match (&parsed.error, &parsed.response) {
            (Some(err), _) if !err.is_null() => (None, Some(error_message(err))),
            (_, Some(resp)) if resp.status_code >= 400 => (
                None,
                Some(format!(
                    "request failed with status {}: {}",
                    resp.status_code,
                    resp.body
                        .get("error")
                        .map(error_message)
                        .unwrap_or_default()
                )),
            ),
            (_, Some(resp)) => {
                let content = resp
                    .body
                    .pointer("/choices/0/message/content")
                    .and_then(|c| c.as_str())
                    .map(str::to_string);
                if content.is_none() {
                    (None, Some("response has no message content".to_string()))
                } else {
                    (content, None)
                }
            }
            (_, None) => (None, Some("output line has neither response nor error".to_string())),
        };

        out.push(RawResult {
            custom_id: parsed.custom_id,
            unique_index,
            payee_name,
            content,
            error,
        });
    }
    out
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub completion_window: String,
    pub http: HttpClientConfig,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            completion_window: "24h".to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

/// OpenAI-compatible batch API client. Each call is a single attempt; callers
/// wrap calls in the shared retry policy.
#[derive(Debug)]
pub struct OpenAiBatchProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiBatchProvider {
    pub fn new(config: OpenAiConfig) -> anyhow::Result<Self> {
        if config.api_key.trim().is_empty() {
            anyhow::bail!("provider api key is empty");
        }
        let client = build_http_client(&config.http).context("building provider http client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    pub fn build_request_lines(&self, names: &[String]) -> String {
        names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                json!({
                    "custom_id": custom_id_for(idx),
                    "method": "POST",
                    "url": "/v1/chat/completions",
                    "body": {
                        "model": self.config.model,
                        "temperature": 0,
                        "response_format": {"type": "json_object"},
                        "messages": [
                            {"role": "system", "content": CLASSIFIER_PROMPT},
                            {"role": "user", "content": format!("Payee: {name}")},
                        ],
                    },
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn send(&self, request: RequestBuilder, subject: &str) -> Result<reqwest::Response, ProviderError> {
        let resp = request.bearer_auth(&self.config.api_key).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => ProviderError::NotFound(subject.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized(body),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ProviderError::InvalidRequest(body)
            }
            _ => ProviderError::HttpStatus {
                status: status.as_u16(),
                url,
            },
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        subject: &str,
    ) -> Result<T, ProviderError> {
        let resp = self.send(request, subject).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BatchProvider for OpenAiBatchProvider {
    fn provider_id(&self) -> &'static str {
        "openai"
    }

    async fn create_job(
        &self,
        names: &[String],
        description: Option<&str>,
    ) -> Result<ProviderJob, ProviderError> {
        let span = info_span!("provider_create_job", provider = "openai", payees = names.len());
        async move {
            if names.is_empty() {
                return Err(ProviderError::InvalidRequest(
                    "cannot create a batch with no payees".to_string(),
                ));
            }
            let jsonl = self.build_request_lines(names);
            let part = reqwest::multipart::Part::bytes(jsonl.into_bytes())
                .file_name("payees.jsonl")
                .mime_str("application/jsonl")?;
            let form = reqwest::multipart::Form::new()
                .text("purpose", "batch")
                .part("file", part);
            let uploaded: UploadedFile = self
                .send_json(self.client.post(self.url("files")).multipart(form), "input file")
                .await?;

            let mut metadata = serde_json::Map::new();
            metadata.insert("payee_count".into(), JsonValue::String(names.len().to_string()));
            if let Some(description) = description {
                metadata.insert("description".into(), JsonValue::String(description.to_string()));
            }
            let body = json!({
                "input_file_id": uploaded.id,
                "endpoint": "/v1/chat/completions",
                "completion_window": self.config.completion_window,
                "metadata": metadata,
            });
            self.send_json(self.client.post(self.url("batches")).json(&body), "batch")
                .await
        }
        .instrument(span)
        .await
    }

    async fn get_job(&self, id: &str) -> Result<ProviderJob, ProviderError> {
        let span = info_span!("provider_get_job", provider = "openai", job_id = id);
        self.send_json(self.client.get(self.url(&format!("batches/{id}"))), id)
            .instrument(span)
            .await
    }

    async fn cancel_job(&self, id: &str) -> Result<ProviderJob, ProviderError> {
        let span = info_span!("provider_cancel_job", provider = "openai", job_id = id);
        self.send_json(self.client.post(self.url(&format!("batches/{id}/cancel"))), id)
            .instrument(span)
            .await
    }

    async fn get_job_results(
        &self,
        job: &BatchJob,
        names: &[String],
    ) -> Result<Vec<RawResult>, ProviderError> {
        let span = info_span!("provider_get_results", provider = "openai", job_id = %job.id);
        async move {
            let Some(file_id) = job.output_file_id.as_deref() else {
                return Err(ProviderError::InvalidRequest(format!(
                    "job {} has no output file",
                    job.id
                )));
            };
            let resp = self
                .send(
                    self.client.get(self.url(&format!("files/{file_id}/content"))),
                    file_id,
                )
                .await?;
            let text = resp.text().await?;
            Ok(parse_output_jsonl(&text, names))
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug)]
struct FixtureJob {
    job: ProviderJob,
    names: Vec<String>,
}

#[derive(Debug, Default)]
struct FixtureState {
    next_id: u64,
    jobs: HashMap<String, FixtureJob>,
    answers: HashMap<String, String>,
    failures: VecDeque<ProviderError>,
    calls: usize,
}

/// Deterministic in-memory provider. Jobs only move when the test or demo
/// drives them; answers are looked up by payee name.
#[derive(Debug, Default)]
pub struct FixtureBatchProvider {
    state: Mutex<FixtureState>,
}

pub const FIXTURE_DEFAULT_ANSWER: &str =
    r#"{"classification":"Individual","confidence":0.5,"reasoning":"No fixture answer registered"}"#;

impl FixtureBatchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        // A poisoned fixture only happens after a test already panicked.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_answer(&self, payee_name: &str, content: &str) {
        self.lock()
            .answers
            .insert(payee_name.to_string(), content.to_string());
    }

    /// Queues an error returned by the next provider call, whatever it is.
    pub fn fail_next(&self, err: ProviderError) {
        self.lock().failures.push_back(err);
    }

    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn names_for(&self, id: &str) -> Option<Vec<String>> {
        self.lock().jobs.get(id).map(|j| j.names.clone())
    }

    /// Drops a job so later lookups answer "not found".
    pub fn forget(&self, id: &str) {
        self.lock().jobs.remove(id);
    }

    pub fn set_created_at(&self, id: &str, at: DateTime<Utc>) {
        if let Some(job) = self.lock().jobs.get_mut(id) {
            job.job.created_at = at.timestamp();
        }
    }

    /// Moves a job to `status` with `completed` finished requests.
    pub fn advance(&self, id: &str, status: BatchStatus, completed: u32) {
        let now = Utc::now().timestamp();
        let mut state = self.lock();
        let Some(entry) = state.jobs.get_mut(id) else {
            return;
        };
        let job = &mut entry.job;
        job.status = status.as_str().to_string();
        let counts = job.request_counts.get_or_insert_with(Default::default);
        counts.completed = completed.min(counts.total);
        let slot = match status {
            BatchStatus::Validating => None,
            BatchStatus::InProgress => Some(&mut job.in_progress_at),
            BatchStatus::Finalizing => Some(&mut job.finalizing_at),
            BatchStatus::Cancelling => Some(&mut job.cancelling_at),
            BatchStatus::Completed => Some(&mut job.completed_at),
            BatchStatus::Failed => Some(&mut job.failed_at),
            BatchStatus::Expired => Some(&mut job.expired_at),
            BatchStatus::Cancelled => Some(&mut job.cancelled_at),
        };
        if let Some(slot) = slot {
            slot.get_or_insert(now);
        }
        if status == BatchStatus::Completed {
            job.output_file_id = Some(format!("file-{id}"));
        }
    }

    pub fn complete(&self, id: &str) {
        let total = self
            .lock()
            .jobs
            .get(id)
            .and_then(|j| j.job.request_counts)
            .map(|c| c.total)
            .unwrap_or(0);
        self.advance(id, BatchStatus::Completed, total);
    }

    fn begin_call(&self) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls += 1;
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BatchProvider for FixtureBatchProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn create_job(
        &self,
        names: &[String],
        description: Option<&str>,
    ) -> Result<ProviderJob, ProviderError> {
        self.begin_call()?;
        if names.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "cannot create a batch with no payees".to_string(),
            ));
        }
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("batch_fx_{:04}", state.next_id);
        let mut metadata = HashMap::new();
        metadata.insert("payee_count".to_string(), names.len().to_string());
        if let Some(description) = description {
            metadata.insert("description".to_string(), description.to_string());
        }
        let job = ProviderJob {
            id: id.clone(),
            status: BatchStatus::Validating.as_str().to_string(),
            request_counts: Some(ProviderRequestCounts {
                total: names.len() as u32,
                completed: 0,
                failed: 0,
            }),
            created_at: Utc::now().timestamp(),
            in_progress_at: None,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
            output_file_id: None,
            error_file_id: None,
            errors: None,
            metadata: Some(metadata),
        };
        state.jobs.insert(
            id,
            FixtureJob {
                job: job.clone(),
                names: names.to_vec(),
            },
        );
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<ProviderJob, ProviderError> {
        self.begin_call()?;
        self.lock()
            .jobs
            .get(id)
            .map(|j| j.job.clone())
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn cancel_job(&self, id: &str) -> Result<ProviderJob, ProviderError> {
        self.begin_call()?;
        let status = {
            let state = self.lock();
            let entry = state
                .jobs
                .get(id)
                .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
            entry.job.batch_status()?
        };
        if status.is_terminal() {
            return Err(ProviderError::InvalidRequest(format!(
                "batch {id} is already {status}"
            )));
        }
        let completed = self
            .lock()
            .jobs
            .get(id)
            .and_then(|j| j.job.request_counts)
            .map(|c| c.completed)
            .unwrap_or(0);
        self.advance(id, BatchStatus::Cancelled, completed);
        self.lock()
            .jobs
            .get(id)
            .map(|j| j.job.clone())
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn get_job_results(
        &self,
        job: &BatchJob,
        names: &[String],
    ) -> Result<Vec<RawResult>, ProviderError> {
        self.begin_call()?;
        let state = self.lock();
        if !state.jobs.contains_key(&job.id) {
            return Err(ProviderError::NotFound(job.id.clone()));
        }
        Ok(names
            .iter()
            .enumerate()
            .map(|(idx, name)| RawResult {
                custom_id: custom_id_for(idx),
                unique_index: Some(idx),
                payee_name: Some(name.clone()),
                content: Some(
                    state
                        .answers
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| FIXTURE_DEFAULT_ANSWER.to_string()),
                ),
                error: None,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Fixture,
}

impl ProviderKind {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "fixture" => Some(ProviderKind::Fixture),
            _ => None,
        }
    }
}

pub fn provider_for_kind(
    kind: ProviderKind,
    openai: OpenAiConfig,
) -> anyhow::Result<Arc<dyn BatchProvider>> {
    match kind {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiBatchProvider::new(openai)?)),
        ProviderKind::Fixture => Ok(FixtureBatchProvider::shared()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn custom_ids_round_trip_to_unique_index() {
        assert_eq!(unique_index_from_custom_id(&custom_id_for(42)), Some(42));
        assert_eq!(unique_index_from_custom_id("request-1"), None);
    }

    #[test]
    fn output_lines_map_back_to_names() {
        let text = [
            r#"{"custom_id":"payee-1","response":{"status_code":200,"body":{"choices":[{"message":{"content":"{\"classification\":\"Individual\"}"}}]}},"error":null}"#,
            "not json at all",
            r#"{"custom_id":"payee-0","response":{"status_code":500,"body":{"error":{"message":"overloaded"}}},"error":null}"#,
            r#"{"custom_id":"payee-2","response":null,"error":{"code":"expired","message":"request expired"}}"#,
        ]
        .join("\n");

        let results = parse_output_jsonl(&text, &names(&["Acme Inc", "Jane Doe", "Bob"]));
        assert_eq!(results.len(), 3);

        assert_eq!(results[0].payee_name.as_deref(), Some("Jane Doe"));
        assert_eq!(
            results[0].content.as_deref(),
            Some(r#"{"classification":"Individual"}"#)
        );

        assert_eq!(results[1].unique_index, Some(0));
        assert!(results[1].content.is_none());
        assert!(results[1].error.as_deref().unwrap().contains("overloaded"));

        assert_eq!(results[2].error.as_deref(), Some("request expired"));
    }

    #[test]
    fn provider_job_normalizes_to_status_update() {
        let job: ProviderJob = serde_json::from_value(json!({
            "id": "batch_abc",
            "status": "in_progress",
            "request_counts": {"total": 10, "completed": 4, "failed": 1},
            "created_at": 1_760_000_000,
            "in_progress_at": 1_760_000_100,
            "errors": {"data": [{"code": "x", "message": "line 3 invalid"}]}
        }))
        .unwrap();
        let observed = Utc::now();
        let update = job.to_status_update(observed, UpdateSource::Poll).unwrap();
        assert_eq!(update.status, BatchStatus::InProgress);
        assert_eq!(update.request_counts.completed, 4);
        assert_eq!(update.errors, vec!["line 3 invalid".to_string()]);
        assert_eq!(
            update.timestamps.in_progress_at.unwrap().timestamp(),
            1_760_000_100
        );
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        let job: ProviderJob = serde_json::from_value(json!({
            "id": "batch_abc",
            "status": "teleporting",
            "created_at": 1_760_000_000
        }))
        .unwrap();
        let err = job.to_status_update(Utc::now(), UpdateSource::Poll).unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[test]
    fn retry_disposition_follows_error_kind() {
        assert_eq!(
            ProviderError::Unavailable("blip".into()).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            ProviderError::HttpStatus { status: 503, url: "u".into() }.disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            ProviderError::Unauthorized("no".into()).disposition(),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            ProviderError::NotFound("batch_x".into()).disposition(),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn job_id_shape_check() {
        let provider = FixtureBatchProvider::new();
        assert!(provider.is_valid_job_id("batch_fx_0001"));
        assert!(!provider.is_valid_job_id("batch_"));
        assert!(!provider.is_valid_job_id("undefined"));
        assert!(!provider.is_valid_job_id("batch_has space"));
    }

    #[tokio::test]
    async fn fixture_provider_drives_lifecycle() {
        let provider = FixtureBatchProvider::new();
        provider.set_answer("Acme Inc", r#"{"classification":"Business","confidence":0.9}"#);

        let job = provider
            .create_job(&names(&["Acme Inc", "Jane Doe"]), Some("upload.csv"))
            .await
            .unwrap();
        assert_eq!(job.status, "validating");

        provider.advance(&job.id, BatchStatus::InProgress, 1);
        let polled = provider.get_job(&job.id).await.unwrap();
        assert_eq!(polled.request_counts.unwrap().completed, 1);
        assert!(polled.in_progress_at.is_some());

        provider.complete(&job.id);
        let done = provider.get_job(&job.id).await.unwrap();
        assert_eq!(done.status, "completed");
        assert!(done.output_file_id.is_some());

        let local = done.to_status_update(Utc::now(), UpdateSource::Poll).unwrap().into_job(Default::default());
        let results = provider
            .get_job_results(&local, &names(&["Acme Inc", "Jane Doe"]))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].content.as_deref().unwrap().contains("Business"));
        assert_eq!(results[1].content.as_deref(), Some(FIXTURE_DEFAULT_ANSWER));
    }

    #[tokio::test]
    async fn fixture_provider_fails_on_demand_and_forgets() {
        let provider = FixtureBatchProvider::new();
        let job = provider.create_job(&names(&["A"]), None).await.unwrap();

        provider.fail_next(ProviderError::Unavailable("scripted".into()));
        assert!(matches!(
            provider.get_job(&job.id).await,
            Err(ProviderError::Unavailable(_))
        ));
        assert!(provider.get_job(&job.id).await.is_ok());

        provider.forget(&job.id);
        assert!(provider.get_job(&job.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn fixture_cancel_rejects_terminal_jobs() {
        let provider = FixtureBatchProvider::new();
        let job = provider.create_job(&names(&["A"]), None).await.unwrap();
        let cancelled = provider.cancel_job(&job.id).await.unwrap();
        assert_eq!(cancelled.status, "cancelled");
        assert!(matches!(
            provider.cancel_job(&job.id).await,
            Err(ProviderError::InvalidRequest(_))
        ));
    }
}
