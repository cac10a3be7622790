//! Core domain model for payee batch classification.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "payclass-core";

/// Reasoning attached to rows whose unique payee never received a result.
pub const NO_RESULT_REASONING: &str = "No classification result found";

/// One uploaded spreadsheet row, keyed by column header.
pub type OriginalRow = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Business,
    Individual,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Business => "Business",
            Classification::Individual => "Individual",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "business" | "company" | "organization" => Some(Classification::Business),
            "individual" | "person" => Some(Classification::Individual),
            _ => None,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a provider confidence into the canonical 0-100 integer scale.
///
/// Values in `[0, 1]` are treated as fractions and scaled; anything above 1 is
/// already a percentage and is clamped to 100. Non-finite or negative input is 0.
pub fn normalize_confidence(raw: f64) -> u8 {
    if !raw.is_finite() || raw <= 0.0 {
        return 0;
    }
    let scaled = if raw <= 1.0 { raw * 100.0 } else { raw };
    scaled.round().min(100.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingTier {
    KeywordExcluded,
    AiClassified,
    LocalFallback,
    Placeholder,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    BatchApi,
    KeywordExclusion,
    LocalRules,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationWarning {
    MissingIndustryCode,
    MalformedIndustryCode { raw: String },
    MissingIndustryDescription,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::MissingIndustryCode => {
                f.write_str("business classification has no industry code")
            }
            ValidationWarning::MalformedIndustryCode { raw } => {
                write!(f, "industry code {raw:?} is not 2-4 digits")
            }
            ValidationWarning::MissingIndustryDescription => {
                f.write_str("industry code has no description")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeywordExclusion {
    pub is_excluded: bool,
    pub matched_keywords: Vec<String>,
    pub confidence: u8,
    pub reasoning: String,
}

impl KeywordExclusion {
    pub fn none() -> Self {
        Self {
            is_excluded: false,
            matched_keywords: Vec::new(),
            confidence: 0,
            reasoning: "No exclusion keywords matched".to_string(),
        }
    }
}

/// Canonical classification for one unique payee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub payee_name: String,
    pub classification: Classification,
    /// Integer percentage, 0-100.
    pub confidence: u8,
    pub reasoning: String,
    pub sic_code: Option<String>,
    pub sic_description: Option<String>,
    pub keyword_exclusion: KeywordExclusion,
    pub processing_tier: ProcessingTier,
    pub processing_method: ProcessingMethod,
    #[serde(default)]
    pub warnings: Vec<ValidationWarning>,
}

impl ClassificationRecord {
    /// Stand-in for a row whose unique payee has no result.
    pub fn placeholder(payee_name: impl Into<String>) -> Self {
        Self {
            payee_name: payee_name.into(),
            classification: Classification::Individual,
            confidence: 0,
            reasoning: NO_RESULT_REASONING.to_string(),
            sic_code: None,
            sic_description: None,
            keyword_exclusion: KeywordExclusion::none(),
            processing_tier: ProcessingTier::Placeholder,
            processing_method: ProcessingMethod::Placeholder,
            warnings: Vec::new(),
        }
    }

    pub fn failed(payee_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            payee_name: payee_name.into(),
            classification: Classification::Individual,
            confidence: 0,
            reasoning: reason.into(),
            sic_code: None,
            sic_description: None,
            keyword_exclusion: KeywordExclusion::none(),
            processing_tier: ProcessingTier::Failed,
            processing_method: ProcessingMethod::BatchApi,
            warnings: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.processing_tier == ProcessingTier::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMapping {
    pub original_row_index: usize,
    pub unique_payee_index: usize,
    pub payee_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OriginalFileData {
    /// Column headers in upload order.
    pub columns: Vec<String>,
    pub rows: Vec<OriginalRow>,
}

/// Everything needed to go from a raw upload to per-row output and back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PayeeRowData {
    pub unique_payee_names: Vec<String>,
    pub row_mappings: Vec<RowMapping>,
    pub original_file_data: OriginalFileData,
}

impl PayeeRowData {
    pub fn row_count(&self) -> usize {
        self.row_mappings.len()
    }

    pub fn unique_count(&self) -> usize {
        self.unique_payee_names.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Cancelling,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Validating => "validating",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Cancelling => "cancelling",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Expired => "expired",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "validating" => Some(BatchStatus::Validating),
            "in_progress" => Some(BatchStatus::InProgress),
            "finalizing" => Some(BatchStatus::Finalizing),
            "cancelling" => Some(BatchStatus::Cancelling),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            "expired" => Some(BatchStatus::Expired),
            "cancelled" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Expired | BatchStatus::Cancelled
        )
    }

    /// Position along the lifecycle; all terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            BatchStatus::Validating => 0,
            BatchStatus::InProgress => 1,
            BatchStatus::Finalizing => 2,
            BatchStatus::Cancelling => 3,
            _ => 4,
        }
    }

    /// Polling can miss intermediate states, so any forward move is legal while
    /// the job is active. Terminal states never move.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestCounts {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl RequestCounts {
    pub fn progress_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.completed) / f64::from(self.total)
    }

    pub fn has_progress(&self) -> bool {
        self.completed > 0 || self.failed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleTimestamps {
    pub created_at: DateTime<Utc>,
    pub validating_at: Option<DateTime<Utc>>,
    pub in_progress_at: Option<DateTime<Utc>>,
    pub finalizing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub cancelling_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl LifecycleTimestamps {
    pub fn created(at: DateTime<Utc>) -> Self {
        Self {
            created_at: at,
            validating_at: None,
            in_progress_at: None,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            expired_at: None,
            cancelling_at: None,
            cancelled_at: None,
        }
    }

    fn slot_mut(&mut self, status: BatchStatus) -> &mut Option<DateTime<Utc>> {
        match status {
            BatchStatus::Validating => &mut self.validating_at,
            BatchStatus::InProgress => &mut self.in_progress_at,
            BatchStatus::Finalizing => &mut self.finalizing_at,
            BatchStatus::Cancelling => &mut self.cancelling_at,
            BatchStatus::Completed => &mut self.completed_at,
            BatchStatus::Failed => &mut self.failed_at,
            BatchStatus::Expired => &mut self.expired_at,
            BatchStatus::Cancelled => &mut self.cancelled_at,
        }
    }

    pub fn for_status(&self, status: BatchStatus) -> Option<DateTime<Utc>> {
        match status {
            BatchStatus::Validating => self.validating_at,
            BatchStatus::InProgress => self.in_progress_at,
            BatchStatus::Finalizing => self.finalizing_at,
            BatchStatus::Cancelling => self.cancelling_at,
            BatchStatus::Completed => self.completed_at,
            BatchStatus::Failed => self.failed_at,
            BatchStatus::Expired => self.expired_at,
            BatchStatus::Cancelled => self.cancelled_at,
        }
    }

    /// Records `at` for `status` unless that transition already has a timestamp.
    pub fn stamp(&mut self, status: BatchStatus, at: DateTime<Utc>) {
        let slot = self.slot_mut(status);
        if slot.is_none() {
            *slot = Some(at);
        }
    }

    /// Fills empty slots from `other`; populated slots are never overwritten.
    pub fn merge_set_once(&mut self, other: &LifecycleTimestamps) {
        for status in [
            BatchStatus::Validating,
            BatchStatus::InProgress,
            BatchStatus::Finalizing,
            BatchStatus::Cancelling,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Expired,
            BatchStatus::Cancelled,
        ] {
            if let Some(at) = other.for_status(status) {
                self.stamp(status, at);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchJobMetadata {
    pub description: Option<String>,
    pub payee_count: usize,
}

/// One submission of a unique payee set to the remote provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: BatchStatus,
    pub request_counts: RequestCounts,
    pub timestamps: LifecycleTimestamps,
    pub metadata: BatchJobMetadata,
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Recency of the last status snapshot applied to this job.
    pub observed_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamps.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Poll,
    Push,
    Local,
}

/// Normalized job snapshot from any producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub job_id: String,
    pub status: BatchStatus,
    pub request_counts: RequestCounts,
    pub timestamps: LifecycleTimestamps,
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub observed_at: DateTime<Utc>,
    pub source: UpdateSource,
}

impl StatusUpdate {
    /// Seeds a fresh job from its first snapshot.
    pub fn into_job(self, metadata: BatchJobMetadata) -> BatchJob {
        let mut timestamps = self.timestamps;
        timestamps.stamp(self.status, self.observed_at);
        BatchJob {
            id: self.job_id,
            status: self.status,
            request_counts: self.request_counts,
            timestamps,
            metadata,
            output_file_id: self.output_file_id,
            errors: self.errors,
            observed_at: self.observed_at,
        }
    }
}

/// One fully expanded original row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedRow {
    pub original_row_index: usize,
    pub payee_name: String,
    pub record: ClassificationRecord,
    pub original: OriginalRow,
}

/// Persisted form of an expanded row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRow {
    pub id: Uuid,
    pub batch_id: String,
    pub row_index: usize,
    pub payee_name: String,
    pub record: ClassificationRecord,
    pub original: OriginalRow,
}

impl ClassificationRow {
    /// Stable id derived from `(batch_id, row_index)` so repeated saves upsert.
    pub fn deterministic_id(batch_id: &str, row_index: usize) -> Uuid {
        let source = format!("payclass:{batch_id}:{row_index}");
        Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
    }

    pub fn from_expanded(batch_id: &str, row: &ExpandedRow) -> Self {
        Self {
            id: Self::deterministic_id(batch_id, row.original_row_index),
            batch_id: batch_id.to_string(),
            row_index: row.original_row_index,
            payee_name: row.payee_name.clone(),
            record: row.record.clone(),
            original: row.original.clone(),
        }
    }

    pub fn to_expanded(&self) -> ExpandedRow {
        ExpandedRow {
            original_row_index: self.row_index,
            payee_name: self.payee_name.clone(),
            record: self.record.clone(),
            original: self.original.clone(),
        }
    }
}

/// Generated CSV download for a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadArtifact {
    pub job_id: String,
    pub storage_key: String,
    pub url: String,
    pub generated_at: DateTime<Utc>,
    pub byte_size: usize,
    pub content_hash: String,
    pub stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_accepts_fractions_and_percentages() {
        assert_eq!(normalize_confidence(0.87), 87);
        assert_eq!(normalize_confidence(1.0), 100);
        assert_eq!(normalize_confidence(92.0), 92);
        assert_eq!(normalize_confidence(250.0), 100);
        assert_eq!(normalize_confidence(-3.0), 0);
        assert_eq!(normalize_confidence(f64::NAN), 0);
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Expired,
            BatchStatus::Cancelled,
        ] {
            assert!(!terminal.can_transition_to(BatchStatus::InProgress));
            assert!(!terminal.can_transition_to(terminal));
        }
        assert!(BatchStatus::InProgress.can_transition_to(BatchStatus::Cancelled));
        assert!(BatchStatus::InProgress.can_transition_to(BatchStatus::Failed));
        assert!(!BatchStatus::Finalizing.can_transition_to(BatchStatus::InProgress));
    }

    #[test]
    fn timestamps_are_set_once() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(5);
        let mut ts = LifecycleTimestamps::created(t0);
        ts.stamp(BatchStatus::InProgress, t0);
        ts.stamp(BatchStatus::InProgress, t1);
        assert_eq!(ts.in_progress_at, Some(t0));

        let mut other = LifecycleTimestamps::created(t0);
        other.in_progress_at = Some(t1);
        other.finalizing_at = Some(t1);
        ts.merge_set_once(&other);
        assert_eq!(ts.in_progress_at, Some(t0));
        assert_eq!(ts.finalizing_at, Some(t1));
    }

    #[test]
    fn row_ids_are_stable_per_batch_and_index() {
        let a = ClassificationRow::deterministic_id("batch_1", 3);
        let b = ClassificationRow::deterministic_id("batch_1", 3);
        let c = ClassificationRow::deterministic_id("batch_1", 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
