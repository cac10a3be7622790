//! Row mapping, result reconciliation and CSV handling for payee classification.

use thiserror::Error;

pub mod export;
pub mod keywords;
pub mod local;
pub mod mapper;
pub mod reconcile;

pub use export::{export_csv, read_csv, ExportError, CLASSIFICATION_COLUMNS};
pub use keywords::{KeywordMatcher, DEFAULT_EXCLUSION_KEYWORDS};
pub use local::LocalClassifier;
pub use mapper::{
    build_mapping, clean_payee_name, expand, expand_chunked, normalize_payee_key,
    ExpansionProgress, MappingError, UniqueResults,
};
pub use reconcile::{
    is_valid_industry_code, validate_industry_code, IndustryCodeLedger, IndustryCodePolicy,
    ParsedClassification, ParsedResult, Reconciler,
};

pub const CRATE_NAME: &str = "payclass-classify";

/// Pipeline invariants that, when broken, abort a job's completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("expansion produced {actual} rows, expected {expected}")]
    RowCountMismatch { expected: usize, actual: usize },
    #[error("row mapping at position {position} points at original row {found}")]
    MappingOutOfOrder { position: usize, found: usize },
    #[error("industry code {expected} for {payee:?} lost during {stage}")]
    IndustryCodeLost {
        stage: String,
        payee: String,
        expected: String,
    },
    #[error("industry code for {payee:?} changed from {expected} to {actual} during {stage}")]
    IndustryCodeChanged {
        stage: String,
        payee: String,
        expected: String,
        actual: String,
    },
}
