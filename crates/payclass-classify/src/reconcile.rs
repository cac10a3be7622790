//! Turns raw provider output into canonical classification records.

use std::collections::HashMap;
use std::sync::OnceLock;

use payclass_adapters::RawResult;
use payclass_core::{
    normalize_confidence, Classification, ClassificationRecord, ExpandedRow, KeywordExclusion,
    PayeeRowData, ProcessingMethod, ProcessingTier, ValidationWarning,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::keywords::KeywordMatcher;
use crate::mapper::UniqueResults;
use crate::ConsistencyError;

fn sic_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9]{2,4}$").expect("static SIC pattern compiles"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedClassification {
    pub classification: Classification,
    pub confidence: u8,
    pub reasoning: String,
    pub sic_code: Option<String>,
    pub sic_description: Option<String>,
}

/// Typed view of a provider payload, built once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResult {
    Ok(ParsedClassification),
    Error { reason: String },
}

#[derive(Debug, Deserialize)]
struct ProviderPayload {
    classification: Option<String>,
    confidence: Option<JsonValue>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default, alias = "sicCode")]
    sic_code: Option<JsonValue>,
    #[serde(default, alias = "sicDescription")]
    sic_description: Option<String>,
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

fn code_text(value: Option<JsonValue>) -> Option<String> {
    let text = match value? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

impl ParsedResult {
    pub fn parse_content(content: &str) -> Self {
        let payload: ProviderPayload = match serde_json::from_str(strip_code_fence(content)) {
            Ok(payload) => payload,
            Err(err) => {
                return ParsedResult::Error {
                    reason: format!("unparseable provider payload: {err}"),
                }
            }
        };
        let Some(label) = payload.classification else {
            return ParsedResult::Error {
                reason: "payload has no classification".to_string(),
            };
        };
        let Some(classification) = Classification::parse(&label) else {
            return ParsedResult::Error {
                reason: format!("unknown classification {label:?}"),
            };
        };
        let Some(confidence) = payload.confidence.as_ref().and_then(json_number) else {
            return ParsedResult::Error {
                reason: "payload has no numeric confidence".to_string(),
            };
        };
        ParsedResult::Ok(ParsedClassification {
            classification,
            confidence: normalize_confidence(confidence),
            reasoning: payload
                .reasoning
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| "No reasoning provided".to_string()),
            sic_code: code_text(payload.sic_code),
            sic_description: payload.sic_description.filter(|d| !d.trim().is_empty()),
        })
    }

    pub fn from_raw(raw: &RawResult) -> Self {
        if let Some(error) = &raw.error {
            return ParsedResult::Error {
                reason: format!("provider error: {error}"),
            };
        }
        match raw.content.as_deref() {
            Some(content) => Self::parse_content(content),
            None => ParsedResult::Error {
                reason: "provider returned no content".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndustryCodePolicy {
    pub require_for_business: bool,
    pub require_description: bool,
}

impl Default for IndustryCodePolicy {
    fn default() -> Self {
        Self {
            require_for_business: true,
            require_description: true,
        }
    }
}

/// Attaches industry-code warnings. Malformed codes are moved into the
/// warning and cleared from the record so they never reach persistence.
pub fn validate_industry_code(record: &mut ClassificationRecord, policy: &IndustryCodePolicy) {
    if record.classification != Classification::Business {
        return;
    }
    match record.sic_code.take() {
        None => {
            if policy.require_for_business {
                record.warnings.push(ValidationWarning::MissingIndustryCode);
            }
        }
        Some(code) if !sic_pattern().is_match(&code) => {
            record
                .warnings
                .push(ValidationWarning::MalformedIndustryCode { raw: code });
        }
        Some(code) => {
            if record.sic_description.is_none() && policy.require_description {
                record
                    .warnings
                    .push(ValidationWarning::MissingIndustryDescription);
            }
            record.sic_code = Some(code);
        }
    }
}

pub fn is_valid_industry_code(code: &str) -> bool {
    sic_pattern().is_match(code)
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    keywords: KeywordMatcher,
    policy: IndustryCodePolicy,
}

impl Reconciler {
    pub fn new(keywords: KeywordMatcher, policy: IndustryCodePolicy) -> Self {
        Self { keywords, policy }
    }

    pub fn keywords(&self) -> &KeywordMatcher {
        &self.keywords
    }

    pub fn policy(&self) -> &IndustryCodePolicy {
        &self.policy
    }

    pub fn reconcile(&self, raw: &RawResult, payee_name: &str) -> ClassificationRecord {
        if payee_name.trim().is_empty() {
            return ClassificationRecord::failed(payee_name, "Empty payee name");
        }
        let exclusion = self.keywords.check(payee_name);
        let mut record = match ParsedResult::from_raw(raw) {
            ParsedResult::Ok(parsed) => ClassificationRecord {
                payee_name: payee_name.to_string(),
                classification: parsed.classification,
                confidence: parsed.confidence,
                reasoning: parsed.reasoning,
                sic_code: parsed.sic_code,
                sic_description: parsed.sic_description,
                keyword_exclusion: KeywordExclusion::none(),
                processing_tier: ProcessingTier::AiClassified,
                processing_method: ProcessingMethod::BatchApi,
                warnings: Vec::new(),
            },
            ParsedResult::Error { reason } => {
                debug!(payee = payee_name, %reason, "provider result rejected");
                ClassificationRecord::failed(payee_name, reason)
            }
        };
        apply_exclusion(&mut record, exclusion);
        validate_industry_code(&mut record, &self.policy);
        record
    }

    /// Reconciles a whole result set, keyed by unique payee index. Results
    /// pointing outside the unique set are dropped.
    pub fn reconcile_all(&self, raws: &[RawResult], data: &PayeeRowData) -> UniqueResults {
        let mut out = UniqueResults::new();
        for raw in raws {
            let Some(index) = raw.unique_index else {
                continue;
            };
            let Some(name) = data.unique_payee_names.get(index) else {
                continue;
            };
            out.entry(index).or_insert_with(|| self.reconcile(raw, name));
        }
        out
    }
}

/// Keyword exclusion overrides whatever the model said. A failed parse keeps
/// its `Failed` tier so the provenance stays visible.
fn apply_exclusion(record: &mut ClassificationRecord, exclusion: KeywordExclusion) {
    if exclusion.is_excluded {
        if record.classification != Classification::Business {
            record.reasoning = format!(
                "{} Overridden to Business. {}",
                exclusion.reasoning, record.reasoning
            );
        }
        record.classification = Classification::Business;
        record.confidence = record.confidence.max(exclusion.confidence);
        if record.processing_tier != ProcessingTier::Failed {
            record.processing_tier = ProcessingTier::KeywordExcluded;
            record.processing_method = ProcessingMethod::KeywordExclusion;
        }
    }
    record.keyword_exclusion = exclusion;
}

/// Industry codes present after reconciliation, keyed by unique payee name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndustryCodeLedger {
    codes: HashMap<String, String>,
}

impl IndustryCodeLedger {
    pub fn capture(results: &UniqueResults, data: &PayeeRowData) -> Self {
        let codes = results
            .iter()
            .filter_map(|(index, record)| {
                let name = data.unique_payee_names.get(*index)?;
                let code = record.sic_code.clone()?;
                Some((name.clone(), code))
            })
            .collect();
        Self { codes }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn expected(&self, payee_name: &str) -> Option<&str> {
        self.codes.get(payee_name).map(String::as_str)
    }

    /// Fails if any row lost or changed a code it had before `stage`.
    pub fn verify_rows(&self, stage: &str, rows: &[ExpandedRow]) -> Result<(), ConsistencyError> {
        for row in rows {
            let Some(expected) = self.codes.get(&row.payee_name) else {
                continue;
            };
            match row.record.sic_code.as_deref() {
                None => {
                    return Err(ConsistencyError::IndustryCodeLost {
                        stage: stage.to_string(),
                        payee: row.payee_name.clone(),
                        expected: expected.clone(),
                    })
                }
                Some(actual) if actual != expected => {
                    return Err(ConsistencyError::IndustryCodeChanged {
                        stage: stage.to_string(),
                        payee: row.payee_name.clone(),
                        expected: expected.clone(),
                        actual: actual.to_string(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
