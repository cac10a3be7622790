//! Rule-based classifier used when the batch provider is unavailable.

use payclass_core::{
    Classification, ClassificationRecord, KeywordExclusion, ProcessingMethod, ProcessingTier,
};

use crate::keywords::KeywordMatcher;
use crate::mapper::UniqueResults;
use crate::reconcile::{validate_industry_code, IndustryCodePolicy};

const BUSINESS_HINTS: &[&str] = &[
    "services", "service", "solutions", "systems", "group", "holdings", "partners", "enterprises",
    "industries", "supply", "store", "market", "restaurant", "cafe", "consulting", "construction",
    "roofing", "plumbing", "landscaping", "auto", "motors", "logistics", "labs", "studio",
    "agency", "co",
];

/// Rules never infer an industry code, so Business records always carry a
/// missing-code warning under the default policy.
#[derive(Debug, Clone, Default)]
pub struct LocalClassifier {
    keywords: KeywordMatcher,
    policy: IndustryCodePolicy,
}

impl LocalClassifier {
    pub fn new(keywords: KeywordMatcher) -> Self {
        Self {
            keywords,
            policy: IndustryCodePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: IndustryCodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn classify(&self, payee_name: &str) -> ClassificationRecord {
        let name = payee_name.trim();
        if name.is_empty() {
            return ClassificationRecord::failed(payee_name, "Empty payee name");
        }

        let exclusion = self.keywords.check(name);
        let (classification, confidence, reasoning) = if exclusion.is_excluded {
            (Classification::Business, exclusion.confidence, exclusion.reasoning.clone())
        } else {
            shape_rules(name)
        };

        let mut record = ClassificationRecord {
            payee_name: payee_name.to_string(),
            classification,
            confidence,
            reasoning,
            sic_code: None,
            sic_description: None,
            keyword_exclusion: if exclusion.is_excluded {
                exclusion
            } else {
                KeywordExclusion::none()
            },
            processing_tier: ProcessingTier::LocalFallback,
            processing_method: ProcessingMethod::LocalRules,
            warnings: Vec::new(),
        };
        validate_industry_code(&mut record, &self.policy);
        record
    }

    pub fn classify_all(&self, names: &[String]) -> UniqueResults {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| (index, self.classify(name)))
            .collect()
    }
}

fn shape_rules(name: &str) -> (Classification, u8, String) {
    let lower = name.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    if let Some(hint) = words.iter().find(|w| BUSINESS_HINTS.contains(w)) {
        return (
            Classification::Business,
            80,
            format!("Local rules: business term {hint:?}"),
        );
    }
    if name.contains('&') || name.chars().any(|c| c.is_ascii_digit()) {
        return (
            Classification::Business,
            70,
            "Local rules: ampersand or digits in name".to_string(),
        );
    }
    if (2..=3).contains(&words.len()) && words.iter().all(|w| w.chars().all(char::is_alphabetic)) {
        return (
            Classification::Individual,
            65,
            "Local rules: looks like a personal name".to_string(),
        );
    }
    (
        Classification::Business,
        50,
        "Local rules: no personal-name shape".to_string(),
    )
}
