//! Deterministic keyword exclusion: payees whose names contain an entity or
//! institution keyword are always treated as businesses.

use std::path::Path;

use anyhow::Context;
use payclass_core::KeywordExclusion;
use serde::Deserialize;

pub const DEFAULT_EXCLUSION_KEYWORDS: &[&str] = &[
    "llc",
    "inc",
    "incorporated",
    "corp",
    "corporation",
    "ltd",
    "limited",
    "llp",
    "lp",
    "pllc",
    "plc",
    "gmbh",
    "company",
    "bank",
    "credit union",
    "insurance",
    "trust",
    "county",
    "city of",
    "state of",
    "department",
    "dept",
    "treasury",
    "irs",
    "university",
    "college",
    "school district",
    "hospital",
    "clinic",
    "church",
    "foundation",
    "association",
    "utilities",
    "electric",
];

const EXCLUSION_CONFIDENCE: u8 = 95;

#[derive(Debug, Clone, Deserialize)]
struct KeywordRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    keywords: Vec<String>,
}

fn tokens(input: &str) -> Vec<String> {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    /// Original keyword text paired with its token sequence.
    keywords: Vec<(String, Vec<String>)>,
}

impl Default for KeywordMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUSION_KEYWORDS.iter().copied())
    }
}

impl KeywordMatcher {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<(String, Vec<String>)> = Vec::new();
        for keyword in keywords {
            let text = keyword.as_ref().trim().to_lowercase();
            let toks = tokens(&text);
            if toks.is_empty() || out.iter().any(|(_, existing)| *existing == toks) {
                continue;
            }
            out.push((text, toks));
        }
        Self { keywords: out }
    }

    /// Loads `{version, keywords: [...]}` from a YAML rules file.
    pub fn from_yaml_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rules: KeywordRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(rules.keywords))
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Whole-word, case-insensitive match against the payee name.
    pub fn check(&self, payee_name: &str) -> KeywordExclusion {
        let name_tokens = tokens(payee_name);
        let matched: Vec<String> = self
            .keywords
            .iter()
            .filter(|(_, kw)| {
                kw.len() <= name_tokens.len()
                    && name_tokens.windows(kw.len()).any(|window| window == kw.as_slice())
            })
            .map(|(text, _)| text.clone())
            .collect();

        if matched.is_empty() {
            return KeywordExclusion::none();
        }
        KeywordExclusion {
            is_excluded: true,
            reasoning: format!("Matched exclusion keyword(s): {}", matched.join(", ")),
            matched_keywords: matched,
            confidence: EXCLUSION_CONFIDENCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_whole_words_only() {
        let matcher = KeywordMatcher::default();
        assert!(matcher.check("First National Bank").is_excluded);
        assert!(matcher.check("ACME, INC.").is_excluded);
        assert!(!matcher.check("Bankston Jones").is_excluded);
        assert!(!matcher.check("Vincent Price").is_excluded);
    }

    #[test]
    fn multi_word_keywords_need_contiguous_tokens() {
        let matcher = KeywordMatcher::default();
        let hit = matcher.check("City of Springfield Water");
        assert!(hit.is_excluded);
        assert_eq!(hit.matched_keywords, vec!["city of".to_string()]);
        assert!(!matcher.check("Of City Springfield").is_excluded);
    }

    #[test]
    fn records_every_matched_keyword() {
        let hit = KeywordMatcher::default().check("Mercy Hospital Foundation");
        assert_eq!(hit.matched_keywords, vec!["hospital".to_string(), "foundation".to_string()]);
        assert_eq!(hit.confidence, 95);
        assert!(hit.reasoning.contains("hospital"));
    }

    #[test]
    fn loads_rules_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keywords.yaml");
        std::fs::write(&path, "version: 1\nkeywords:\n  - Escrow\n  - title company\n  - escrow\n").unwrap();
        let matcher = KeywordMatcher::from_yaml_path(&path).unwrap();
        assert_eq!(matcher.len(), 2);
        assert!(matcher.check("Pacific Escrow").is_excluded);
        assert!(!matcher.check("Acme Inc").is_excluded);
    }
}
