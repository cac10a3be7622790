//! Deduplicates uploaded rows into a unique payee set and expands unique
//! results back onto every original row.

use std::collections::HashMap;

use payclass_core::{
    ClassificationRecord, ExpandedRow, OriginalFileData, PayeeRowData, RowMapping,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::ConsistencyError;

/// Classification results keyed by unique payee index.
pub type UniqueResults = HashMap<usize, ClassificationRecord>;

const KNOWN_PREFIXES: &[&str] = &[
    "payment to ",
    "paid to ",
    "pmt to ",
    "pymt to ",
    "transfer to ",
    "ach ",
];

/// UTF-8 text that was decoded as Windows-1252 somewhere upstream.
const MOJIBAKE: &[(&str, &str)] = &[
    ("â€™", "'"),
    ("â€˜", "'"),
    ("â€œ", "\""),
    ("â€\u{9d}", "\""),
    ("â€“", "-"),
    ("â€”", "-"),
    ("Ã©", "é"),
    ("Ã¨", "è"),
    ("Ã¡", "á"),
    ("Ã³", "ó"),
    ("Ã±", "ñ"),
    ("Ã¼", "ü"),
    ("Ã¶", "ö"),
    ("&amp;", "&"),
    ("\u{feff}", ""),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("payee column {column:?} not present (available: {available:?})")]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExpansionProgress {
    pub processed: usize,
    pub total: usize,
    pub percentage: f64,
}

fn strip_known_prefix(name: &str) -> &str {
    for prefix in KNOWN_PREFIXES {
        if let Some(head) = name.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) && name.len() > prefix.len() {
                return name[prefix.len()..].trim_start();
            }
        }
    }
    name
}

/// Display form kept in the unique list: encoding repaired, NFKC-normalized,
/// known payment prefixes removed, whitespace collapsed.
pub fn clean_payee_name(raw: &str) -> String {
    let mut repaired = raw.to_string();
    for (bad, good) in MOJIBAKE {
        if repaired.contains(bad) {
            repaired = repaired.replace(bad, good);
        }
    }
    let normalized: String = repaired.nfkc().collect();
    let collapsed = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    strip_known_prefix(&collapsed).to_string()
}

/// Dedup key: the cleaned name, case-folded, without trailing punctuation.
pub fn normalize_payee_key(raw: &str) -> String {
    clean_payee_name(raw)
        .to_lowercase()
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':'))
        .trim()
        .to_string()
}

fn cell_text(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Builds the unique payee set and the row→unique mapping for an upload.
pub fn build_mapping(
    file: OriginalFileData,
    payee_column: &str,
) -> Result<PayeeRowData, MappingError> {
    let column_listed = file.columns.iter().any(|c| c == payee_column);
    let column_seen = file.rows.iter().any(|row| row.contains_key(payee_column));
    let has_shape = !file.columns.is_empty() || !file.rows.is_empty();
    if has_shape && !column_listed && !column_seen {
        return Err(MappingError::MissingColumn {
            column: payee_column.to_string(),
            available: file.columns.clone(),
        });
    }

    let mut unique_payee_names: Vec<String> = Vec::new();
    let mut index_by_key: HashMap<String, usize> = HashMap::new();
    let mut row_mappings = Vec::with_capacity(file.rows.len());

    for (row_index, row) in file.rows.iter().enumerate() {
        let raw = cell_text(row.get(payee_column));
        let key = normalize_payee_key(&raw);
        let unique_payee_index = *index_by_key.entry(key).or_insert_with(|| {
            unique_payee_names.push(clean_payee_name(&raw));
            unique_payee_names.len() - 1
        });
        row_mappings.push(RowMapping {
            original_row_index: row_index,
            unique_payee_index,
            payee_name: unique_payee_names[unique_payee_index].clone(),
        });
    }

    Ok(PayeeRowData {
        unique_payee_names,
        row_mappings,
        original_file_data: file,
    })
}

fn check_shape(data: &PayeeRowData) -> Result<(), ConsistencyError> {
    let expected = data.original_file_data.rows.len();
    if data.row_mappings.len() != expected {
        return Err(ConsistencyError::RowCountMismatch {
            expected,
            actual: data.row_mappings.len(),
        });
    }
    Ok(())
}

fn expand_one(results: &UniqueResults, data: &PayeeRowData, position: usize) -> Result<ExpandedRow, ConsistencyError> {
    let mapping = &data.row_mappings[position];
    if mapping.original_row_index != position {
        return Err(ConsistencyError::MappingOutOfOrder {
            position,
            found: mapping.original_row_index,
        });
    }
    let record = results
        .get(&mapping.unique_payee_index)
        .cloned()
        .unwrap_or_else(|| ClassificationRecord::placeholder(mapping.payee_name.clone()));
    Ok(ExpandedRow {
        original_row_index: position,
        payee_name: mapping.payee_name.clone(),
        record,
        original: data.original_file_data.rows[position].clone(),
    })
}

/// Expands unique results to one row per original row, in original order.
/// Rows without a result get a placeholder instead of being dropped.
pub fn expand(
    results: &UniqueResults,
    data: &PayeeRowData,
) -> Result<Vec<ExpandedRow>, ConsistencyError> {
    check_shape(data)?;
    let rows = (0..data.row_mappings.len())
        .map(|position| expand_one(results, data, position))
        .collect::<Result<Vec<_>, _>>()?;
    if rows.len() != data.original_file_data.rows.len() {
        return Err(ConsistencyError::RowCountMismatch {
            expected: data.original_file_data.rows.len(),
            actual: rows.len(),
        });
    }
    Ok(rows)
}

/// Same output as [`expand`], produced in `chunk_size` slices with a progress
/// callback after each slice and a yield to the runtime in between.
pub async fn expand_chunked<F>(
    results: &UniqueResults,
    data: &PayeeRowData,
    chunk_size: usize,
    mut progress: F,
) -> Result<Vec<ExpandedRow>, ConsistencyError>
where
    F: FnMut(ExpansionProgress),
{
    check_shape(data)?;
    let total = data.row_mappings.len();
    let chunk_size = chunk_size.max(1);
    let mut rows = Vec::with_capacity(total);

    let mut start = 0;
    while start < total {
        let end = (start + chunk_size).min(total);
        for position in start..end {
            rows.push(expand_one(results, data, position)?);
        }
        progress(ExpansionProgress {
            processed: end,
            total,
            percentage: (end as f64 / total as f64) * 100.0,
        });
        start = end;
        if start < total {
            tokio::task::yield_now().await;
        }
    }

    if rows.len() != total {
        return Err(ConsistencyError::RowCountMismatch {
            expected: total,
            actual: rows.len(),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use payclass_core::{Classification, OriginalRow, NO_RESULT_REASONING};
    use serde_json::json;

    fn file_with_payees(payees: &[&str]) -> OriginalFileData {
        OriginalFileData {
            columns: vec!["Vendor".to_string(), "Amount".to_string()],
            rows: payees
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let mut row = OriginalRow::new();
                    row.insert("Vendor".to_string(), json!(p));
                    row.insert("Amount".to_string(), json!(i * 10));
                    row
                })
                .collect(),
        }
    }

    fn business(name: &str) -> ClassificationRecord {
        let mut record = ClassificationRecord::placeholder(name);
        record.classification = Classification::Business;
        record.confidence = 90;
        record
    }

    #[test]
    fn cleaning_repairs_encoding_and_strips_prefixes() {
        assert_eq!(clean_payee_name("  Payment to   Joeâ€™s  Diner "), "Joe's Diner");
        assert_eq!(clean_payee_name("Caf\u{65}\u{301} Ã©toile"), "Café étoile");
        assert_eq!(clean_payee_name("Smith &amp; Sons"), "Smith & Sons");
        assert_eq!(clean_payee_name("ACH"), "ACH");
        assert_eq!(normalize_payee_key("ACME INC."), normalize_payee_key("acme inc"));
    }

    #[test]
    fn mapping_dedups_in_first_seen_order() {
        let data = build_mapping(
            file_with_payees(&["Acme Inc", "Jane Doe", "ACME INC.", "paid to Jane Doe", "Bob"]),
            "Vendor",
        )
        .unwrap();
        assert_eq!(data.unique_payee_names, vec!["Acme Inc", "Jane Doe", "Bob"]);
        let idx: Vec<usize> = data.row_mappings.iter().map(|m| m.unique_payee_index).collect();
        assert_eq!(idx, vec![0, 1, 0, 1, 2]);
        assert_eq!(data.row_mappings[2].payee_name, "Acme Inc");
    }

    #[test]
    fn missing_column_is_a_validation_error() {
        let err = build_mapping(file_with_payees(&["Acme"]), "Payee").unwrap_err();
        assert!(matches!(err, MappingError::MissingColumn { .. }));
    }

    #[test]
    fn empty_upload_maps_to_empty_set() {
        let data = build_mapping(OriginalFileData::default(), "Vendor").unwrap();
        assert_eq!(data.row_count(), 0);
        assert!(expand(&UniqueResults::new(), &data).unwrap().is_empty());
    }

    #[test]
    fn row_count_is_preserved_for_many_sizes() {
        for n in [0usize, 1, 2, 7, 100] {
            let payees: Vec<String> = (0..n).map(|i| format!("Payee {}", i % 3)).collect();
            let refs: Vec<&str> = payees.iter().map(String::as_str).collect();
            let data = build_mapping(file_with_payees(&refs), "Vendor").unwrap();
            let mut results = UniqueResults::new();
            if data.unique_count() > 0 {
                results.insert(0, business(&data.unique_payee_names[0]));
            }
            let rows = expand(&results, &data).unwrap();
            assert_eq!(rows.len(), n);
            for (i, row) in rows.iter().enumerate() {
                assert_eq!(row.original_row_index, i);
                assert_eq!(row.original["Amount"], json!(i * 10));
            }
        }
    }

    #[test]
    fn missing_results_become_placeholders() {
        let data = build_mapping(file_with_payees(&["Acme Inc", "Jane Doe"]), "Vendor").unwrap();
        let mut results = UniqueResults::new();
        results.insert(0, business("Acme Inc"));
        let rows = expand(&results, &data).unwrap();
        assert_eq!(rows[1].record.classification, Classification::Individual);
        assert_eq!(rows[1].record.confidence, 0);
        assert_eq!(rows[1].record.reasoning, NO_RESULT_REASONING);
    }

    #[test]
    fn corrupted_mapping_is_a_consistency_error() {
        let mut data = build_mapping(file_with_payees(&["A", "B"]), "Vendor").unwrap();
        data.row_mappings.pop();
        assert!(matches!(
            expand(&UniqueResults::new(), &data),
            Err(ConsistencyError::RowCountMismatch { expected: 2, actual: 1 })
        ));
    }

    #[tokio::test]
    async fn chunked_expansion_matches_and_reports_progress() {
        let payees: Vec<String> = (0..25).map(|i| format!("Vendor {}", i % 4)).collect();
        let refs: Vec<&str> = payees.iter().map(String::as_str).collect();
        let data = build_mapping(file_with_payees(&refs), "Vendor").unwrap();
        let mut results = UniqueResults::new();
        results.insert(1, business(&data.unique_payee_names[1]));

        let mut seen = Vec::new();
        let chunked = expand_chunked(&results, &data, 10, |p| seen.push(p)).await.unwrap();
        let plain = expand(&results, &data).unwrap();

        assert_eq!(chunked, plain);
        assert_eq!(
            seen.iter().map(|p| p.processed).collect::<Vec<_>>(),
            vec![10, 20, 25]
        );
        assert_eq!(seen.last().unwrap().percentage, 100.0);
    }
}
