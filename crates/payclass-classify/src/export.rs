//! CSV ingest of uploaded spreadsheets and CSV export of expanded results.

use std::collections::HashSet;

use payclass_core::{ExpandedRow, OriginalFileData, OriginalRow};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CLASSIFICATION_COLUMNS: &[&str] = &[
    "payee_name",
    "classification",
    "confidence",
    "reasoning",
    "sic_code",
    "sic_description",
    "processing_tier",
    "processing_method",
    "keyword_excluded",
    "matched_keywords",
    "warnings",
];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv buffer flush failed: {0}")]
    Flush(String),
}

fn enum_text<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(JsonValue::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

fn cell_text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn classification_cells(row: &ExpandedRow) -> Vec<String> {
    let record = &row.record;
    vec![
        row.payee_name.clone(),
        record.classification.to_string(),
        record.confidence.to_string(),
        record.reasoning.clone(),
        record.sic_code.clone().unwrap_or_default(),
        record.sic_description.clone().unwrap_or_default(),
        enum_text(&record.processing_tier),
        enum_text(&record.processing_method),
        record.keyword_exclusion.is_excluded.to_string(),
        record.keyword_exclusion.matched_keywords.join("; "),
        record
            .warnings
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; "),
    ]
}

/// Original columns in first-appearance order: declared columns, then any
/// keys that only show up in individual rows.
fn original_columns(declared: &[String], rows: &[ExpandedRow]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    let mut push = |name: &String| {
        if !columns.contains(name) {
            columns.push(name.clone());
        }
    };
    declared.iter().for_each(&mut push);
    rows.iter().flat_map(|r| r.original.keys()).for_each(&mut push);
    columns
}

/// Headers for the original columns. A name that clashes with a
/// classification column becomes `original_<name>`, with a numeric suffix
/// when the upload already has a column of that name too.
fn original_headers(originals: &[String]) -> Vec<String> {
    let clashes = |name: &str| CLASSIFICATION_COLUMNS.contains(&name);
    let mut taken: HashSet<String> = CLASSIFICATION_COLUMNS.iter().map(|c| c.to_string()).collect();
    taken.extend(originals.iter().filter(|c| !clashes(c)).cloned());

    originals
        .iter()
        .map(|name| {
            if !clashes(name) {
                return name.clone();
            }
            let mut candidate = format!("original_{name}");
            let mut suffix = 2;
            while taken.contains(&candidate) {
                candidate = format!("original_{name}_{suffix}");
                suffix += 1;
            }
            taken.insert(candidate.clone());
            candidate
        })
        .collect()
}

/// Renders one line per expanded row. Every field is quoted.
pub fn export_csv(rows: &[ExpandedRow], declared_columns: &[String]) -> Result<Vec<u8>, ExportError> {
    let originals = original_columns(declared_columns, rows);
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .from_writer(Vec::new());

    let header: Vec<String> = CLASSIFICATION_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(original_headers(&originals))
        .collect();
    writer.write_record(&header)?;

    for row in rows {
        let mut cells = classification_cells(row);
        cells.extend(originals.iter().map(|c| cell_text(row.original.get(c))));
        writer.write_record(&cells)?;
    }
    writer
        .into_inner()
        .map_err(|err| ExportError::Flush(err.error().to_string()))
}

/// Parses an uploaded CSV into string-valued rows keyed by header.
pub fn read_csv(bytes: &[u8]) -> Result<OriginalFileData, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();
    let mut columns: Vec<String> = Vec::new();
    for header in &headers {
        if !columns.contains(header) {
            columns.push(header.clone());
        }
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        let mut row = OriginalRow::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            row.entry(header.clone())
                .or_insert_with(|| JsonValue::String(field.to_string()));
        }
        rows.push(row);
    }
    Ok(OriginalFileData { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use payclass_core::{Classification, ClassificationRecord};
    use serde_json::json;

    fn expanded(index: usize, name: &str, original: OriginalRow) -> ExpandedRow {
        let mut record = ClassificationRecord::placeholder(name);
        record.classification = Classification::Business;
        record.confidence = 95;
        record.reasoning = "Says \"Inc\"".to_string();
        record.sic_code = Some("5812".to_string());
        ExpandedRow {
            original_row_index: index,
            payee_name: name.to_string(),
            record,
            original,
        }
    }

    #[test]
    fn quotes_every_field_and_doubles_quotes() {
        let mut original = OriginalRow::new();
        original.insert("Vendor".to_string(), json!("Acme Inc"));
        original.insert("meta".to_string(), json!({"k": 1}));
        let bytes = export_csv(
            &[expanded(0, "Acme Inc", original)],
            &["Vendor".to_string(), "meta".to_string()],
        )
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("\"payee_name\",\"classification\""));
        assert!(header.ends_with("\"Vendor\",\"meta\""));
        let line = lines.next().unwrap();
        assert!(line.contains("\"Says \"\"Inc\"\"\""));
        assert!(line.contains("\"5812\""));
        assert!(line.contains("\"{\"\"k\"\":1}\""));
    }

    #[test]
    fn colliding_original_columns_are_prefixed() {
        let mut original = OriginalRow::new();
        original.insert("classification".to_string(), json!("vendor"));
        let bytes = export_csv(&[expanded(0, "Acme Inc", original)], &[]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.lines().next().unwrap().ends_with("\"original_classification\""));
        assert!(text.lines().nth(1).unwrap().ends_with("\"vendor\""));
    }

    #[test]
    fn renamed_columns_never_duplicate_an_upload_header() {
        let mut original = OriginalRow::new();
        original.insert("original_classification".to_string(), json!("kept"));
        original.insert("classification".to_string(), json!("vendor"));
        let declared = vec!["original_classification".to_string(), "classification".to_string()];
        let bytes = export_csv(&[expanded(0, "Acme Inc", original)], &declared).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.ends_with("\"original_classification\",\"original_classification_2\""));

        let names: Vec<&str> = header.split(',').collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
        assert!(text.lines().nth(1).unwrap().ends_with("\"kept\",\"vendor\""));
    }

    #[test]
    fn reads_headers_and_skips_blank_lines() {
        let input = "\u{feff}Vendor,Amount\nAcme Inc,10\n,\nJane Doe,5\n";
        let data = read_csv(input.as_bytes()).unwrap();
        assert_eq!(data.columns, vec!["Vendor".to_string(), "Amount".to_string()]);
        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[1]["Vendor"], json!("Jane Doe"));
    }
}
