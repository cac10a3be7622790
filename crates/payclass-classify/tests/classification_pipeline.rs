use payclass_adapters::RawResult;
use payclass_classify::{
    build_mapping, expand, expand_chunked, export_csv, read_csv, IndustryCodeLedger,
    Reconciler, UniqueResults,
};
use payclass_core::{Classification, ProcessingTier, NO_RESULT_REASONING};

fn raw_for(index: usize, content: &str) -> RawResult {
    RawResult {
        custom_id: format!("payee-{index}"),
        unique_index: Some(index),
        payee_name: None,
        content: Some(content.to_string()),
        error: None,
    }
}

const UPLOAD: &str = "Vendor,Amount\nAcme Inc,120.00\nAcme Inc,80.50\nJane Doe,15.00\n";

#[tokio::test]
async fn small_upload_round_trips_with_industry_codes() {
    let file = read_csv(UPLOAD.as_bytes()).unwrap();
    let data = build_mapping(file, "Vendor").unwrap();
    assert_eq!(data.unique_payee_names, vec!["Acme Inc", "Jane Doe"]);

    let raws = vec![
        raw_for(
            0,
            r#"{"classification":"Business","confidence":0.95,"reasoning":"Corporate suffix","sicCode":"5812","sicDescription":"Eating Places"}"#,
        ),
        raw_for(
            1,
            r#"{"classification":"Individual","confidence":0.9,"reasoning":"Personal name"}"#,
        ),
    ];
    let results = Reconciler::default().reconcile_all(&raws, &data);
    let ledger = IndustryCodeLedger::capture(&results, &data);
    assert_eq!(ledger.expected("Acme Inc"), Some("5812"));

    let mut seen = Vec::new();
    let rows = expand_chunked(&results, &data, 2, |p| seen.push(p.processed))
        .await
        .unwrap();
    ledger.verify_rows("expansion", &rows).unwrap();
    assert_eq!(seen, vec![2, 3]);

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].record.classification, Classification::Business);
    assert_eq!(rows[0].record.sic_code.as_deref(), Some("5812"));
    assert_eq!(rows[1].record.sic_code.as_deref(), Some("5812"));
    assert_eq!(rows[2].record.classification, Classification::Individual);
    assert_eq!(rows[2].record.confidence, 90);

    let csv = String::from_utf8(export_csv(&rows, &data.original_file_data.columns).unwrap()).unwrap();
    assert_eq!(csv.lines().count(), 4);
    assert!(csv.lines().nth(2).unwrap().contains("\"80.50\""));
}

#[tokio::test]
async fn missing_results_become_placeholders_not_gaps() {
    let data = build_mapping(read_csv(UPLOAD.as_bytes()).unwrap(), "Vendor").unwrap();
    let rows = expand_chunked(&UniqueResults::new(), &data, 1, |_| {}).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.record.reasoning == NO_RESULT_REASONING));
    assert!(rows.iter().all(|r| r.record.processing_tier == ProcessingTier::Placeholder));
}

#[test]
fn keyword_override_and_failed_payloads_survive_expansion() {
    let csv = "Vendor\nGreenleaf Trust\nJohn Smith\n";
    let data = build_mapping(read_csv(csv.as_bytes()).unwrap(), "Vendor").unwrap();
    let raws = vec![
        raw_for(0, r#"{"classification":"Individual","confidence":0.7}"#),
        raw_for(1, "the model rambled instead of answering"),
    ];
    let results = Reconciler::default().reconcile_all(&raws, &data);
    let rows = expand(&results, &data).unwrap();

    assert_eq!(rows[0].record.classification, Classification::Business);
    assert_eq!(rows[0].record.processing_tier, ProcessingTier::KeywordExcluded);
    assert_eq!(rows[1].record.processing_tier, ProcessingTier::Failed);
}

#[test]
fn ledger_detects_a_dropped_code() {
    let data = build_mapping(read_csv(UPLOAD.as_bytes()).unwrap(), "Vendor").unwrap();
    let raws = vec![raw_for(
        0,
        r#"{"classification":"Business","confidence":95,"sicCode":"5812","sicDescription":"Eating Places"}"#,
    )];
    let mut results: UniqueResults = Reconciler::default().reconcile_all(&raws, &data);
    let ledger = IndustryCodeLedger::capture(&results, &data);

    if let Some(record) = results.get_mut(&0) {
        record.sic_code = None;
    }
    let rows = expand(&results, &data).unwrap();
    assert!(ledger.verify_rows("persistence", &rows).is_err());
}
