use std::time::Duration;

use gleaner_core::{
    AliasTable, ComparisonPolicy, ComparisonStatus, EnrichmentService, ExitStatus,
    ExtractionRule, FailureKind, FetcherPool, FieldExtractionRuleSet, FieldExtractor,
    JsonContentParser, NullSink, Record, RecordStatus, RetryPolicy, ThrottleConfig,
    ThrottledFetcher, ToleranceRule, TracingWorkerReporter,
};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{
    PageServer, config, dataset, pipeline, pipeline_with, rules, service,
};

#[tokio::test]
async fn magnification_found_through_fallback_label() {
    let dir = tempfile::tempdir().unwrap();
    let url = "https://data.example.org/ds/mag";
    let server = PageServer::new().page(
        url,
        serde_json::json!({"imaging": {"magnification": "20X"}, "organism": "Human"}),
    );
    let records = vec![Record::new(url)];

    let report = pipeline(&dir.path().join("cp.jsonl"))
        .await
        .run(&records, &service(&server), &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();

    let record = &report.records[0];
    let payload = record.payload.as_ref().unwrap();
    assert_eq!(payload.fields["magnification"].value.as_found(), Some("20X"));
    assert_eq!(payload.fields["magnification"].rule_index, Some(1));
    assert_eq!(payload.fields["species"].rule_index, Some(1));
    assert_eq!(record.record.status, RecordStatus::Succeeded);
}

#[tokio::test]
async fn comparison_rules_apply_per_field() {
    let dir = tempfile::tempdir().unwrap();
    let url = "https://data.example.org/ds/tissue";
    let server = PageServer::new().page(
        url,
        serde_json::json!({
            "Preservation Method": "Formalin-Fixed Paraffin-Embedded",
            "Anatomical Entity": "Human Pancreas",
            "Stain": "PAS"
        }),
    );
    let rules = FieldExtractionRuleSet::new(vec![
        ExtractionRule::labels("preservation", &["Preservation Method"]),
        ExtractionRule::labels("organ", &["Organ", "Anatomical Entity"]),
        ExtractionRule::labels("stain", &["Stain"]),
    ]);
    let policy = ComparisonPolicy::new(ToleranceRule::Exact)
        .with_field_rule("preservation", ToleranceRule::NormalizedAlias)
        .with_field_rule("organ", ToleranceRule::Substring)
        .with_aliases(AliasTable::new().with_group("FFPE", ["Formalin-Fixed Paraffin-Embedded"]));
    let svc = EnrichmentService::new(
        FetcherPool::replicate(server.clone(), 1).unwrap(),
        FieldExtractor::new(JsonContentParser::new(), rules),
        policy,
    );
    let records = vec![
        Record::new(url)
            .with_field("preservation", "FFPE")
            .with_field("organ", "Pancreas")
            .with_field("stain", "H&E"),
    ];

    let report = pipeline(&dir.path().join("cp.jsonl"))
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();

    let payload = report.records[0].payload.as_ref().unwrap();
    let status = |field: &str| {
        payload
            .comparisons
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.status)
    };
    assert_eq!(status("preservation"), Some(ComparisonStatus::Match));
    assert_eq!(status("organ"), Some(ComparisonStatus::Match));
    assert_eq!(status("stain"), Some(ComparisonStatus::Mismatch));
    assert_eq!(report.records[0].record.status, RecordStatus::PartiallySucceeded);
    assert_eq!(report.summary.partially_succeeded, 1);
    assert_eq!(report.exit_status, ExitStatus::Success);
}

#[tokio::test]
async fn unreachable_pages_fail_without_stopping_others() {
    let dir = tempfile::tempdir().unwrap();
    let (mut records, server) = dataset(3);
    records.insert(1, Record::new("https://data.example.org/missing"));

    let report = pipeline(&dir.path().join("cp.jsonl"))
        .await
        .run(&records, &service(&server), &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();

    assert_eq!(report.summary.succeeded, 3);
    assert_eq!(report.summary.failed, 1);
    let failure = &report.summary.failures[0];
    assert_eq!(failure.record_id, "https://data.example.org/missing");
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert_eq!(failure.attempts, 1);
    assert_eq!(report.exit_status, ExitStatus::Partial);
}

#[tokio::test]
async fn every_record_failing_is_critical() {
    let dir = tempfile::tempdir().unwrap();
    let records = vec![Record::new("https://data.example.org/a"), Record::new("https://data.example.org/b")];

    let report = pipeline(&dir.path().join("cp.jsonl"))
        .await
        .run(
            &records,
            &service(&PageServer::new()),
            &NullSink,
            &CancellationToken::new(),
            &TracingWorkerReporter,
        )
        .await
        .unwrap();

    assert_eq!(report.summary.failed, 2);
    assert_eq!(report.exit_status, ExitStatus::Critical);
    assert_eq!(report.exit_status.code(), 2);
}

#[tokio::test]
async fn cancelled_run_records_unstarted_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("cp.jsonl");
    let (records, server) = dataset(4);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline(&checkpoint)
        .await
        .run(&records, &service(&server), &NullSink, &cancel, &TracingWorkerReporter)
        .await
        .unwrap();

    assert_eq!(server.fetches(), 0);
    assert_eq!(report.summary.failed, 4);
    assert!(report
        .records
        .iter()
        .all(|r| r.last_error.as_deref() == Some("cancelled")));

    // The next run picks every record up again.
    let report = pipeline(&checkpoint)
        .await
        .run(&records, &service(&server), &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();
    assert_eq!(report.summary.succeeded, 4);
    assert_eq!(server.fetches(), 4);
}

#[tokio::test]
async fn transient_failures_within_budget_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let (records, server) = dataset(1);
    server.fail_next(&records[0].id, 2);

    let started = std::time::Instant::now();
    let report = pipeline(&dir.path().join("cp.jsonl"))
        .await
        .run(&records, &service(&server), &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();

    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(report.records[0].attempt_count, 3);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn more_workers_than_fetchers_do_not_time_out_in_queue() {
    let dir = tempfile::tempdir().unwrap();
    let (records, server) = dataset(3);
    let server = server.with_latency(Duration::from_millis(80));
    let svc = EnrichmentService::new(
        FetcherPool::replicate(server.clone(), 1).unwrap(),
        FieldExtractor::new(JsonContentParser::new(), rules()),
        ComparisonPolicy::default(),
    );
    let config = config()
        .with_workers(3)
        .with_item_timeout(Duration::from_millis(120))
        .with_retry(RetryPolicy::new(0, Duration::from_millis(1)));

    let report = pipeline_with(&dir.path().join("cp.jsonl"), config)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();

    assert_eq!(report.summary.succeeded, 3, "failures: {:?}", report.summary.failures);
    assert_eq!(report.summary.failed, 0);
    assert_eq!(server.fetches(), 3);
}

#[tokio::test]
async fn host_throttle_longer_than_item_timeout_does_not_fail_records() {
    let dir = tempfile::tempdir().unwrap();
    let (records, server) = dataset(4);
    let throttled = ThrottledFetcher::new(
        server.clone(),
        ThrottleConfig::new(Duration::from_millis(100)),
    );
    let svc = EnrichmentService::new(
        FetcherPool::replicate(throttled, 4).unwrap(),
        FieldExtractor::new(JsonContentParser::new(), rules()),
        ComparisonPolicy::default(),
    );
    let config = config()
        .with_workers(4)
        .with_item_timeout(Duration::from_millis(150))
        .with_retry(RetryPolicy::new(0, Duration::from_millis(1)));

    let report = pipeline_with(&dir.path().join("cp.jsonl"), config)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();

    assert_eq!(report.summary.succeeded, 4, "failures: {:?}", report.summary.failures);
    assert_eq!(server.fetches(), 4);
}
