use gleaner_core::{
    CheckpointStore, ExitStatus, JsonlCheckpointStore, NullSink, RecordStatus,
    TracingWorkerReporter,
};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{dataset, pipeline, service};

#[tokio::test]
async fn second_run_after_full_success_fetches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("checkpoint.jsonl");
    let (records, server) = dataset(5);
    let svc = service(&server);

    let first = pipeline(&checkpoint)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();
    assert_eq!(first.summary.succeeded, 5);
    assert_eq!(server.fetches(), 5);

    let second = pipeline(&checkpoint)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();
    assert_eq!(server.fetches(), 5, "no additional fetches on the second run");
    assert_eq!(second.summary.skipped, 5);
    assert_eq!(second.summary.succeeded, 0);
    assert_eq!(second.summary.field_completion, first.summary.field_completion);
    assert_eq!(second.exit_status, ExitStatus::Success);
    assert!(second.records.iter().all(|r| r.from_checkpoint));

    let third = pipeline(&checkpoint)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();
    assert_eq!(third.summary, second.summary);
}

#[tokio::test]
async fn interrupted_run_resumes_remaining_records() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("checkpoint.jsonl");
    let (records, server) = dataset(6);
    let svc = service(&server);

    // First run only reaches 2 of 6 records.
    pipeline(&checkpoint)
        .await
        .run(
            &records[..2].to_vec(),
            &svc,
            &NullSink,
            &CancellationToken::new(),
            &TracingWorkerReporter,
        )
        .await
        .unwrap();
    assert_eq!(server.fetches(), 2);

    let report = pipeline(&checkpoint)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();

    assert_eq!(server.fetches(), 6, "only the 4 unfinished records are fetched");
    assert_eq!(report.summary.skipped, 2);
    assert_eq!(report.summary.succeeded, 4);
    assert_eq!(report.records.len(), 6);
}

#[tokio::test]
async fn torn_checkpoint_tail_costs_at_most_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("checkpoint.jsonl");
    let (records, server) = dataset(3);
    let svc = service(&server);

    pipeline(&checkpoint)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();

    // Chop the last line in half, as if the process died mid-write.
    let text = std::fs::read_to_string(&checkpoint).unwrap();
    let keep = text.trim_end().rfind('\n').map_or(0, |i| i + 1);
    let last = &text[keep..];
    let torn = format!("{}{}", &text[..keep], &last[..last.len() / 2]);
    std::fs::write(&checkpoint, torn).unwrap();

    let report = pipeline(&checkpoint)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();

    assert_eq!(report.summary.skipped, 2);
    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(server.fetches(), 4);

    let store = JsonlCheckpointStore::open(&checkpoint).await.unwrap();
    assert_eq!(store.load().await.unwrap().len(), 3);
}

#[tokio::test]
async fn failed_records_are_retried_on_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("checkpoint.jsonl");
    let (records, server) = dataset(2);
    let svc = service(&server);
    let flaky = records[1].id.clone();

    // More failures than one run's budget (3 attempts).
    server.fail_next(&flaky, 3);
    let first = pipeline(&checkpoint)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();
    assert_eq!(first.summary.failed, 1);
    assert_eq!(first.exit_status, ExitStatus::Partial);
    assert_eq!(first.records[1].record.status, RecordStatus::Failed);
    assert!(first.records[1]
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("HTTP 503")));

    let second = pipeline(&checkpoint)
        .await
        .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
        .await
        .unwrap();
    assert_eq!(second.summary.skipped, 1);
    assert_eq!(second.summary.succeeded, 1);
    assert_eq!(second.summary.failed, 0);

    let store = JsonlCheckpointStore::open(&checkpoint).await.unwrap();
    let entry = &store.load().await.unwrap()[&flaky];
    assert_eq!(entry.status, RecordStatus::Succeeded);
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.total_attempts, 4);
}

#[tokio::test]
async fn run_compacts_checkpoint_log() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("checkpoint.jsonl");
    let (records, server) = dataset(2);
    let svc = service(&server);
    server.fail_next(&records[0].id, 3);

    for _ in 0..2 {
        pipeline(&checkpoint)
            .await
            .run(&records, &svc, &NullSink, &CancellationToken::new(), &TracingWorkerReporter)
            .await
            .unwrap();
    }

    let lines = std::fs::read_to_string(&checkpoint)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count();
    assert_eq!(lines, 2);
}
