//! End-to-end run: load → resume → schedule → reassemble → write.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{CheckpointEntry, EnrichedRecord, ExitStatus, Record, RunSummary};
use crate::scheduler::{Scheduler, SchedulerConfig, WorkerReporter};
use crate::traits::{CheckpointStore, RecordOperation, RecordSource, ResultSink};

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per input record, in input order.
    pub records: Vec<EnrichedRecord>,
    pub summary: RunSummary,
    pub exit_status: ExitStatus,
}

/// Drives a run end to end against one checkpoint store.
pub struct Pipeline<S: CheckpointStore> {
    store: S,
    scheduler: Scheduler<S>,
    fields: Vec<String>,
}

impl<S: CheckpointStore> Pipeline<S> {
    pub fn new(store: S, config: SchedulerConfig) -> Self {
        Self {
            scheduler: Scheduler::new(store.clone(), config),
            store,
            fields: Vec::new(),
        }
    }

    /// Fields reported in `field_completion`, even when never found.
    pub fn with_fields<I, F>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Run the pipeline.
    ///
    /// Input and checkpoint failures abort before any record is dispatched.
    /// Re-running against the same store never reprocesses done records.
    pub async fn run<Src, O, Snk, R>(
        &self,
        source: &Src,
        operation: &O,
        sink: &Snk,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<RunReport, AppError>
    where
        Src: RecordSource,
        O: RecordOperation,
        Snk: ResultSink,
        R: WorkerReporter,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let input = source.load().await.map_err(|e| match e {
            AppError::InputError(_) => e,
            other => AppError::InputError(other.to_string()),
        })?;
        let checkpoint = self.store.load().await?;

        let mut seen = HashSet::new();
        let unique: Vec<&Record> = input.iter().filter(|r| seen.insert(r.id.as_str())).collect();
        let duplicates = input.len() - unique.len();

        let pending: Vec<Record> = unique
            .iter()
            .filter(|r| !checkpoint.get(&r.id).is_some_and(CheckpointEntry::is_done))
            .map(|r| (*r).clone())
            .collect();
        let resumed = unique.len() - pending.len();

        tracing::info!(
            %run_id,
            records = input.len(),
            duplicates,
            resumed,
            pending = pending.len(),
            "Starting run"
        );

        let schedule = self.scheduler.run(pending, operation, cancel, reporter).await?;

        let mut summary = schedule.summary;
        summary.skipped += resumed;

        let mut finished: HashMap<String, EnrichedRecord> = schedule
            .outcomes
            .into_iter()
            .map(|outcome| {
                let entry = outcome.entry;
                (
                    outcome.record.id.clone(),
                    EnrichedRecord {
                        record: outcome.record,
                        payload: entry.result_payload,
                        attempt_count: entry.attempt_count,
                        last_error: entry.last_error,
                        from_checkpoint: false,
                    },
                )
            })
            .collect();

        for record in &unique {
            if finished.contains_key(&record.id) {
                continue;
            }
            let entry = checkpoint.get(&record.id).ok_or_else(|| {
                AppError::Generic(format!("record '{}' finished without an outcome", record.id))
            })?;
            let mut restored = (*record).clone();
            restored.status = entry.status;
            finished.insert(
                record.id.clone(),
                EnrichedRecord {
                    record: restored,
                    payload: entry.result_payload.clone(),
                    attempt_count: entry.attempt_count,
                    last_error: entry.last_error.clone(),
                    from_checkpoint: true,
                },
            );
        }

        summary.field_completion = self.field_completion(unique.iter().filter_map(|r| finished.get(&r.id)));

        let position: HashMap<&str, usize> = unique
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.as_str(), i))
            .collect();
        summary
            .failures
            .sort_by_key(|f| position.get(f.record_id.as_str()).copied().unwrap_or(usize::MAX));

        let records: Vec<EnrichedRecord> = input
            .iter()
            .filter_map(|r| finished.get(&r.id).cloned())
            .collect();

        sink.write(&records, &summary).await.map_err(|e| match e {
            AppError::SinkError(_) => e,
            other => AppError::SinkError(other.to_string()),
        })?;
        self.store.compact().await?;

        let exit_status = ExitStatus::from_summary(&summary);
        tracing::info!(
            %run_id,
            succeeded = summary.succeeded,
            partially_succeeded = summary.partially_succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            exit_code = exit_status.code(),
            "Run finished"
        );

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records,
            summary,
            exit_status,
        })
    }

    fn field_completion<'a>(
        &self,
        records: impl Iterator<Item = &'a EnrichedRecord>,
    ) -> BTreeMap<String, usize> {
        let mut completion: BTreeMap<String, usize> =
            self.fields.iter().map(|f| (f.clone(), 0)).collect();
        for record in records {
            let Some(payload) = &record.payload else {
                continue;
            };
            for (field, result) in &payload.fields {
                let count = completion.entry(field.clone()).or_default();
                if result.value.is_found() {
                    *count += 1;
                }
            }
        }
        completion
    }
}
