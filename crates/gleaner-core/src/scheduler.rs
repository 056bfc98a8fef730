//! Bounded worker pool over a record list.
//!
//! Workers pull records from a shared queue, run the per-record operation
//! under the retry controller with a per-attempt timeout, and write one
//! terminal checkpoint entry per record. Each worker keeps its own partial
//! summary; partials are merged once every worker has stopped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{
    CheckpointEntry, EnrichmentPayload, FailureKind, FailureReason, Record, RecordStatus,
    RunSummary,
};
use crate::retry::{Attempted, RetryError, RetryPolicy, classify_app_error, run_with_retry};
use crate::traits::{CheckpointStore, RecordOperation};

const CANCELLED: &str = "cancelled";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub retry: RetryPolicy,
    /// Deadline for a single attempt's own work, handed to the operation.
    /// Queueing for a pooled fetcher or a host slot is not counted.
    /// Exceeding it is a retryable failure.
    pub item_timeout: Duration,
    /// Budget for the whole run. When it expires no new records are started.
    pub run_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            retry: RetryPolicy::default(),
            item_timeout: Duration::from_secs(30),
            run_timeout: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_item_timeout(mut self, item_timeout: Duration) -> Self {
        self.item_timeout = item_timeout;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = Some(run_timeout);
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.worker_count == 0 {
            return Err(AppError::ConfigError("worker_count must be at least 1".into()));
        }
        if self.item_timeout.is_zero() {
            return Err(AppError::ConfigError("item_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Events emitted by workers for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: usize,
    },
    RecordStarted {
        worker_id: usize,
        record_id: &'a str,
    },
    AttemptFailed {
        worker_id: usize,
        record_id: &'a str,
        attempt: u32,
        error: &'a str,
        will_retry: bool,
    },
    RecordFinished {
        worker_id: usize,
        record_id: &'a str,
        status: RecordStatus,
        attempts: u32,
    },
    RecordFailed {
        worker_id: usize,
        record_id: &'a str,
        error: &'a str,
        attempts: u32,
    },
    /// Record never started because the run was cancelled.
    RecordAbandoned {
        record_id: &'a str,
    },
    Stopped {
        worker_id: usize,
        processed: usize,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::debug!(%worker_id, "Worker started");
            }
            WorkerEvent::RecordStarted {
                worker_id,
                record_id,
            } => {
                tracing::info!(%worker_id, %record_id, "Processing record");
            }
            WorkerEvent::AttemptFailed {
                worker_id,
                record_id,
                attempt,
                error,
                will_retry,
            } => {
                tracing::debug!(%worker_id, %record_id, %attempt, %error, %will_retry, "Attempt failed");
            }
            WorkerEvent::RecordFinished {
                worker_id,
                record_id,
                status,
                attempts,
            } => {
                tracing::info!(%worker_id, %record_id, %status, %attempts, "Record finished");
            }
            WorkerEvent::RecordFailed {
                worker_id,
                record_id,
                error,
                attempts,
            } => {
                tracing::warn!(%worker_id, %record_id, %error, %attempts, "Record failed");
            }
            WorkerEvent::RecordAbandoned { record_id } => {
                tracing::warn!(%record_id, "Record abandoned, run cancelled");
            }
            WorkerEvent::Stopped {
                worker_id,
                processed,
            } => {
                tracing::debug!(%worker_id, %processed, "Worker stopped");
            }
        }
    }
}

/// Terminal state of one record processed in this run.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub record: Record,
    pub entry: CheckpointEntry,
}

/// What [`Scheduler::run`] hands back to its caller.
#[derive(Debug, Clone, Default)]
pub struct ScheduleReport {
    pub summary: RunSummary,
    pub outcomes: Vec<RecordOutcome>,
}

#[derive(Default)]
struct WorkerPartial {
    summary: RunSummary,
    outcomes: Vec<RecordOutcome>,
}

/// Record ids currently owned by a worker.
#[derive(Default, Clone)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    fn claim(&self, record_id: &str) -> Result<Claim, AppError> {
        if !lock(&self.0).insert(record_id.to_string()) {
            return Err(AppError::Generic(format!(
                "record '{record_id}' is already being processed"
            )));
        }
        Ok(Claim {
            owners: self.0.clone(),
            record_id: record_id.to_string(),
        })
    }
}

/// Releases the record id when the owning worker is done with it.
struct Claim {
    owners: Arc<Mutex<HashSet<String>>>,
    record_id: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.owners).remove(&self.record_id);
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Distributes records across `worker_count` concurrent workers.
pub struct Scheduler<S: CheckpointStore> {
    store: S,
    config: SchedulerConfig,
}

impl<S: CheckpointStore> Scheduler<S> {
    pub fn new(store: S, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Process every record not already done, returning the merged summary
    /// and the outcome of each record processed.
    ///
    /// A checkpoint write failure aborts the run immediately. Cancelling
    /// `cancel` (or the run timeout expiring) stops new records from
    /// starting; those are recorded as failed with reason "cancelled".
    pub async fn run<O, R>(
        &self,
        records: Vec<Record>,
        operation: &O,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<ScheduleReport, AppError>
    where
        O: RecordOperation,
        R: WorkerReporter,
    {
        self.config.validate()?;

        let prior = self.store.load().await?;
        let mut summary = RunSummary::default();
        let mut seen = HashSet::new();
        let mut pending = VecDeque::new();

        for mut record in records {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            if prior.get(&record.id).is_some_and(CheckpointEntry::is_done) {
                summary.skipped += 1;
                continue;
            }
            record.status = RecordStatus::Pending;
            pending.push_back(record);
        }

        tracing::info!(
            pending = pending.len(),
            skipped = summary.skipped,
            workers = self.config.worker_count,
            "Scheduling records"
        );

        let run_cancel = cancel.child_token();
        let _timer = self.config.run_timeout.map(|budget| {
            let token = run_cancel.clone();
            AbortOnDrop(tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(budget) => {
                        tracing::warn!(budget_secs = budget.as_secs_f64(), "Run timeout reached, cancelling");
                        token.cancel();
                    }
                    () = token.cancelled() => {}
                }
            }))
        });

        let queue = Mutex::new(pending);
        let in_flight = InFlight::default();

        let workers = (0..self.config.worker_count).map(|worker_id| {
            self.worker(
                worker_id,
                &queue,
                &in_flight,
                &prior,
                operation,
                &run_cancel,
                reporter,
            )
        });
        let partials = futures::future::try_join_all(workers).await?;

        let mut outcomes = Vec::new();
        for partial in partials {
            summary.merge(partial.summary);
            outcomes.extend(partial.outcomes);
        }

        let abandoned: Vec<Record> = lock(&queue).drain(..).collect();
        for mut record in abandoned {
            reporter.report(WorkerEvent::RecordAbandoned {
                record_id: &record.id,
            });
            record.transition(RecordStatus::InProgress)?;
            record.transition(RecordStatus::Failed)?;

            let entry = CheckpointEntry::failed(&record.id, 0, CANCELLED)
                .with_prior_attempts(prior_attempts(&prior, &record.id));
            self.store.upsert(&entry).await?;

            summary.count(RecordStatus::Failed);
            summary.failures.push(FailureReason {
                record_id: record.id.clone(),
                kind: FailureKind::Cancelled,
                message: CANCELLED.into(),
                attempts: 0,
            });
            outcomes.push(RecordOutcome { record, entry });
        }

        Ok(ScheduleReport { summary, outcomes })
    }

    #[allow(clippy::too_many_arguments)]
    async fn worker<O, R>(
        &self,
        worker_id: usize,
        queue: &Mutex<VecDeque<Record>>,
        in_flight: &InFlight,
        prior: &HashMap<String, CheckpointEntry>,
        operation: &O,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<WorkerPartial, AppError>
    where
        O: RecordOperation,
        R: WorkerReporter,
    {
        reporter.report(WorkerEvent::Started { worker_id });
        let mut partial = WorkerPartial::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(mut record) = lock(queue).pop_front() else {
                break;
            };

            let _claim = in_flight.claim(&record.id)?;
            record.transition(RecordStatus::InProgress)?;
            reporter.report(WorkerEvent::RecordStarted {
                worker_id,
                record_id: &record.id,
            });

            let result = run_with_retry(&self.config.retry, cancel, classify_app_error, |attempt| {
                self.attempt(worker_id, &record, attempt, operation, reporter)
            })
            .await;

            let entry = match result {
                Ok(Attempted { value, attempts }) => {
                    let entry = CheckpointEntry::succeeded(&record.id, attempts, value);
                    reporter.report(WorkerEvent::RecordFinished {
                        worker_id,
                        record_id: &record.id,
                        status: entry.status,
                        attempts,
                    });
                    entry
                }
                Err(err) => {
                    let attempts = err.attempts();
                    let kind = match &err {
                        RetryError::Fatal { .. } => FailureKind::Fatal,
                        RetryError::Exhausted { .. } => FailureKind::Exhausted,
                        RetryError::Cancelled { .. } => FailureKind::Cancelled,
                    };
                    let message = err.into_app_error().to_string();
                    reporter.report(WorkerEvent::RecordFailed {
                        worker_id,
                        record_id: &record.id,
                        error: &message,
                        attempts,
                    });
                    partial.summary.failures.push(FailureReason {
                        record_id: record.id.clone(),
                        kind,
                        message: message.clone(),
                        attempts,
                    });
                    CheckpointEntry::failed(&record.id, attempts, message)
                }
            }
            .with_prior_attempts(prior_attempts(prior, &record.id));

            record.transition(entry.status)?;
            self.store.upsert(&entry).await?;
            partial.summary.count(entry.status);
            partial.outcomes.push(RecordOutcome { record, entry });
        }

        reporter.report(WorkerEvent::Stopped {
            worker_id,
            processed: partial.outcomes.len(),
        });
        Ok(partial)
    }

    async fn attempt<O, R>(
        &self,
        worker_id: usize,
        record: &Record,
        attempt: u32,
        operation: &O,
        reporter: &R,
    ) -> Result<EnrichmentPayload, AppError>
    where
        O: RecordOperation,
        R: WorkerReporter,
    {
        let result = operation
            .process(record, attempt, self.config.item_timeout)
            .await;

        if let Err(e) = &result {
            let message = e.to_string();
            reporter.report(WorkerEvent::AttemptFailed {
                worker_id,
                record_id: &record.id,
                attempt,
                error: &message,
                will_retry: e.is_retryable() && attempt < self.config.retry.max_attempts(),
            });
        }
        result
    }
}

fn prior_attempts(prior: &HashMap<String, CheckpointEntry>, record_id: &str) -> u32 {
    prior.get(record_id).map_or(0, |e| e.total_attempts)
}
