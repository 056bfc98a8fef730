//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::extract::{Confidence, ExtractedFieldResult, ExtractedValue};
use crate::models::{CheckpointEntry, EnrichedRecord, EnrichmentPayload, Record, RunSummary};
use crate::scheduler::{WorkerEvent, WorkerReporter};
use crate::traits::{CheckpointStore, PageFetcher, RecordOperation, RecordSource, ResultSink};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with scripted responses.
#[derive(Clone, Debug)]
pub struct MockFetcher {
    /// Queue of responses. Each call pops the first element; once empty,
    /// every call returns `body`.
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
    body: String,
    urls: Arc<Mutex<Vec<String>>>,
    latency: Option<Duration>,
}

impl MockFetcher {
    pub fn new(body: &str) -> Self {
        Self::with_responses(Vec::new()).with_body(body)
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            body: "{}".to_string(),
            urls: Arc::new(Mutex::new(Vec::new())),
            latency: None,
        }
    }

    /// Every fetch takes `latency` before answering.
    pub fn with_delay(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.urls.lock().unwrap().push(url.to_string());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.body.clone())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockOperation
// ---------------------------------------------------------------------------

type ErrorFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

#[derive(Default)]
struct OperationState {
    calls: Vec<String>,
    active: HashSet<String>,
    max_active: usize,
    overlaps: usize,
    failures: HashMap<String, (u32, Option<ErrorFactory>)>,
}

/// Per-record operation that records concurrency and can fail on demand.
#[derive(Clone)]
pub struct MockOperation {
    state: Arc<Mutex<OperationState>>,
    delay: Option<Duration>,
    payload: EnrichmentPayload,
}

impl MockOperation {
    /// Succeeds for every record with a payload where `species` is found.
    pub fn succeeding() -> Self {
        Self {
            state: Arc::new(Mutex::new(OperationState::default())),
            delay: None,
            payload: Self::payload(&[("species", Some("Human"))]),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `times` attempts for `record_id`.
    pub fn fail_first(
        self,
        record_id: &str,
        times: u32,
        error: impl Fn() -> AppError + Send + Sync + 'static,
    ) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(record_id.to_string(), (times, Some(Arc::new(error))));
        self
    }

    /// Build a payload from `(field, value)` pairs; `None` means not found.
    pub fn payload(fields: &[(&str, Option<&str>)]) -> EnrichmentPayload {
        let fields = fields
            .iter()
            .map(|(name, value)| {
                let result = match value {
                    Some(v) => ExtractedFieldResult {
                        field: name.to_string(),
                        value: ExtractedValue::Found(v.to_string()),
                        rule_index: Some(0),
                        confidence: Confidence::Matched,
                    },
                    None => ExtractedFieldResult {
                        field: name.to_string(),
                        value: ExtractedValue::NotFound,
                        rule_index: None,
                        confidence: Confidence::Missing,
                    },
                };
                (name.to_string(), result)
            })
            .collect();
        EnrichmentPayload {
            fields,
            comparisons: Vec::new(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn max_concurrency(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    /// Times a record id was started while already in flight.
    pub fn overlapping_claims(&self) -> usize {
        self.state.lock().unwrap().overlaps
    }
}

/// Marks a record inactive even when the attempt future is dropped.
struct ActiveGuard {
    state: Arc<Mutex<OperationState>>,
    record_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.active.remove(&self.record_id);
        }
    }
}

impl RecordOperation for MockOperation {
    async fn process(
        &self,
        record: &Record,
        _attempt: u32,
        timeout: Duration,
    ) -> Result<EnrichmentPayload, AppError> {
        let failure = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(record.id.clone());
            if !state.active.insert(record.id.clone()) {
                state.overlaps += 1;
            }
            state.max_active = state.max_active.max(state.active.len());

            match state.failures.get_mut(&record.id) {
                Some((remaining, factory)) if *remaining > 0 => {
                    *remaining -= 1;
                    factory.clone()
                }
                _ => None,
            }
        };
        let _guard = ActiveGuard {
            state: self.state.clone(),
            record_id: record.id.clone(),
        };

        if let Some(delay) = self.delay
            && tokio::time::timeout(timeout, tokio::time::sleep(delay)).await.is_err()
        {
            return Err(AppError::Timeout(timeout));
        }

        match failure {
            Some(factory) => Err(factory()),
            None => Ok(self.payload.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCheckpointStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, CheckpointEntry>,
    upserts: Vec<CheckpointEntry>,
    fail_upserts: bool,
    fail_loads: bool,
    compactions: usize,
}

/// In-memory checkpoint store recording every upsert.
#[derive(Clone, Default)]
pub struct MockCheckpointStore {
    state: Arc<Mutex<StoreState>>,
}

impl MockCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an entry as if written by an earlier run.
    pub fn seed(&self, entry: CheckpointEntry) {
        self.state
            .lock()
            .unwrap()
            .entries
            .insert(entry.record_id.clone(), entry);
    }

    pub fn failing_upserts(self) -> Self {
        self.state.lock().unwrap().fail_upserts = true;
        self
    }

    pub fn failing_loads(self) -> Self {
        self.state.lock().unwrap().fail_loads = true;
        self
    }

    pub fn upserts(&self) -> Vec<CheckpointEntry> {
        self.state.lock().unwrap().upserts.clone()
    }

    pub fn compactions(&self) -> usize {
        self.state.lock().unwrap().compactions
    }
}

impl CheckpointStore for MockCheckpointStore {
    async fn load(&self) -> Result<HashMap<String, CheckpointEntry>, AppError> {
        let state = self.state.lock().unwrap();
        if state.fail_loads {
            return Err(AppError::CheckpointError("permission denied".into()));
        }
        Ok(state.entries.clone())
    }

    async fn upsert(&self, entry: &CheckpointEntry) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_upserts {
            return Err(AppError::CheckpointError("disk full".into()));
        }
        state.upserts.push(entry.clone());
        state.entries.insert(entry.record_id.clone(), entry.clone());
        Ok(())
    }

    async fn is_done(&self, record_id: &str) -> Result<bool, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .get(record_id)
            .is_some_and(CheckpointEntry::is_done))
    }

    async fn compact(&self) -> Result<(), AppError> {
        self.state.lock().unwrap().compactions += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockSource / MockSink
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockSource {
    records: Result<Vec<Record>, String>,
}

impl MockSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: Ok(records),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            records: Err(message.to_string()),
        }
    }
}

impl RecordSource for MockSource {
    async fn load(&self) -> Result<Vec<Record>, AppError> {
        self.records.clone().map_err(AppError::InputError)
    }
}

type Written = (Vec<EnrichedRecord>, RunSummary);

#[derive(Clone, Default)]
pub struct MockSink {
    written: Arc<Mutex<Vec<Written>>>,
    fail: bool,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn written(&self) -> Vec<Written> {
        self.written.lock().unwrap().clone()
    }
}

impl ResultSink for MockSink {
    async fn write(&self, records: &[EnrichedRecord], summary: &RunSummary) -> Result<(), AppError> {
        if self.fail {
            return Err(AppError::SinkError("read-only output directory".into()));
        }
        self.written
            .lock()
            .unwrap()
            .push((records.to_vec(), summary.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that keeps a `Debug` rendering of every event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        self.events.lock().unwrap().push(format!("{event:?}"));
    }
}
