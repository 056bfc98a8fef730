use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::compare::{ComparisonResult, ComparisonStatus};
use crate::error::AppError;
use crate::extract::ExtractedFieldResult;

/// Field name → value.
pub type FieldMap = BTreeMap<String, String>;

/// Lifecycle of a record within a run.
///
/// Legal transitions: `Pending → InProgress → {Succeeded | Failed | PartiallySucceeded}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
    PartiallySucceeded,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::InProgress => "in_progress",
            RecordStatus::Succeeded => "succeeded",
            RecordStatus::Failed => "failed",
            RecordStatus::PartiallySucceeded => "partially_succeeded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordStatus::Succeeded | RecordStatus::Failed | RecordStatus::PartiallySucceeded
        )
    }

    /// Terminal and not worth reprocessing on a later run.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            RecordStatus::Succeeded | RecordStatus::PartiallySucceeded
        )
    }

    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        matches!(
            (self, next),
            (RecordStatus::Pending, RecordStatus::InProgress)
                | (
                    RecordStatus::InProgress,
                    RecordStatus::Succeeded
                        | RecordStatus::Failed
                        | RecordStatus::PartiallySucceeded
                )
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RecordStatus::Pending),
            "in_progress" => Ok(RecordStatus::InProgress),
            "succeeded" => Ok(RecordStatus::Succeeded),
            "failed" => Ok(RecordStatus::Failed),
            "partially_succeeded" => Ok(RecordStatus::PartiallySucceeded),
            _ => Err(format!("Unknown record status: {}", s)),
        }
    }
}

/// One unit of work: a page to fetch plus the values already known for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable key, also the URL handed to the fetcher.
    pub id: String,
    #[serde(default)]
    pub known_fields: FieldMap,
    #[serde(default)]
    pub status: RecordStatus,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            known_fields: FieldMap::new(),
            status: RecordStatus::Pending,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.known_fields.insert(field.into(), value.into());
        self
    }

    /// Move to `next`, rejecting anything outside the legal lifecycle.
    pub fn transition(&mut self, next: RecordStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                record_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Per-record result of a successful operation: extracted fields plus their
/// comparison against known values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentPayload {
    pub fields: BTreeMap<String, ExtractedFieldResult>,
    #[serde(default)]
    pub comparisons: Vec<ComparisonResult>,
}

impl EnrichmentPayload {
    /// Found values only, keyed by field name.
    pub fn values(&self) -> FieldMap {
        self.fields
            .iter()
            .filter_map(|(name, result)| {
                result
                    .value
                    .as_found()
                    .map(|v| (name.clone(), v.to_string()))
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.fields.values().all(|r| r.value.is_found())
            && !self
                .comparisons
                .iter()
                .any(|c| c.status == ComparisonStatus::Mismatch)
    }

    /// Terminal status this payload earns for its record.
    pub fn status(&self) -> RecordStatus {
        if self.is_complete() {
            RecordStatus::Succeeded
        } else {
            RecordStatus::PartiallySucceeded
        }
    }
}

/// Durable per-record completion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub record_id: String,
    pub status: RecordStatus,
    /// Attempts made by the run that wrote this entry.
    pub attempt_count: u32,
    /// Attempts across every run so far.
    #[serde(default)]
    pub total_attempts: u32,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_payload: Option<EnrichmentPayload>,
}

impl CheckpointEntry {
    pub fn succeeded(record_id: impl Into<String>, attempts: u32, payload: EnrichmentPayload) -> Self {
        Self {
            record_id: record_id.into(),
            status: payload.status(),
            attempt_count: attempts,
            total_attempts: attempts,
            last_error: None,
            completed_at: Some(Utc::now()),
            result_payload: Some(payload),
        }
    }

    pub fn failed(record_id: impl Into<String>, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            status: RecordStatus::Failed,
            attempt_count: attempts,
            total_attempts: attempts,
            last_error: Some(error.into()),
            completed_at: Some(Utc::now()),
            result_payload: None,
        }
    }

    /// Carry the cumulative attempt count over from an earlier run.
    pub fn with_prior_attempts(mut self, prior: u32) -> Self {
        self.total_attempts = prior.saturating_add(self.attempt_count);
        self
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }
}

/// Why a record ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retry budget ran out on a retryable error.
    Exhausted,
    /// Non-retryable error; no further attempts.
    Fatal,
    /// Run was cancelled before the record finished.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Exhausted => write!(f, "exhausted"),
            FailureKind::Fatal => write!(f, "fatal"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub record_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

/// Aggregate outcome of a run. Built once at the end of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub partially_succeeded: usize,
    pub failed: usize,
    /// Already done according to the checkpoint; not reprocessed.
    pub skipped: usize,
    pub failures: Vec<FailureReason>,
    /// Ruleset field → number of final records where it was found.
    #[serde(default)]
    pub field_completion: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.partially_succeeded + self.failed + self.skipped
    }

    /// Fold a partial (per-worker) summary into this one.
    pub fn merge(&mut self, other: RunSummary) {
        self.succeeded += other.succeeded;
        self.partially_succeeded += other.partially_succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
        for (field, count) in other.field_completion {
            *self.field_completion.entry(field).or_default() += count;
        }
    }

    /// Count one terminal status.
    pub fn count(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::Succeeded => self.succeeded += 1,
            RecordStatus::PartiallySucceeded => self.partially_succeeded += 1,
            RecordStatus::Failed => self.failed += 1,
            RecordStatus::Pending | RecordStatus::InProgress => {}
        }
    }
}

/// Process exit semantics derived from a [`RunSummary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    /// Nothing failed.
    Success,
    /// Some records failed, some did not.
    Partial,
    /// Every record failed, or the run could not start.
    Critical,
}

impl ExitStatus {
    pub fn from_summary(summary: &RunSummary) -> Self {
        let ok = summary.succeeded + summary.partially_succeeded + summary.skipped;
        if summary.failed == 0 {
            ExitStatus::Success
        } else if ok > 0 {
            ExitStatus::Partial
        } else {
            ExitStatus::Critical
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Partial => 1,
            ExitStatus::Critical => 2,
        }
    }
}

/// A record as it leaves the pipeline, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: Record,
    pub payload: Option<EnrichmentPayload>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// True when the outcome came from an earlier run's checkpoint.
    pub from_checkpoint: bool,
}

impl EnrichedRecord {
    pub fn extracted(&self) -> FieldMap {
        self.payload
            .as_ref()
            .map(EnrichmentPayload::values)
            .unwrap_or_default()
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
