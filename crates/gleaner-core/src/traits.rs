use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::content::PageContent;
use crate::error::AppError;
use crate::models::{CheckpointEntry, EnrichedRecord, EnrichmentPayload, Record, RunSummary};

/// Fetches raw page content for a URL.
///
/// Errors must already be classified: use [`AppError::retryable_fetch`] /
/// [`AppError::fatal_fetch`] (or the network/timeout variants) so the retry
/// controller can tell them apart.
pub trait PageFetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Fetch with `limit` bounding the request itself, failing with
    /// [`AppError::Timeout`] when it runs over. Wrappers that hold a request
    /// back (see [`crate::ThrottledFetcher`]) wait before the clock starts.
    fn fetch_within(
        &self,
        url: &str,
        limit: Duration,
    ) -> impl Future<Output = Result<String, AppError>> + Send {
        async move {
            tokio::time::timeout(limit, self.fetch(url))
                .await
                .unwrap_or(Err(AppError::Timeout(limit)))
        }
    }
}

/// Turns raw page text into the opaque key→value mapping the extractor reads.
pub trait ContentParser: Send + Sync + Clone {
    /// Fails with [`AppError::ExtractionError`] when the text has no usable
    /// structure at all.
    fn parse(&self, raw: &str) -> Result<PageContent, AppError>;
}

/// The per-record unit of work run by the scheduler: fetch, extract and
/// compare one record.
///
/// Called once per attempt. Errors must be classified; the scheduler retries
/// only those with [`AppError::is_retryable`].
pub trait RecordOperation: Send + Sync {
    /// `timeout` bounds the attempt's own work and running over it is an
    /// [`AppError::Timeout`]. Waiting for a shared resource first (a pooled
    /// fetcher, a per-host request slot) does not count against it.
    fn process(
        &self,
        record: &Record,
        attempt: u32,
        timeout: Duration,
    ) -> impl Future<Output = Result<EnrichmentPayload, AppError>> + Send;
}

/// Supplies the ordered input records.
pub trait RecordSource: Send + Sync {
    fn load(&self) -> impl Future<Output = Result<Vec<Record>, AppError>> + Send;
}

/// Persists the final enriched records and summary.
pub trait ResultSink: Send + Sync {
    fn write(
        &self,
        records: &[EnrichedRecord],
        summary: &RunSummary,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Durable per-record completion state.
///
/// Implementations need not guard against two writers for the same record:
/// the scheduler guarantees at most one in-flight owner per record id.
pub trait CheckpointStore: Send + Sync + Clone {
    /// Latest entry per record id. A store that does not exist yet is empty.
    fn load(
        &self,
    ) -> impl Future<Output = Result<HashMap<String, CheckpointEntry>, AppError>> + Send;

    /// Durably record `entry`, replacing any previous entry for its id.
    fn upsert(&self, entry: &CheckpointEntry) -> impl Future<Output = Result<(), AppError>> + Send;

    /// True iff the record finished as succeeded or partially succeeded.
    fn is_done(&self, record_id: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Drop superseded entries. No-op unless the backend keeps history.
    fn compact(&self) -> impl Future<Output = Result<(), AppError>> + Send {
        async { Ok(()) }
    }
}

/// A no-op ResultSink for use when output is handled elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ResultSink for NullSink {
    async fn write(&self, _records: &[EnrichedRecord], _summary: &RunSummary) -> Result<(), AppError> {
        Ok(())
    }
}

/// In-memory source over a fixed record list.
impl RecordSource for Vec<Record> {
    async fn load(&self) -> Result<Vec<Record>, AppError> {
        Ok(self.clone())
    }
}
