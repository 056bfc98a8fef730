pub mod checkpoint;
pub mod compare;
pub mod config;
pub mod content;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod fetcher_pool;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod throttle;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use checkpoint::JsonlCheckpointStore;
pub use compare::{
    AliasTable, ComparisonPolicy, ComparisonResult, ComparisonStatus, ToleranceRule, compare,
};
pub use config::EnrichmentConfig;
pub use content::{JsonContentParser, PageContent};
pub use enrich::EnrichmentService;
pub use error::{AppError, FailureClass};
pub use extract::{
    ExtractedFieldResult, ExtractedValue, ExtractionRule, FieldExtractionRuleSet, FieldExtractor,
    Selector, resolve_fields,
};
pub use fetcher_pool::FetcherPool;
pub use models::{
    CheckpointEntry, EnrichedRecord, EnrichmentPayload, ExitStatus, FailureKind, FailureReason,
    FieldMap, Record, RecordStatus, RunSummary, compute_hash,
};
pub use pipeline::{Pipeline, RunReport};
pub use retry::{RetryError, RetryPolicy, run_with_retry};
pub use scheduler::{
    Scheduler, SchedulerConfig, TracingWorkerReporter, WorkerEvent, WorkerReporter,
};
pub use throttle::{ThrottleConfig, ThrottledFetcher};
pub use traits::{
    CheckpointStore, ContentParser, NullSink, PageFetcher, RecordOperation,
    RecordSource, ResultSink,
};
