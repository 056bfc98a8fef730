use std::time::Duration;

use crate::compare::ComparisonPolicy;
use crate::error::AppError;
use crate::extract::FieldExtractor;
use crate::fetcher_pool::FetcherPool;
use crate::models::{EnrichmentPayload, Record, compute_hash};
use crate::traits::{ContentParser, PageFetcher, RecordOperation};

/// Per-record enrichment: fetch → parse → extract → compare.
///
/// Generic over the fetcher and parser, so tests run without a network.
pub struct EnrichmentService<F, P>
where
    F: PageFetcher,
    P: ContentParser,
{
    fetchers: FetcherPool<F>,
    extractor: FieldExtractor<P>,
    policy: ComparisonPolicy,
}

impl<F, P> EnrichmentService<F, P>
where
    F: PageFetcher,
    P: ContentParser,
{
    pub fn new(fetchers: FetcherPool<F>, extractor: FieldExtractor<P>, policy: ComparisonPolicy) -> Self {
        Self {
            fetchers,
            extractor,
            policy,
        }
    }

    /// Enrich one record, allowing the page request `timeout`.
    ///
    /// Waiting for a free fetcher is not part of `timeout`. The fetcher is
    /// returned to the pool as soon as the page is in hand, before parsing.
    pub async fn enrich(
        &self,
        record: &Record,
        timeout: Duration,
    ) -> Result<EnrichmentPayload, AppError> {
        let raw = {
            let fetcher = self.fetchers.acquire().await?;
            fetcher.fetch_within(&record.id, timeout).await?
        };
        tracing::debug!(
            record_id = %record.id,
            bytes = raw.len(),
            content_hash = %&compute_hash(&raw)[..8],
            "Fetched page"
        );

        let fields = self.extractor.extract(&raw)?;
        let comparisons = self.policy.compare_record(&record.known_fields, &fields);

        let found = fields.values().filter(|f| f.value.is_found()).count();
        tracing::debug!(
            record_id = %record.id,
            found,
            total = fields.len(),
            "Fields resolved"
        );

        Ok(EnrichmentPayload {
            fields,
            comparisons,
        })
    }
}

impl<F, P> RecordOperation for EnrichmentService<F, P>
where
    F: PageFetcher,
    P: ContentParser,
{
    async fn process(
        &self,
        record: &Record,
        _attempt: u32,
        timeout: Duration,
    ) -> Result<EnrichmentPayload, AppError> {
        self.enrich(record, timeout).await
    }
}
