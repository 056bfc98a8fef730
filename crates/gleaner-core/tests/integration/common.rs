use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gleaner_core::{
    AppError, ComparisonPolicy, EnrichmentService, ExtractionRule, FetcherPool,
    FieldExtractionRuleSet, FieldExtractor, JsonContentParser, JsonlCheckpointStore, PageFetcher,
    Pipeline, Record, RetryPolicy, SchedulerConfig,
};

/// Serves canned JSON pages by URL and counts every fetch.
#[derive(Clone, Default)]
pub struct PageServer {
    pages: Arc<Mutex<HashMap<String, String>>>,
    /// URL → number of upcoming fetches that fail with HTTP 503.
    flaky: Arc<Mutex<HashMap<String, u32>>>,
    fetches: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl PageServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, body: serde_json::Value) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail_next(&self, url: &str, times: u32) {
        self.flaky.lock().unwrap().insert(url.to_string(), times);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl PageFetcher for PageServer {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(url)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(AppError::retryable_fetch("HTTP 503"));
            }
        }
        self.pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::fatal_fetch(format!("HTTP 404 for {url}")))
    }
}

pub fn rules() -> FieldExtractionRuleSet {
    FieldExtractionRuleSet::new(vec![
        ExtractionRule::labels("magnification", &["Objective Magnification", "Magnification"]),
        ExtractionRule::labels("species", &["Species", "Organism"]),
    ])
}

pub fn service(server: &PageServer) -> EnrichmentService<PageServer, JsonContentParser> {
    EnrichmentService::new(
        FetcherPool::replicate(server.clone(), 2).unwrap(),
        FieldExtractor::new(JsonContentParser::new(), rules()),
        ComparisonPolicy::default(),
    )
}

pub fn config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_workers(3)
        .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
        .with_item_timeout(Duration::from_secs(5))
}

pub async fn pipeline(checkpoint: &Path) -> Pipeline<JsonlCheckpointStore> {
    pipeline_with(checkpoint, config()).await
}

pub async fn pipeline_with(
    checkpoint: &Path,
    config: SchedulerConfig,
) -> Pipeline<JsonlCheckpointStore> {
    let store = JsonlCheckpointStore::open(checkpoint).await.unwrap();
    Pipeline::new(store, config).with_fields(rules().field_names().map(str::to_string))
}

/// `n` records at `https://data.example.org/ds/{i}`, each with a page.
pub fn dataset(n: usize) -> (Vec<Record>, PageServer) {
    let mut server = PageServer::new();
    let mut records = Vec::new();
    for i in 0..n {
        let url = format!("https://data.example.org/ds/{i}");
        server = server.page(
            &url,
            serde_json::json!({"magnification": "20X", "species": "Human"}),
        );
        records.push(Record::new(url).with_field("species", "human"));
    }
    (records, server)
}
