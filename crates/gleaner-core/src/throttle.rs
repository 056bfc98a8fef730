//! Per-host request spacing.
//!
//! [`ThrottledFetcher`] wraps any [`PageFetcher`] so that requests to one
//! origin start at least `delay` (plus up to `jitter`) apart, however many
//! workers share the wrapper. Requests to different origins never wait on
//! each other. Waiting for a slot is not part of a request's
//! [`PageFetcher::fetch_within`] limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::error::AppError;
use crate::traits::PageFetcher;

/// Disabled by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Minimum spacing between requests to the same origin.
    pub delay: Duration,
    /// Maximum random jitter added on top of `delay` (uniform [0, jitter]).
    pub jitter: Duration,
}

impl ThrottleConfig {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.delay.is_zero() && self.jitter.is_zero()
    }

    /// `delay` plus a random share of `jitter`.
    fn spacing(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay;
        }
        let roll = (Uuid::new_v4().as_u128() % u128::from(jitter_ms)) as u64;
        self.delay + Duration::from_millis(roll)
    }
}

/// Clones share their schedule, so a [`crate::FetcherPool`] of clones is
/// throttled as one.
///
/// A caller books the next free start time for its origin under the lock
/// and sleeps outside it; concurrent callers therefore queue at the
/// configured rate.
#[derive(Clone)]
pub struct ThrottledFetcher<F> {
    inner: F,
    config: ThrottleConfig,
    /// Origin -> earliest start of the next request.
    schedule: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<F: PageFetcher> ThrottledFetcher<F> {
    pub fn new(inner: F, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            schedule: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Unparsable or opaque URLs are not throttled; the inner fetcher
    /// reports them.
    fn origin(url: &str) -> Option<String> {
        let origin = Url::parse(url).ok()?.origin();
        origin.is_tuple().then(|| origin.ascii_serialization())
    }

    async fn book(&self, origin: &str) -> Instant {
        let mut schedule = self.schedule.lock().await;
        let now = Instant::now();
        let start = match schedule.get(origin) {
            Some(&next) if next > now => next,
            _ => now,
        };
        schedule.insert(origin.to_string(), start + self.config.spacing());
        start
    }

    /// Sleep until this request's booked start time for its origin.
    async fn wait_turn(&self, url: &str) {
        if self.config.is_disabled() {
            return;
        }
        let Some(origin) = Self::origin(url) else {
            return;
        };
        let start = self.book(&origin).await;
        let wait = start.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            tracing::debug!(%origin, wait_ms = wait.as_millis() as u64, "Throttling request");
            tokio::time::sleep_until(start).await;
        }
    }
}

impl<F: PageFetcher> PageFetcher for ThrottledFetcher<F> {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.wait_turn(url).await;
        self.inner.fetch(url).await
    }

    /// The wait for the origin's slot is not part of `limit`.
    async fn fetch_within(&self, url: &str, limit: Duration) -> Result<String, AppError> {
        self.wait_turn(url).await;
        self.inner.fetch_within(url, limit).await
    }
}
